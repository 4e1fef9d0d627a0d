//! SQL text helpers shared by every statement generator.

/// Quote an identifier (table, column, trigger, function, sequence name).
pub fn quoted(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Quote a string literal.
pub fn quoted_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote each identifier and join them with `, `.
pub fn quoted_list<'a>(identifiers: impl IntoIterator<Item = &'a str>) -> String {
    identifiers
        .into_iter()
        .map(quoted)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Qualify a quoted column with a row alias, e.g. `NEW."id"` or `s."id"`.
pub fn qualified(alias: &str, column: &str) -> String {
    format!("{alias}.{}", quoted(column))
}

/// Render a positional parameter with an explicit cast, e.g. `$1::bigint`.
pub fn parameter(position: usize, sql_type: &str) -> String {
    format!("${position}::{sql_type}")
}
