//! Column types, runtime values, and placeholder value generation.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sql::quoted_literal;

/// PostgreSQL column types understood by the migration engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// 16-bit signed integer.
    SmallInt,
    /// 32-bit signed integer.
    Integer,
    /// 64-bit signed integer.
    BigInt,
    /// 32-bit floating point.
    Real,
    /// 64-bit floating point.
    DoublePrecision,
    /// Arbitrary precision decimal.
    Numeric,
    /// Boolean value.
    Boolean,
    /// Unbounded UTF-8 string.
    Text,
    /// Variable length string with a maximum length.
    Varchar(u32),
    /// Fixed length, blank padded string.
    Char(u32),
    /// UUID (128-bit identifier).
    Uuid,
    /// Calendar date.
    Date,
    /// Timestamp without time zone.
    Timestamp,
    /// Timestamp with time zone.
    TimestampTz,
    /// Binary data.
    Bytea,
    /// Textual JSON.
    Json,
    /// Binary JSON.
    Jsonb,
}

impl ColumnType {
    /// The SQL spelling of this type, as used in DDL and casts.
    pub fn sql_type(&self) -> String {
        match self {
            ColumnType::SmallInt => "smallint".to_string(),
            ColumnType::Integer => "integer".to_string(),
            ColumnType::BigInt => "bigint".to_string(),
            ColumnType::Real => "real".to_string(),
            ColumnType::DoublePrecision => "double precision".to_string(),
            ColumnType::Numeric => "numeric".to_string(),
            ColumnType::Boolean => "boolean".to_string(),
            ColumnType::Text => "text".to_string(),
            ColumnType::Varchar(len) => format!("varchar({len})"),
            ColumnType::Char(len) => format!("char({len})"),
            ColumnType::Uuid => "uuid".to_string(),
            ColumnType::Date => "date".to_string(),
            ColumnType::Timestamp => "timestamp".to_string(),
            ColumnType::TimestampTz => "timestamptz".to_string(),
            ColumnType::Bytea => "bytea".to_string(),
            ColumnType::Json => "json".to_string(),
            ColumnType::Jsonb => "jsonb".to_string(),
        }
    }

    /// Check if this type is an integer type usable for range batching.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ColumnType::SmallInt | ColumnType::Integer | ColumnType::BigInt
        )
    }

    /// Generate a synthetic value for a placeholder row.
    ///
    /// When `unique` is set the value is drawn at random so that it is very
    /// unlikely to collide with an existing key; otherwise a neutral value
    /// (zero, empty, epoch) is produced.
    pub fn generate_value(&self, unique: bool) -> Value {
        let mut rng = rand::thread_rng();
        match self {
            ColumnType::SmallInt if unique => Value::Int16(rng.gen_range(i16::MAX / 2..i16::MAX)),
            ColumnType::SmallInt => Value::Int16(0),
            ColumnType::Integer if unique => Value::Int32(rng.gen_range(i32::MAX / 2..i32::MAX)),
            ColumnType::Integer => Value::Int32(0),
            ColumnType::BigInt if unique => Value::Int64(rng.gen_range(i64::MAX / 2..i64::MAX)),
            ColumnType::BigInt => Value::Int64(0),
            ColumnType::Real | ColumnType::DoublePrecision => Value::Float64(0.0),
            ColumnType::Numeric => Value::Numeric("0".to_string()),
            ColumnType::Boolean => Value::Bool(false),
            ColumnType::Text => Value::Text(if unique { random_token(&mut rng, 16) } else { String::new() }),
            ColumnType::Varchar(len) | ColumnType::Char(len) => {
                let len = (*len as usize).min(16);
                Value::Text(if unique { random_token(&mut rng, len) } else { String::new() })
            }
            ColumnType::Uuid if unique => Value::Uuid(Uuid::new_v4()),
            ColumnType::Uuid => Value::Uuid(Uuid::nil()),
            ColumnType::Date => Value::Date(NaiveDate::default()),
            ColumnType::Timestamp => Value::Timestamp(NaiveDateTime::default()),
            ColumnType::TimestampTz => Value::TimestampTz(DateTime::<Utc>::default()),
            ColumnType::Bytea => Value::Bytes(Vec::new()),
            ColumnType::Json | ColumnType::Jsonb => {
                Value::Json(serde_json::Value::Object(Default::default()))
            }
        }
    }
}

fn random_token(rng: &mut impl Rng, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A runtime value bound to a statement parameter or rendered as a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 16-bit signed integer.
    Int16(i16),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit floating point.
    Float64(f64),
    /// Decimal in its textual form.
    Numeric(String),
    /// UTF-8 string.
    Text(String),
    /// Binary data.
    Bytes(Vec<u8>),
    /// UUID.
    Uuid(Uuid),
    /// Calendar date.
    Date(NaiveDate),
    /// Timestamp without time zone.
    Timestamp(NaiveDateTime),
    /// Timestamp with time zone.
    TimestampTz(DateTime<Utc>),
    /// JSON document.
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render this value as a SQL literal, for embedding in generated
    /// function bodies where parameters cannot be bound.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::Int16(v) => v.to_string(),
            Value::Int32(v) => v.to_string(),
            Value::Int64(v) => v.to_string(),
            Value::Float64(v) if v.is_finite() => format!("{v:?}"),
            Value::Float64(v) => format!("{}::double precision", quoted_literal(&v.to_string())),
            Value::Numeric(v) => format!("{}::numeric", quoted_literal(v)),
            Value::Text(v) => quoted_literal(v),
            Value::Bytes(v) => format!("'\\x{}'::bytea", hex::encode(v)),
            Value::Uuid(v) => format!("'{v}'::uuid"),
            Value::Date(v) => format!("'{v}'::date"),
            Value::Timestamp(v) => format!("'{v}'::timestamp"),
            Value::TimestampTz(v) => format!("'{}'::timestamptz", v.to_rfc3339()),
            Value::Json(v) => format!("{}::jsonb", quoted_literal(&v.to_string())),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_sql_literal())
    }
}
