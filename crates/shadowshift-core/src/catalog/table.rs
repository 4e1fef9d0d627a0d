//! Table, column, foreign key, and index definitions.

use super::types::ColumnType;
use serde::{Deserialize, Serialize};

/// A sequence backing an auto-increment column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    /// Sequence name.
    pub name: String,
}

/// A column definition within a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column data type.
    pub column_type: ColumnType,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
    /// Whether the column rejects NULL.
    pub not_null: bool,
    /// Whether values are drawn from a sequence.
    pub auto_increment: bool,
    /// Sequence backing an auto-increment column.
    pub sequence: Option<Sequence>,
    /// Default expression, verbatim SQL.
    pub default_expression: Option<String>,
}

impl Column {
    /// Create a new nullable column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            primary_key: false,
            not_null: false,
            auto_increment: false,
            sequence: None,
            default_expression: None,
        }
    }

    /// Mark as primary key (implies NOT NULL).
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.not_null = true;
        self
    }

    /// Mark as NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Draw values from the given sequence.
    pub fn auto_increment(mut self, sequence: impl Into<String>) -> Self {
        let sequence = sequence.into();
        self.default_expression = Some(format!(
            "nextval({}::regclass)",
            crate::sql::quoted_literal(&sequence)
        ));
        self.auto_increment = true;
        self.sequence = Some(Sequence { name: sequence });
        self
    }

    /// Set the default expression.
    pub fn with_default(mut self, expression: impl Into<String>) -> Self {
        self.default_expression = Some(expression.into());
        self
    }

    /// Check if a value must always be present for this column.
    pub fn is_required(&self) -> bool {
        self.primary_key || self.not_null
    }
}

/// Action taken on referencing rows when a referenced row changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReferentialAction {
    /// Reject the change.
    #[default]
    NoAction,
    /// Reject the change immediately.
    Restrict,
    /// Propagate the change.
    Cascade,
    /// Set referencing columns to NULL.
    SetNull,
    /// Set referencing columns to their default.
    SetDefault,
}

impl ReferentialAction {
    /// SQL spelling of the action.
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

/// An outgoing foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,
    /// Columns in the owning table, positionally matched to `referred_columns`.
    pub referencing_columns: Vec<String>,
    /// Physical id of the referenced table.
    pub referred_table: String,
    /// Columns in the referenced table.
    pub referred_columns: Vec<String>,
    /// Action on update of the referenced row.
    pub on_update: ReferentialAction,
    /// Action on delete of the referenced row.
    pub on_delete: ReferentialAction,
}

impl ForeignKey {
    /// Create a foreign key with default (NO ACTION) behavior.
    pub fn new(
        name: impl Into<String>,
        referencing_columns: &[&str],
        referred_table: impl Into<String>,
        referred_columns: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            referencing_columns: referencing_columns.iter().map(|c| c.to_string()).collect(),
            referred_table: referred_table.into(),
            referred_columns: referred_columns.iter().map(|c| c.to_string()).collect(),
            on_update: ReferentialAction::NoAction,
            on_delete: ReferentialAction::NoAction,
        }
    }

    /// Set the delete action.
    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }

    /// Set the update action.
    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = action;
        self
    }

    /// The referenced column matching a referencing column.
    pub fn referred_column(&self, referencing_column: &str) -> Option<&str> {
        self.referencing_columns
            .iter()
            .position(|c| c == referencing_column)
            .and_then(|i| self.referred_columns.get(i))
            .map(String::as_str)
    }

    /// Column pairs `(referencing, referred)`.
    pub fn column_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.referencing_columns
            .iter()
            .map(String::as_str)
            .zip(self.referred_columns.iter().map(String::as_str))
    }
}

/// A secondary index, created only after data has been copied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Index name (unique within the schema).
    pub name: String,
    /// Indexed columns.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

/// A physical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Physical table id.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<Column>,
    /// Outgoing foreign keys.
    pub foreign_keys: Vec<ForeignKey>,
    /// Secondary indexes.
    pub indexes: Vec<Index>,
}

impl Table {
    /// Create an empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Add a column.
    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a foreign key.
    pub fn with_foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Add an index.
    pub fn with_index(mut self, name: impl Into<String>, columns: &[&str], unique: bool) -> Self {
        self.indexes.push(Index {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique,
        });
        self
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check if the table has a column.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Primary key columns in declaration order.
    pub fn primary_key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    /// Names of the primary key columns.
    pub fn primary_key_names(&self) -> Vec<&str> {
        self.primary_key_columns().map(|c| c.name.as_str()).collect()
    }

    /// The outgoing foreign key a column participates in, if any.
    pub fn outgoing_foreign_key(&self, column: &str) -> Option<&ForeignKey> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.referencing_columns.iter().any(|c| c == column))
    }

    /// Check if any foreign key points back at this table.
    pub fn is_self_referencing(&self) -> bool {
        self.foreign_keys.iter().any(|fk| fk.referred_table == self.name)
    }

    /// Copy this table under a new physical id.
    ///
    /// Index names are suffixed with the new id since PostgreSQL requires
    /// them to be unique within a schema. Foreign keys still point at the
    /// original referenced tables.
    pub fn forked(&self, new_name: &str) -> Table {
        let mut table = self.clone();
        table.name = new_name.to_string();
        for index in &mut table.indexes {
            index.name = fork_index_name(&index.name, new_name);
        }
        table
    }
}

fn fork_index_name(index: &str, table_id: &str) -> String {
    let digest = blake3::hash(format!("{table_id}/{index}").as_bytes());
    let suffix = hex::encode(&digest.as_bytes()[..4]);
    let base: String = index.chars().take(50).collect();
    format!("{base}_{suffix}")
}
