//! Table and column abstraction used by projections.
//!
//! A [`Table`] is the in-memory description of a projection table: its name,
//! a single key column and the data columns. Column maps resolve against it
//! (adding columns on demand) and the writer turns it into DDL.
//!
//! Every projection table carries a leading `tenant_id` column and the stored
//! primary key is `(tenant_id, key)`, so rows of different tenants never meet.

use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

/// Column holding the owning tenant in every projection table.
pub const TENANT_COLUMN: &str = "tenant_id";

/// Column type for projection tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    /// JSON document stored as TEXT.
    Json,
}

impl ColumnType {
    /// Converts to SQLite type string.
    pub fn to_sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Boolean => "INTEGER", // SQLite stores booleans as integers
            ColumnType::Json => "TEXT",
        }
    }

    /// True for types that support arithmetic updates.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Real)
    }
}

/// Definition of a column in a projection table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub primary_key: bool,
    /// SQL literal used as the column default, if any.
    pub default_value: Option<String>,
}

impl TableColumn {
    /// A nullable column without a default.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            primary_key: false,
            default_value: None,
        }
    }

    /// A counter column: `NOT NULL DEFAULT 0`.
    pub fn counter(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            primary_key: false,
            default_value: Some("0".to_string()),
        }
    }

    /// Column definition as it appears in `CREATE TABLE` / `ADD COLUMN`.
    pub fn ddl(&self) -> String {
        let mut ddl = format!("{} {}", self.name, self.column_type.to_sql());
        if self.primary_key {
            ddl.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default_value {
            ddl.push_str(" NOT NULL DEFAULT ");
            ddl.push_str(default);
        }
        ddl
    }
}

/// Schema of one projection table.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    name: String,
    columns: Vec<TableColumn>,
}

impl Table {
    /// Creates a table with a single primary key column.
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>, key_type: ColumnType) -> Self {
        let key = TableColumn {
            name: primary_key.into(),
            column_type: key_type,
            primary_key: true,
            default_value: None,
        };
        Self {
            name: name.into(),
            columns: vec![key],
        }
    }

    /// Adds a column (builder pattern).
    pub fn with_column(mut self, column: TableColumn) -> Self {
        self.add_column(column);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The primary key column.
    pub fn primary_key(&self) -> &TableColumn {
        // `new` always installs the key as the first column
        &self.columns[0]
    }

    pub fn columns(&self) -> &[TableColumn] {
        &self.columns
    }

    /// Returns the existing column with this name, if any.
    pub fn column_for(&self, name: &str) -> Option<&TableColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Adds a column unless one with the same name exists; returns the stored column.
    pub fn add_column(&mut self, column: TableColumn) -> &TableColumn {
        let index = match self.columns.iter().position(|c| c.name == column.name) {
            Some(index) => index,
            None => {
                self.columns.push(column);
                self.columns.len() - 1
            }
        };
        &self.columns[index]
    }

    /// Checks that every identifier is safe to splice into SQL.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.name)?;
        for column in &self.columns {
            validate_identifier(&column.name)?;
            if column.name == TENANT_COLUMN {
                return Err(Error::Configuration(format!(
                    "table '{}' may not declare the reserved column '{}'",
                    self.name, TENANT_COLUMN
                )));
            }
        }
        Ok(())
    }

    /// `CREATE TABLE IF NOT EXISTS` for this schema under `table_name`.
    pub fn create_sql(&self, table_name: &str) -> String {
        let mut columns = vec![format!("{} TEXT NOT NULL", TENANT_COLUMN)];
        columns.extend(self.columns.iter().map(TableColumn::ddl));
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}, {}))",
            table_name,
            columns.join(", "),
            TENANT_COLUMN,
            self.primary_key().name
        )
    }
}

/// Rejects anything but ASCII letters, digits and underscores (not leading digit).
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(Error::Configuration(format!("'{}' is not a valid SQL identifier", name)))
    }
}

/// Converts a JSON value to an owned SQL parameter.
pub fn json_value_to_sql(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Text(n.to_string())
            }
        }
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Converts a column value read back from SQLite into JSON.
pub fn sql_value_to_json(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Text(bytes) => JsonValue::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => JsonValue::Array(bytes.iter().map(|b| JsonValue::from(*b)).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_sql() {
        let table = Table::new("counters", "id", ColumnType::Text)
            .with_column(TableColumn::counter("open", ColumnType::Integer))
            .with_column(TableColumn::new("name", ColumnType::Text));

        assert_eq!(
            table.create_sql("counters"),
            "CREATE TABLE IF NOT EXISTS counters (tenant_id TEXT NOT NULL, id TEXT NOT NULL, \
             open INTEGER NOT NULL DEFAULT 0, name TEXT, PRIMARY KEY (tenant_id, id))"
        );
        assert_eq!(table.primary_key().name, "id");
    }

    #[test]
    fn test_add_column_keeps_existing() {
        let mut table = Table::new("t", "id", ColumnType::Text);
        table.add_column(TableColumn::new("amount", ColumnType::Real));
        let again = table.add_column(TableColumn::new("amount", ColumnType::Text)).clone();

        assert_eq!(again.column_type, ColumnType::Real);
        assert_eq!(table.columns().len(), 2);
    }

    #[test]
    fn test_reserved_tenant_column_rejected() {
        let table = Table::new("t", "id", ColumnType::Text)
            .with_column(TableColumn::new(TENANT_COLUMN, ColumnType::Text));
        assert!(matches!(table.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("distance_total").is_ok());
        assert!(validate_identifier("_x1").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("drop table;").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_json_to_sql_values() {
        assert_eq!(json_value_to_sql(&serde_json::json!(3)), SqlValue::Integer(3));
        assert_eq!(json_value_to_sql(&serde_json::json!(2.5)), SqlValue::Real(2.5));
        assert_eq!(json_value_to_sql(&serde_json::json!(true)), SqlValue::Integer(1));
        assert_eq!(json_value_to_sql(&serde_json::json!("a")), SqlValue::Text("a".into()));
        assert_eq!(json_value_to_sql(&JsonValue::Null), SqlValue::Null);
    }
}
