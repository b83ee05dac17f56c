//! Declarative column update rules.
//!
//! Each [`ColumnMap`] is bound to one column and knows four things:
//!
//! ```text
//!                 row missing                     row exists
//! event ──► INSERT ... VALUES (insert_expr) ──► ON CONFLICT DO UPDATE SET update_sql
//!                 ▲                                       ▲
//!                 └────── :p_<column> (requires_input) ───┘
//! ```
//!
//! Rules that need a payload value (`requires_input`) read it through a
//! [`FieldPath`] and bind it as the named parameter `:p_<column>`.

use std::fmt;

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::flattened::table::{ColumnType, Table, TableColumn};

// =============================================================================
// Field Paths
// =============================================================================

/// Dotted path into a JSON payload, e.g. `route.distance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Splits a dotted path. Use [`FieldPath::validate`] before relying on it.
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path.split('.').map(str::to_string).collect(),
        }
    }

    /// Fails if any segment is empty.
    pub fn validate(&self) -> Result<()> {
        if self.segments.iter().any(|s| s.is_empty()) {
            return Err(Error::Configuration(format!("'{}' is not a valid field path", self)));
        }
        Ok(())
    }

    /// Looks the path up in `value`; `None` if any segment is absent.
    pub fn extract<'a>(&self, value: &'a JsonValue) -> Option<&'a JsonValue> {
        self.segments
            .iter()
            .try_fold(value, |current, segment| current.get(segment.as_str()))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

// =============================================================================
// Column Maps
// =============================================================================

/// One column update rule.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnMap {
    /// `+1` per event. New rows start at 1.
    Increment { column: String },
    /// `-1` per event. New rows start at 0.
    Decrement { column: String },
    /// Adds a payload value.
    IncrementBy {
        column: String,
        source: FieldPath,
        column_type: ColumnType,
    },
    /// Subtracts a payload value.
    DecrementBy {
        column: String,
        source: FieldPath,
        column_type: ColumnType,
    },
    /// Overwrites with a payload value.
    Set {
        column: String,
        source: FieldPath,
        column_type: ColumnType,
    },
    /// Keeps the larger of the stored and the payload value.
    Max {
        column: String,
        source: FieldPath,
        column_type: ColumnType,
    },
    /// Keeps the smaller of the stored and the payload value.
    Min {
        column: String,
        source: FieldPath,
        column_type: ColumnType,
    },
}

impl ColumnMap {
    pub fn column_name(&self) -> &str {
        match self {
            ColumnMap::Increment { column }
            | ColumnMap::Decrement { column }
            | ColumnMap::IncrementBy { column, .. }
            | ColumnMap::DecrementBy { column, .. }
            | ColumnMap::Set { column, .. }
            | ColumnMap::Max { column, .. }
            | ColumnMap::Min { column, .. } => column,
        }
    }

    /// Named parameter carrying this rule's input value.
    pub fn parameter_name(&self) -> String {
        format!(":p_{}", self.column_name())
    }

    /// True if the rule reads a value from the event payload.
    pub fn requires_input(&self) -> bool {
        !matches!(self, ColumnMap::Increment { .. } | ColumnMap::Decrement { .. })
    }

    /// The payload path this rule reads.
    ///
    /// Asking a rule that takes no input is a mapping mistake and fails with
    /// `NotSupported`.
    pub fn value_accessor(&self) -> Result<&FieldPath> {
        match self {
            ColumnMap::IncrementBy { source, .. }
            | ColumnMap::DecrementBy { source, .. }
            | ColumnMap::Set { source, .. }
            | ColumnMap::Max { source, .. }
            | ColumnMap::Min { source, .. } => Ok(source),
            ColumnMap::Increment { column } | ColumnMap::Decrement { column } => Err(Error::NotSupported(format!(
                "column map for '{}' takes no input value",
                column
            ))),
        }
    }

    fn wanted_column(&self) -> TableColumn {
        match self {
            ColumnMap::Increment { column } | ColumnMap::Decrement { column } => {
                TableColumn::counter(column.clone(), ColumnType::Integer)
            }
            ColumnMap::IncrementBy { column, column_type, .. } | ColumnMap::DecrementBy { column, column_type, .. } => {
                TableColumn::counter(column.clone(), *column_type)
            }
            ColumnMap::Set { column, column_type, .. }
            | ColumnMap::Max { column, column_type, .. }
            | ColumnMap::Min { column, column_type, .. } => TableColumn::new(column.clone(), *column_type),
        }
    }

    fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            ColumnMap::Increment { .. }
                | ColumnMap::Decrement { .. }
                | ColumnMap::IncrementBy { .. }
                | ColumnMap::DecrementBy { .. }
        )
    }

    /// Returns the table's column for this rule, adding it if absent.
    ///
    /// Idempotent: a second call finds the column the first one added.
    pub fn resolve_column(&self, table: &mut Table) -> Result<TableColumn> {
        let wanted = self.wanted_column();

        if let Some(existing) = table.column_for(&wanted.name) {
            if existing.primary_key {
                return Err(Error::Configuration(format!(
                    "column map may not target key column '{}' of table '{}'",
                    existing.name,
                    table.name()
                )));
            }
            if self.is_arithmetic() && !existing.column_type.is_numeric() {
                return Err(Error::Configuration(format!(
                    "column '{}' of table '{}' is {:?}, but the rule needs a numeric column",
                    existing.name,
                    table.name(),
                    existing.column_type
                )));
            }
            return Ok(existing.clone());
        }

        if self.is_arithmetic() && !wanted.column_type.is_numeric() {
            return Err(Error::Configuration(format!(
                "column '{}' must be numeric for an arithmetic rule",
                wanted.name
            )));
        }

        Ok(table.add_column(wanted).clone())
    }

    /// Value written when the event creates the row.
    pub fn to_insert_expression(&self) -> String {
        let param = self.parameter_name();
        match self {
            ColumnMap::Increment { .. } => "1".to_string(),
            ColumnMap::Decrement { .. } => "0".to_string(),
            ColumnMap::IncrementBy { .. } => format!("COALESCE({}, 0)", param),
            ColumnMap::DecrementBy { .. } => format!("0 - COALESCE({}, 0)", param),
            ColumnMap::Set { .. } | ColumnMap::Max { .. } | ColumnMap::Min { .. } => param,
        }
    }

    /// Assignment applied when the row already exists.
    ///
    /// `table_name` qualifies the stored value, which matters when the same
    /// rule writes a shadow table during a rebuild.
    pub fn update_field_sql(&self, table_name: &str) -> String {
        let column = self.column_name();
        let param = self.parameter_name();
        match self {
            ColumnMap::Increment { .. } => format!("{column} = {table_name}.{column} + 1"),
            ColumnMap::Decrement { .. } => format!("{column} = {table_name}.{column} - 1"),
            ColumnMap::IncrementBy { .. } => format!("{column} = {table_name}.{column} + COALESCE({param}, 0)"),
            ColumnMap::DecrementBy { .. } => format!("{column} = {table_name}.{column} - COALESCE({param}, 0)"),
            ColumnMap::Set { .. } => format!("{column} = {param}"),
            ColumnMap::Max { .. } => {
                format!("{column} = MAX(COALESCE({table_name}.{column}, {param}), COALESCE({param}, {table_name}.{column}))")
            }
            ColumnMap::Min { .. } => {
                format!("{column} = MIN(COALESCE({table_name}.{column}, {param}), COALESCE({param}, {table_name}.{column}))")
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
