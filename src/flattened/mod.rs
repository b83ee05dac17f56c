//! Flattened projections: table columns updated directly from events.
//!
//! Instead of folding events into an aggregate object, a flattened projection
//! declares per event type how each column changes ([`ColumnMap`]), and
//! [`FlatTableProjection::compile`] turns those rules into upsert statements.

mod column_map;
mod projection;
mod table;

pub use column_map::{ColumnMap, FieldPath};
pub use projection::{CompiledFlatTable, FlatTableProjection, KeySource, StatementMap};
pub use table::{
    json_value_to_sql, sql_value_to_json, validate_identifier, ColumnType, Table, TableColumn, TENANT_COLUMN,
};
