//! Flat table projections: per-event column rules compiled to upserts.
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use spitefold::flattened::{ColumnType, FlatTableProjection};
//! use spitefold::DomainEvent;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Travel { day: u32, distance: f64 }
//! impl DomainEvent for Travel { const EVENT_TYPE: &'static str = "travel"; }
//!
//! let projection = FlatTableProjection::new("Distance", "distance", "id", ColumnType::Text)
//!     .project::<Travel>(|map| {
//!         map.set("day", "day", ColumnType::Integer)
//!             .set("total", "distance", ColumnType::Real)
//!             .increment("legs");
//!     })
//!     .compile()?;
//! # Ok::<(), spitefold::Error>(())
//! ```
//!
//! Compilation resolves every rule against the table (adding columns as
//! needed) and renders one statement per event type, for both the live table
//! and the rebuild shadow table. Any mistake surfaces here, before a shard runs.

use std::collections::HashMap;

use rusqlite::types::Value as SqlValue;

use crate::codec::DomainEvent;
use crate::error::{Error, Result};
use crate::flattened::column_map::{ColumnMap, FieldPath};
use crate::flattened::table::{json_value_to_sql, validate_identifier, ColumnType, Table, TENANT_COLUMN};
use crate::projection::{ApplyContext, Projection, ShardDefinition, ShardLayout, TableTarget};
use crate::storage::ProjectionOp;
use crate::types::Event;

/// Where the row key comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// The event's stream identity (UUID or string key).
    StreamIdentity,
    /// A payload field.
    Field(FieldPath),
}

/// The rules one event type applies, collected by [`FlatTableProjection::project`].
#[derive(Debug, Clone, Default)]
pub struct StatementMap {
    maps: Vec<ColumnMap>,
    key: Option<KeySource>,
}

impl StatementMap {
    pub fn increment(&mut self, column: &str) -> &mut Self {
        self.maps.push(ColumnMap::Increment {
            column: column.to_string(),
        });
        self
    }

    pub fn decrement(&mut self, column: &str) -> &mut Self {
        self.maps.push(ColumnMap::Decrement {
            column: column.to_string(),
        });
        self
    }

    pub fn increment_by(&mut self, column: &str, path: &str, column_type: ColumnType) -> &mut Self {
        self.maps.push(ColumnMap::IncrementBy {
            column: column.to_string(),
            source: FieldPath::parse(path),
            column_type,
        });
        self
    }

    pub fn decrement_by(&mut self, column: &str, path: &str, column_type: ColumnType) -> &mut Self {
        self.maps.push(ColumnMap::DecrementBy {
            column: column.to_string(),
            source: FieldPath::parse(path),
            column_type,
        });
        self
    }

    pub fn set(&mut self, column: &str, path: &str, column_type: ColumnType) -> &mut Self {
        self.maps.push(ColumnMap::Set {
            column: column.to_string(),
            source: FieldPath::parse(path),
            column_type,
        });
        self
    }

    pub fn max(&mut self, column: &str, path: &str, column_type: ColumnType) -> &mut Self {
        self.maps.push(ColumnMap::Max {
            column: column.to_string(),
            source: FieldPath::parse(path),
            column_type,
        });
        self
    }

    pub fn min(&mut self, column: &str, path: &str, column_type: ColumnType) -> &mut Self {
        self.maps.push(ColumnMap::Min {
            column: column.to_string(),
            source: FieldPath::parse(path),
            column_type,
        });
        self
    }

    /// Takes the row key from a payload field instead of the stream identity.
    pub fn key_from(&mut self, path: &str) -> &mut Self {
        self.key = Some(KeySource::Field(FieldPath::parse(path)));
        self
    }
}

enum Handler {
    Project(StatementMap),
    Delete(Option<KeySource>),
}

/// Builder for a flat table projection. Call [`compile`](Self::compile) to use it.
pub struct FlatTableProjection {
    name: String,
    table: Table,
    handlers: Vec<(String, Handler)>,
    layout: ShardLayout,
}

impl FlatTableProjection {
    /// A projection named `name` writing table `table_name`, keyed by `key_column`.
    pub fn new(name: &str, table_name: &str, key_column: &str, key_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            table: Table::new(table_name, key_column, key_type),
            handlers: Vec::new(),
            layout: ShardLayout::Single,
        }
    }

    /// Upserts a row for every `E`, applying the rules `configure` declares.
    pub fn project<E: DomainEvent>(self, configure: impl FnOnce(&mut StatementMap)) -> Self {
        self.project_type(E::EVENT_TYPE, configure)
    }

    /// Untyped form of [`project`](Self::project).
    pub fn project_type(mut self, event_type: &str, configure: impl FnOnce(&mut StatementMap)) -> Self {
        let mut map = StatementMap::default();
        configure(&mut map);
        self.handlers.push((event_type.to_string(), Handler::Project(map)));
        self
    }

    /// Deletes the stream's row on every `E`.
    pub fn delete<E: DomainEvent>(self) -> Self {
        self.delete_type(E::EVENT_TYPE, None)
    }

    /// Deletes the row whose key is the payload field at `path`.
    pub fn delete_by_field<E: DomainEvent>(self, path: &str) -> Self {
        self.delete_type(E::EVENT_TYPE, Some(KeySource::Field(FieldPath::parse(path))))
    }

    fn delete_type(mut self, event_type: &str, key: Option<KeySource>) -> Self {
        self.handlers.push((event_type.to_string(), Handler::Delete(key)));
        self
    }

    /// Runs one shard per stream type instead of a single `All` shard.
    pub fn shard_by_stream_types<I, S>(mut self, stream_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.layout = ShardLayout::PerStreamType(stream_types.into_iter().map(Into::into).collect());
        self
    }

    /// Validates every rule and renders the statements.
    pub fn compile(self) -> Result<CompiledFlatTable> {
        let FlatTableProjection {
            name,
            mut table,
            handlers,
            layout,
        } = self;

        table.validate()?;
        if handlers.is_empty() {
            return Err(Error::Configuration(format!("projection '{}' handles no events", name)));
        }

        // Resolve every column first so statements see the final table.
        for (event_type, handler) in &handlers {
            if let Handler::Project(map) = handler {
                if map.maps.is_empty() {
                    return Err(Error::Configuration(format!(
                        "projection '{}' maps no columns for '{}'",
                        name, event_type
                    )));
                }
                let mut seen = Vec::new();
                for column_map in &map.maps {
                    validate_identifier(column_map.column_name())?;
                    if seen.contains(&column_map.column_name()) {
                        return Err(Error::Configuration(format!(
                            "projection '{}' maps column '{}' twice for '{}'",
                            name,
                            column_map.column_name(),
                            event_type
                        )));
                    }
                    seen.push(column_map.column_name());
                    column_map.resolve_column(&mut table)?;
                }
            }
        }

        let mut statements = HashMap::new();
        for (event_type, handler) in handlers {
            let statement = match handler {
                Handler::Project(map) => Statement::upsert(&table, map)?,
                Handler::Delete(key) => Statement::delete(&table, key.unwrap_or(KeySource::StreamIdentity))?,
            };
            if statements.insert(event_type.clone(), statement).is_some() {
                return Err(Error::Configuration(format!(
                    "projection '{}' declares '{}' more than once",
                    name, event_type
                )));
            }
        }

        Ok(CompiledFlatTable {
            name,
            table,
            statements,
            layout,
        })
    }
}

// =============================================================================
// Compiled Form
// =============================================================================

/// The SQL one event type contributes, rendered for both table targets.
#[derive(Debug, Clone)]
struct Statement {
    key: KeySource,
    inputs: Vec<(String, FieldPath)>,
    live_sql: String,
    rebuild_sql: String,
}

impl Statement {
    fn upsert(table: &Table, map: StatementMap) -> Result<Self> {
        let key = map.key.unwrap_or(KeySource::StreamIdentity);
        if let KeySource::Field(path) = &key {
            path.validate()?;
        }

        let mut inputs = Vec::new();
        for column_map in &map.maps {
            if column_map.requires_input() {
                let path = column_map.value_accessor()?;
                path.validate()?;
                inputs.push((column_map.parameter_name(), path.clone()));
            }
        }

        let render = |table_name: &str| {
            let columns: Vec<&str> = map.maps.iter().map(ColumnMap::column_name).collect();
            let values: Vec<String> = map.maps.iter().map(ColumnMap::to_insert_expression).collect();
            let updates: Vec<String> = map.maps.iter().map(|m| m.update_field_sql(table_name)).collect();
            let key_column = &table.primary_key().name;
            format!(
                "INSERT INTO {table_name} ({TENANT_COLUMN}, {key_column}, {}) VALUES (:tenant, :key, {}) \
                 ON CONFLICT({TENANT_COLUMN}, {key_column}) DO UPDATE SET {}",
                columns.join(", "),
                values.join(", "),
                updates.join(", ")
            )
        };

        Ok(Self {
            key,
            inputs,
            live_sql: render(&TableTarget::Live.table_name(table.name())),
            rebuild_sql: render(&TableTarget::Rebuild.table_name(table.name())),
        })
    }

    fn delete(table: &Table, key: KeySource) -> Result<Self> {
        if let KeySource::Field(path) = &key {
            path.validate()?;
        }
        let key_column = &table.primary_key().name;
        let render =
            |table_name: &str| format!("DELETE FROM {table_name} WHERE {TENANT_COLUMN} = :tenant AND {key_column} = :key");

        Ok(Self {
            key,
            inputs: Vec::new(),
            live_sql: render(&TableTarget::Live.table_name(table.name())),
            rebuild_sql: render(&TableTarget::Rebuild.table_name(table.name())),
        })
    }

    fn sql(&self, target: TableTarget) -> &str {
        match target {
            TableTarget::Live => &self.live_sql,
            TableTarget::Rebuild => &self.rebuild_sql,
        }
    }
}

/// A validated flat table projection, ready to register with the daemon.
pub struct CompiledFlatTable {
    name: String,
    table: Table,
    statements: HashMap<String, Statement>,
    layout: ShardLayout,
}

impl CompiledFlatTable {
    /// The resolved table schema.
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Event types with a compiled statement, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.statements.keys().cloned().collect();
        types.sort();
        types
    }

    /// The SQL executed for `event_type` against the live table.
    pub fn statement_sql(&self, event_type: &str) -> Option<&str> {
        self.statements.get(event_type).map(|s| s.live_sql.as_str())
    }

    /// Renders the write for one event; `None` for event types it does not handle.
    pub fn op_for(&self, ctx: &ApplyContext<'_>, event: &Event) -> Result<Option<ProjectionOp>> {
        let Some(statement) = self.statements.get(&event.event_type) else {
            return Ok(None);
        };

        let payload = ctx.serializer.from_bytes(&event.data)?;

        let key = match &statement.key {
            KeySource::StreamIdentity => SqlValue::Text(event.stream.storage_key()),
            KeySource::Field(path) => match path.extract(&payload) {
                Some(value) if !value.is_null() => json_value_to_sql(value),
                _ => {
                    tracing::warn!(
                        projection = %self.name,
                        event_id = %event.event_id,
                        field = %path,
                        "event has no key value; skipped"
                    );
                    return Ok(None);
                }
            },
        };

        let mut op = ProjectionOp::new(statement.sql(ctx.target))
            .bind(":tenant", SqlValue::Text(event.tenant.as_str().to_string()))
            .bind(":key", key);
        for (param, path) in &statement.inputs {
            let value = path.extract(&payload).map(json_value_to_sql).unwrap_or(SqlValue::Null);
            op = op.bind(param.clone(), value);
        }

        Ok(Some(op))
    }
}

impl Projection for CompiledFlatTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn shards(&self) -> Vec<ShardDefinition> {
        self.layout.shards(&self.name, Some(self.event_types()))
    }

    fn tables(&self) -> Vec<Table> {
        vec![self.table.clone()]
    }

    fn apply(&self, ctx: &ApplyContext<'_>, events: &[Event]) -> Result<Vec<ProjectionOp>> {
        let mut ops = Vec::with_capacity(events.len());
        for event in events {
            if let Some(op) = self.op_for(ctx, event)? {
                ops.push(op);
            }
        }
        Ok(ops)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonSerializer;
    use crate::schema::Database;
    use crate::storage::{commit_page, ensure_table, PageCommit};
    use crate::types::{GlobalPos, StreamIdentity, StreamRev, TenantId};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Opened {
        owner: String,
    }
    impl DomainEvent for Opened {
        const EVENT_TYPE: &'static str = "opened";
    }

    #[derive(Serialize, Deserialize)]
    struct Closed;
    impl DomainEvent for Closed {
        const EVENT_TYPE: &'static str = "closed";
    }

    fn event(event_type: &str, stream: &str, data: serde_json::Value) -> Event {
        Event {
            event_id: uuid::Uuid::new_v4(),
            global_pos: GlobalPos::FIRST,
            stream: StreamIdentity::key(stream),
            stream_rev: StreamRev::FIRST,
            event_type: event_type.to_string(),
            stream_type: None,
            timestamp_ms: 0,
            tenant: TenantId::default(),
            data: serde_json::to_vec(&data).unwrap(),
            metadata: None,
        }
    }

    fn accounts() -> CompiledFlatTable {
        FlatTableProjection::new("Accounts", "accounts", "id", ColumnType::Text)
            .project::<Opened>(|map| {
                map.set("owner", "owner", ColumnType::Text).increment("opened");
            })
            .project_type("debited", |map| {
                map.decrement("balance");
            })
            .delete::<Closed>()
            .compile()
            .unwrap()
    }

    #[test]
    fn test_compile_renders_upsert() {
        let compiled = accounts();

        assert_eq!(
            compiled.statement_sql("debited").unwrap(),
            "INSERT INTO accounts (tenant_id, id, balance) VALUES (:tenant, :key, 0) \
             ON CONFLICT(tenant_id, id) DO UPDATE SET balance = accounts.balance - 1"
        );
        assert_eq!(
            compiled.statement_sql("closed").unwrap(),
            "DELETE FROM accounts WHERE tenant_id = :tenant AND id = :key"
        );
        assert_eq!(compiled.event_types(), vec!["closed", "debited", "opened"]);
        assert!(compiled.table().column_for("balance").is_some());
    }

    #[test]
    fn test_compile_rejects_misconfiguration() {
        let empty = FlatTableProjection::new("P", "p", "id", ColumnType::Text).compile();
        assert!(matches!(empty, Err(Error::Configuration(_))));

        let no_columns = FlatTableProjection::new("P", "p", "id", ColumnType::Text)
            .project_type("a", |_| {})
            .compile();
        assert!(matches!(no_columns, Err(Error::Configuration(_))));

        let twice = FlatTableProjection::new("P", "p", "id", ColumnType::Text)
            .project_type("a", |m| {
                m.increment("n").decrement("n");
            })
            .compile();
        assert!(matches!(twice, Err(Error::Configuration(_))));

        let bad_path = FlatTableProjection::new("P", "p", "id", ColumnType::Text)
            .project_type("a", |m| {
                m.set("x", "a..b", ColumnType::Text);
            })
            .compile();
        assert!(matches!(bad_path, Err(Error::Configuration(_))));

        let duplicate_type = FlatTableProjection::new("P", "p", "id", ColumnType::Text)
            .project_type("a", |m| {
                m.increment("n");
            })
            .project_type("a", |m| {
                m.increment("m");
            })
            .compile();
        assert!(matches!(duplicate_type, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_decrement_round_trip() {
        let compiled = accounts();
        let mut conn = Database::open_in_memory().unwrap().into_connection();
        ensure_table(&conn, compiled.table(), "accounts").unwrap();

        for _ in 0..4 {
            let ops = {
                let ctx = ApplyContext {
                    conn: &conn,
                    serializer: &JsonSerializer,
                    target: TableTarget::Live,
                };
                compiled
                    .apply(&ctx, &[event("debited", "acct-1", serde_json::json!({}))])
                    .unwrap()
            };
            commit_page(&mut conn, &PageCommit { ops, progress: None }).unwrap();
        }

        // First event inserts the row at 0; the three that follow subtract one each.
        let balance: i64 = conn
            .query_row("SELECT balance FROM accounts WHERE id = 'acct-1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(balance, -3);
    }

    #[test]
    fn test_delete_and_field_key() {
        let compiled = FlatTableProjection::new("Owners", "owners", "owner", ColumnType::Text)
            .project::<Opened>(|map| {
                map.key_from("owner").increment("accounts");
            })
            .delete_by_field::<Opened>("owner")
            .compile();
        // Same event type twice: one upsert and one delete would be ambiguous.
        assert!(matches!(compiled, Err(Error::Configuration(_))));

        let compiled = FlatTableProjection::new("Owners", "owners", "owner", ColumnType::Text)
            .project::<Opened>(|map| {
                map.key_from("owner").increment("accounts");
            })
            .compile()
            .unwrap();

        let conn = Database::open_in_memory().unwrap().into_connection();
        let ctx = ApplyContext {
            conn: &conn,
            serializer: &JsonSerializer,
            target: TableTarget::Rebuild,
        };
        let op = compiled
            .op_for(&ctx, &event("opened", "s", serde_json::json!({"owner": "ann"})))
            .unwrap()
            .unwrap();
        assert!(op.sql.starts_with("INSERT INTO owners__rebuild"));
        assert!(op.params.contains(&(":key".to_string(), SqlValue::Text("ann".into()))));

        let missing = compiled
            .op_for(&ctx, &event("opened", "s", serde_json::json!({})))
            .unwrap();
        assert!(missing.is_none());
    }
}
