//! One JSON document per stream, maintained by an [`Aggregator`].
//!
//! Each page is grouped by stream. For every stream the stored document is
//! the seed, events at or below its stored version are skipped, and the
//! result is upserted with the version of the last event applied:
//!
//! ```text
//! page ──► group by (tenant, stream) ──► load doc ──► build(seed) ──► upsert(version, data)
//! ```
//!
//! Skipping by version makes a replayed page a no-op.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::marker::PhantomData;

use rusqlite::types::Value as SqlValue;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::aggregate::{Aggregate, Aggregator};
use crate::error::{Error, Result};
use crate::flattened::{validate_identifier, ColumnType, Table, TableColumn, TENANT_COLUMN};
use crate::projection::{ApplyContext, Projection, ShardDefinition, ShardLayout};
use crate::reader;
use crate::storage::ProjectionOp;
use crate::types::{Event, StreamRev, TenantId};

/// Key column of every document table.
pub const DOCUMENT_ID_COLUMN: &str = "id";

/// Projects each stream into a document of type `A`.
pub struct AggregationProjection<A> {
    name: String,
    table_name: String,
    aggregator: Aggregator<A>,
    layout: ShardLayout,
    _marker: PhantomData<fn() -> A>,
}

impl<A> AggregationProjection<A>
where
    A: Aggregate + Default + Serialize + DeserializeOwned,
{
    pub fn new(name: &str, table_name: &str, aggregator: Aggregator<A>) -> Self {
        Self {
            name: name.to_string(),
            table_name: table_name.to_string(),
            aggregator,
            layout: ShardLayout::Single,
            _marker: PhantomData,
        }
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

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn table(&self) -> Table {
        Table::new(self.table_name.as_str(), DOCUMENT_ID_COLUMN, ColumnType::Text)
            .with_column(TableColumn::new("version", ColumnType::Integer))
            .with_column(TableColumn::new("data", ColumnType::Json))
    }

    fn upsert_sql(table: &str) -> String {
        format!(
            "INSERT INTO {table} ({TENANT_COLUMN}, {DOCUMENT_ID_COLUMN}, version, data) \
             VALUES (:tenant, :id, :version, :data) \
             ON CONFLICT({TENANT_COLUMN}, {DOCUMENT_ID_COLUMN}) DO UPDATE SET \
             version = excluded.version, data = excluded.data"
        )
    }
}

/// Splits a page into per-stream runs, keeping first-seen order.
fn group_by_stream(events: &[Event]) -> Vec<((TenantId, String), Vec<Event>)> {
    let mut index: HashMap<(TenantId, String), usize> = HashMap::new();
    let mut groups: Vec<((TenantId, String), Vec<Event>)> = Vec::new();
    for event in events {
        let key = (event.tenant.clone(), event.stream.storage_key());
        match index.entry(key) {
            Entry::Occupied(slot) => groups[*slot.get()].1.push(event.clone()),
            Entry::Vacant(slot) => {
                let key = slot.key().clone();
                slot.insert(groups.len());
                groups.push((key, vec![event.clone()]));
            }
        }
    }
    groups
}

impl<A> Projection for AggregationProjection<A>
where
    A: Aggregate + Default + Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn shards(&self) -> Vec<ShardDefinition> {
        self.layout.shards(&self.name, Some(self.aggregator.handled_event_types()))
    }

    fn tables(&self) -> Vec<Table> {
        vec![self.table()]
    }

    fn validate(&self) -> Result<()> {
        validate_identifier(&self.table_name)?;
        if self.aggregator.handled_event_types().is_empty() {
            return Err(Error::Configuration(format!(
                "projection '{}' has no event handlers",
                self.name
            )));
        }
        Ok(())
    }

    fn apply(&self, ctx: &ApplyContext<'_>, events: &[Event]) -> Result<Vec<ProjectionOp>> {
        let table = ctx.table_name(&self.table_name);
        let sql = Self::upsert_sql(&table);

        let mut ops = Vec::new();
        for ((tenant, id), group) in group_by_stream(events) {
            let (seed, stored_version) = match reader::load_document(ctx.conn, &table, &tenant, &id)? {
                Some(doc) => (Some(serde_json::from_value::<A>(doc.data)?), doc.version),
                None => (None, StreamRev::NONE),
            };

            let fresh: Vec<Event> = group.into_iter().filter(|e| e.stream_rev > stored_version).collect();
            let Some(last_rev) = fresh.last().map(|e| e.stream_rev) else {
                continue;
            };

            let Some(aggregate) = self.aggregator.build(ctx.serializer, &fresh, seed)? else {
                continue;
            };

            ops.push(
                ProjectionOp::new(sql.as_str())
                    .bind(":tenant", SqlValue::Text(tenant.as_str().to_string()))
                    .bind(":id", SqlValue::Text(id))
                    .bind(":version", SqlValue::Integer(last_rev.as_raw() as i64))
                    .bind(":data", SqlValue::Text(serde_json::to_string(&aggregate)?)),
            );
        }
        Ok(ops)
    }
}
