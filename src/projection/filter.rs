//! Shard input filters.

use crate::error::{Error, Result};
use crate::reader::LogQuery;
use crate::types::{Event, GlobalPos};

/// Which events a shard consumes.
///
/// `None` means "any"; a list is an allow-list. Filters are public so tooling
/// can see what a shard reads without running it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub stream_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Matches every event.
    pub fn any() -> Self {
        Self::default()
    }

    /// Restricts to these event types (builder pattern).
    pub fn with_event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts to events from streams of these types (builder pattern).
    pub fn with_stream_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stream_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// An empty allow-list can never match; that is a setup mistake.
    pub fn validate(&self, shard: &str) -> Result<()> {
        if matches!(&self.event_types, Some(types) if types.is_empty()) {
            return Err(Error::Configuration(format!("shard '{}' allows no event types", shard)));
        }
        if matches!(&self.stream_types, Some(types) if types.is_empty()) {
            return Err(Error::Configuration(format!("shard '{}' allows no stream types", shard)));
        }
        Ok(())
    }

    /// Whether `event` passes this filter. Pages are read with the same
    /// conditions in SQL.
    pub fn matches(&self, event: &Event) -> bool {
        let type_ok = self
            .event_types
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| t == &event.event_type));
        let stream_ok = self.stream_types.as_ref().map_or(true, |types| {
            event
                .stream_type
                .as_ref()
                .is_some_and(|st| types.iter().any(|t| t == st))
        });
        type_ok && stream_ok
    }

    /// The log query for the page after `after`, bounded by `ceiling`.
    pub fn page_query(&self, after: GlobalPos, ceiling: GlobalPos, limit: usize) -> LogQuery {
        LogQuery {
            after,
            ceiling: Some(ceiling),
            event_types: self.event_types.clone(),
            stream_types: self.stream_types.clone(),
            limit: Some(limit),
            ..LogQuery::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StreamIdentity, StreamRev, TenantId};

    fn event(event_type: &str, stream_type: Option<&str>) -> Event {
        Event {
            event_id: uuid::Uuid::new_v4(),
            global_pos: GlobalPos::FIRST,
            stream: StreamIdentity::key("s"),
            stream_rev: StreamRev::FIRST,
            event_type: event_type.to_string(),
            stream_type: stream_type.map(str::to_string),
            timestamp_ms: 0,
            tenant: TenantId::default(),
            data: vec![],
            metadata: None,
        }
    }

    #[test]
    fn test_matches() {
        let filter = EventFilter::any().with_event_types(["travel"]).with_stream_types(["trip"]);

        assert!(filter.matches(&event("travel", Some("trip"))));
        assert!(!filter.matches(&event("arrival", Some("trip"))));
        assert!(!filter.matches(&event("travel", None)));
        assert!(EventFilter::any().matches(&event("anything", None)));
    }

    #[test]
    fn test_empty_allow_list_is_contradictory() {
        let filter = EventFilter::any().with_event_types(Vec::<String>::new());
        assert!(matches!(filter.validate("P:All"), Err(Error::Configuration(_))));
        assert!(EventFilter::any().validate("P:All").is_ok());
    }
}
