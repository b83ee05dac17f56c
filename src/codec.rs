//! # Payload Encoding
//!
//! The event log stores payloads as opaque bytes. This module holds the narrow
//! serialization contract the store relies on, plus the integrity checksum and
//! clock helpers used by the writer.
//!
//! ## Serialization Contract
//!
//! ```text
//! payload ──to_bytes──► bytes ──(stored)──► bytes, type ──from_bytes──► payload
//! ```
//!
//! Serializers work on `serde_json::Value` as the neutral intermediate form, so
//! typed events, aggregators and flattened column maps all share one path and
//! the concrete byte format stays swappable.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::types::EventData;

// =============================================================================
// Serialization Contract
// =============================================================================

/// Converts payloads to and from stored bytes.
pub trait Serializer: Send + Sync + 'static {
    /// Short name of the format, recorded for diagnostics.
    fn name(&self) -> &'static str;

    /// Encodes a payload.
    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decodes a payload.
    fn from_bytes(&self, bytes: &[u8]) -> Result<Value>;
}

/// JSON serializer, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A typed event payload with a stable type name.
///
/// The type name is what the log records and what shard filters and handler
/// registries key on.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use spitefold::DomainEvent;
///
/// #[derive(Serialize, Deserialize)]
/// struct Travel { day: u32, movements: Vec<f64> }
///
/// impl DomainEvent for Travel {
///     const EVENT_TYPE: &'static str = "travel";
/// }
/// ```
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name recorded in the log for this payload type.
    const EVENT_TYPE: &'static str;
}

/// Serializes a typed event into appendable [`EventData`].
pub fn encode_event<T: DomainEvent>(serializer: &dyn Serializer, event: &T) -> Result<EventData> {
    let value = serde_json::to_value(event)?;
    let data = serializer.to_bytes(&value)?;
    Ok(EventData::new(T::EVENT_TYPE, data))
}

/// Deserializes a stored payload into `T`.
pub fn decode_payload<T: DeserializeOwned>(serializer: &dyn Serializer, bytes: &[u8]) -> Result<T> {
    let value = serializer.from_bytes(bytes)?;
    Ok(serde_json::from_value(value)?)
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Computes a checksum for payload bytes.
///
/// XXH3-64, stored next to the payload and verified on every read.
pub fn compute_checksum(data: &[u8]) -> i64 {
    xxhash_rust::xxh3::xxh3_64(data) as i64
}

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Opened {
        name: String,
        limit: i64,
    }

    impl DomainEvent for Opened {
        const EVENT_TYPE: &'static str = "opened";
    }

    #[test]
    fn test_encode_event_records_type() {
        let data = encode_event(&JsonSerializer, &Opened { name: "a".into(), limit: 3 }).unwrap();
        assert_eq!(data.event_type, "opened");
        assert_eq!(data.data, br#"{"name":"a","limit":3}"#.to_vec());

        let back: Opened = decode_payload(&JsonSerializer, &data.data).unwrap();
        assert_eq!(back, Opened { name: "a".into(), limit: 3 });
    }

    #[test]
    fn test_decode_wrong_shape_fails() {
        let result: Result<Opened> = decode_payload(&JsonSerializer, br#"{"name":1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_checksum_deterministic() {
        assert_eq!(compute_checksum(b"payload"), compute_checksum(b"payload"));
        assert_ne!(compute_checksum(b"data1"), compute_checksum(b"data2"));
    }
}
