//! Component B: the Stream Document codec.
//!
//! Defines the wire shape of an [`Event`] and the [`StreamDocument`] container
//! that is persisted at one object key per stream (or per chunk), plus the
//! canonical-hash bookkeeping the append path needs for optimistic
//! concurrency. Deserialization tolerates trailing unknown fields via
//! `#[serde(default)]` thanks to `serde_json`'s default forward-compatible
//! behavior for structs (unknown fields are simply ignored on the way in).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::{Version, ANY_HASH};

/// The distinguished event type marking a stream as sealed.
pub const STREAM_CLOSED_EVENT_TYPE: &str = "EventStream.Closed";

/// Free-form string metadata attached to an event.
pub type Metadata = BTreeMap<String, String>;

/// An immutable, persisted event record.
///
/// `payload` is opaque to the core: it is carried as a raw JSON value so that
/// the store never needs to know the shape of a particular domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The event's position within its stream: monotonically increasing,
    /// dense on append, tolerated-with-gaps on read.
    #[serde(rename = "eventVersion")]
    pub event_version: Version,

    /// The domain-specific discriminator for this event, e.g. `"OrderPlaced"`.
    #[serde(rename = "eventType")]
    pub event_type: String,

    /// Opaque payload, usually UTF-8 JSON, never interpreted by the core.
    pub payload: serde_json::Value,

    /// Wall-clock time the event was recorded.
    pub timestamp: DateTime<Utc>,

    /// Version of the payload's schema, for the domain's own evolution needs.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u16,

    /// Optional free-form metadata.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Event {
    /// Whether this is the distinguished stream-closure marker.
    #[must_use]
    pub fn is_closure_marker(&self) -> bool {
        self.event_type == STREAM_CLOSED_EVENT_TYPE
    }
}

/// Payload carried by the [`STREAM_CLOSED_EVENT_TYPE`] event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosureMarkerPayload {
    /// The stream that continues after this one closes.
    #[serde(rename = "continuationStreamId")]
    pub continuation_stream_id: String,

    /// The migration run that sealed this stream.
    #[serde(rename = "migrationId")]
    pub migration_id: uuid::Uuid,

    /// When the closure was recorded.
    #[serde(rename = "closedAt")]
    pub closed_at: DateTime<Utc>,

    /// Backend discriminator of the source stream, if known.
    #[serde(rename = "sourceStreamType", default, skip_serializing_if = "Option::is_none")]
    pub source_stream_type: Option<String>,

    /// Backend discriminator of the target stream, if known.
    #[serde(rename = "targetStreamType", default, skip_serializing_if = "Option::is_none")]
    pub target_stream_type: Option<String>,

    /// Data-store binding of the source stream, if known.
    #[serde(rename = "sourceDataStore", default, skip_serializing_if = "Option::is_none")]
    pub source_data_store: Option<String>,

    /// Data-store binding of the target stream, if known.
    #[serde(rename = "targetDataStore", default, skip_serializing_if = "Option::is_none")]
    pub target_data_store: Option<String>,

    /// Document-store binding of the target stream, if known.
    #[serde(rename = "targetDocumentStore", default, skip_serializing_if = "Option::is_none")]
    pub target_document_store: Option<String>,
}

/// The serialized container persisted at one object key per stream or chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDocument {
    /// The logical object this stream belongs to.
    #[serde(rename = "objectId")]
    pub object_id: String,

    /// The logical object's bucket-qualifying name.
    #[serde(rename = "objectName")]
    pub object_name: String,

    /// Content hash computed the last time this document was written;
    /// `"*"` means "no previous write".
    #[serde(rename = "lastObjectDocumentHash")]
    pub last_object_document_hash: String,

    /// The stream's events, in append order.
    pub events: Vec<Event>,
}

impl StreamDocument {
    /// Builds a brand-new, empty document for a first write.
    #[must_use]
    pub fn new(object_id: impl Into<String>, object_name: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            object_name: object_name.into(),
            last_object_document_hash: ANY_HASH.to_string(),
            events: Vec::new(),
        }
    }

    /// The version of the last event in the document, if any.
    #[must_use]
    pub fn last_version(&self) -> Option<Version> {
        self.events.last().map(|e| e.event_version)
    }

    /// Whether the last event in the document is the closure marker.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.events.last().is_some_and(Event::is_closure_marker)
    }

    /// Serializes this document to its canonical JSON representation, the
    /// exact bytes that [`crate::hash::sha256_hex`] is computed over.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails, which should not happen for
    /// well-formed documents.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserializes a document from bytes, tolerating trailing unknown
    /// top-level fields for forward compatibility.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a well-formed stream document.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Recomputes `lastObjectDocumentHash` for the document's current
    /// contents and writes it back into the document. This must be called
    /// immediately before every PUT.
    pub fn seal_hash(&mut self) -> Result<String, serde_json::Error> {
        // Hash over the document shape with an empty hash field, then store
        // the result -- the hash covers "everything except itself".
        self.last_object_document_hash.clear();
        let bytes = self.to_canonical_json()?;
        let hash = crate::hash::sha256_hex(&bytes);
        self.last_object_document_hash = hash.clone();
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(version: Version) -> Event {
        Event {
            event_version: version,
            event_type: "Sample".to_string(),
            payload: serde_json::json!({"n": version}),
            timestamp: Utc::now(),
            schema_version: 1,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn round_trips_through_json() {
        let mut doc = StreamDocument::new("obj-1", "bucket");
        doc.events.push(sample_event(0));
        doc.events.push(sample_event(1));
        doc.seal_hash().unwrap();

        let bytes = doc.to_canonical_json().unwrap();
        let decoded = StreamDocument::from_json(&bytes).unwrap();

        assert_eq!(decoded.events.len(), 2);
        assert_eq!(decoded.last_version(), Some(1));
        assert_eq!(decoded.last_object_document_hash, doc.last_object_document_hash);
    }

    #[test]
    fn tolerates_trailing_unknown_fields() {
        let json = serde_json::json!({
            "objectId": "obj-1",
            "objectName": "bucket",
            "lastObjectDocumentHash": "*",
            "events": [],
            "futureField": {"nested": true},
        });
        let bytes = serde_json::to_vec(&json).unwrap();
        let decoded = StreamDocument::from_json(&bytes).expect("unknown fields must be ignored");
        assert_eq!(decoded.object_id, "obj-1");
    }

    #[test]
    fn closure_marker_is_detected_only_as_last_event() {
        let mut doc = StreamDocument::new("obj-1", "bucket");
        doc.events.push(sample_event(0));
        assert!(!doc.is_closed());

        doc.events.push(Event {
            event_version: 1,
            event_type: STREAM_CLOSED_EVENT_TYPE.to_string(),
            payload: serde_json::to_value(ClosureMarkerPayload {
                continuation_stream_id: "s2".to_string(),
                migration_id: uuid::Uuid::new_v4(),
                closed_at: Utc::now(),
                source_stream_type: None,
                target_stream_type: None,
                source_data_store: None,
                target_data_store: None,
                target_document_store: None,
            })
            .unwrap(),
            timestamp: Utc::now(),
            schema_version: 1,
            metadata: Metadata::new(),
        });

        assert!(doc.is_closed());
    }
}
