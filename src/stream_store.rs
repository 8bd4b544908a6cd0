//! Component D: the Event Stream Store -- the hardest part of the runtime.
//!
//! Append, materialized read, streaming read, and failed-commit
//! compensation, all built on the single critical section the design notes
//! call out: `(GET doc, CAS PUT doc)`. Two concurrent appenders racing for
//! the same stream can never both win; the loser observes a
//! [`StreamStoreError::OptimisticConcurrency`] or
//! [`StreamStoreError::ConcurrentStreamCreation`] and is expected to reload
//! and retry.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::codec::{Event, Metadata, StreamDocument};
use crate::error::{AdapterError, StreamStoreError};
use crate::key;
use crate::object_store_adapter::ObjectStoreAdapter;
use crate::registry::ObjectDocument;
use crate::version::{Version, ANY_HASH};

/// A caller-supplied event, not yet assigned a version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    /// The domain-specific discriminator for this event.
    pub event_type: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Version of the payload's schema.
    pub schema_version: u16,
    /// Optional free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Caller-supplied timestamp, honored only when `preserve_timestamps` is set.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewEvent {
    /// Convenience constructor for a new event with no metadata or explicit timestamp.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value, schema_version: u16) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            schema_version,
            metadata: Metadata::new(),
            timestamp: None,
        }
    }
}

/// The outcome of a successful [`EventStreamStore::append`].
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// The version of the last event now present in the stream.
    pub last_version: Version,
    /// The content hash of the document after this append; callers should
    /// cache this on their [`ObjectDocument`] for the next append's
    /// optimistic-concurrency check.
    pub new_document_hash: String,
}

/// The Event Stream Store: append, read, and failed-commit compensation
/// over an [`ObjectStoreAdapter`].
#[derive(Debug, Clone)]
pub struct EventStreamStore {
    adapter: Arc<ObjectStoreAdapter>,
    /// Process-wide (per-instance) cache of stream identifiers known to be
    /// sealed. Monotonic: closed streams never reopen.
    closed_streams: Arc<DashSet<String>>,
}

impl EventStreamStore {
    /// Builds a new stream store over the given adapter.
    #[must_use]
    pub fn new(adapter: Arc<ObjectStoreAdapter>) -> Self {
        Self {
            adapter,
            closed_streams: Arc::new(DashSet::new()),
        }
    }

    /// Whether `stream_id` is known (by this process) to be sealed, without
    /// any I/O.
    #[must_use]
    pub fn is_known_closed(&self, stream_id: &str) -> bool {
        self.closed_streams.contains(stream_id)
    }

    /// Appends `events` to the object's active stream.
    ///
    /// # Errors
    ///
    /// Returns [`StreamStoreError::StreamClosed`] if the stream's last event
    /// is the closure marker, [`StreamStoreError::OptimisticConcurrency`] or
    /// [`StreamStoreError::ConcurrentStreamCreation`] on a write race, and
    /// [`StreamStoreError::InvalidArgument`] for empty inputs.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, events, cancellation)))]
    pub async fn append(
        &self,
        object_doc: &ObjectDocument,
        events: Vec<NewEvent>,
        preserve_timestamps: bool,
        cancellation: &CancellationToken,
    ) -> Result<AppendOutcome, StreamStoreError> {
        if events.is_empty() {
            return Err(StreamStoreError::InvalidArgument(
                "events must not be empty".to_string(),
            ));
        }
        if object_doc.active.stream_identifier.is_empty() {
            return Err(StreamStoreError::InvalidArgument(
                "object_doc.active.stream_identifier must not be empty".to_string(),
            ));
        }

        let stream_id = object_doc.active.stream_identifier.clone();

        if self.closed_streams.contains(&stream_id) {
            return Err(StreamStoreError::StreamClosed(stream_id));
        }

        let bucket = object_doc.bucket();
        let object_key = object_doc.active.append_key();

        check_cancelled(cancellation)?;
        let existing = self.adapter.get(&bucket, &object_key, None).await?;

        match existing {
            None => self.append_first_write(object_doc, &bucket, &object_key, events, preserve_timestamps).await,
            Some(outcome) => {
                let mut doc = StreamDocument::from_json(&outcome.bytes).map_err(StreamStoreError::Codec)?;

                if doc.is_closed() {
                    self.closed_streams.insert(stream_id.clone());
                    return Err(StreamStoreError::StreamClosed(stream_id));
                }

                if doc.last_object_document_hash != ANY_HASH {
                    if let Some(expected) = object_doc.active.last_document_hash.as_deref() {
                        if expected != doc.last_object_document_hash {
                            return Err(StreamStoreError::OptimisticConcurrency {
                                stream_id,
                                expected: None,
                                actual: doc.last_version(),
                            });
                        }
                    }
                }

                let next_version = doc.last_version().map_or(0, |v| v + 1);
                append_events_into(&mut doc, events, next_version, preserve_timestamps);
                let new_hash = doc.seal_hash().map_err(StreamStoreError::Codec)?;
                let bytes = doc.to_canonical_json().map_err(StreamStoreError::Codec)?;

                check_cancelled(cancellation)?;
                match self
                    .adapter
                    .put(&bucket, &object_key, Bytes::from(bytes), Some(&outcome.etag), false)
                    .await
                {
                    Ok(_) => Ok(AppendOutcome {
                        last_version: doc.last_version().expect("just appended at least one event"),
                        new_document_hash: new_hash,
                    }),
                    Err(AdapterError::PreconditionFailed { .. }) => {
                        Err(StreamStoreError::OptimisticConcurrency {
                            stream_id,
                            expected: object_doc.active.current_stream_version,
                            actual: None,
                        })
                    }
                    Err(err) => Err(StreamStoreError::Adapter(err)),
                }
            }
        }
    }

    async fn append_first_write(
        &self,
        object_doc: &ObjectDocument,
        bucket: &str,
        object_key: &str,
        events: Vec<NewEvent>,
        preserve_timestamps: bool,
    ) -> Result<AppendOutcome, StreamStoreError> {
        let mut doc = StreamDocument::new(object_doc.object_id.clone(), object_doc.object_name.clone());
        append_events_into(&mut doc, events, 0, preserve_timestamps);
        let new_hash = doc.seal_hash().map_err(StreamStoreError::Codec)?;
        let bytes = doc.to_canonical_json().map_err(StreamStoreError::Codec)?;

        match self
            .adapter
            .put(bucket, object_key, Bytes::from(bytes), None, true)
            .await
        {
            Ok(_) => Ok(AppendOutcome {
                last_version: doc.last_version().expect("just appended at least one event"),
                new_document_hash: new_hash,
            }),
            Err(AdapterError::PreconditionFailed { .. }) => Err(
                StreamStoreError::ConcurrentStreamCreation(object_doc.active.stream_identifier.clone()),
            ),
            Err(err) => Err(StreamStoreError::Adapter(err)),
        }
    }

    /// Reads the full materialized window of events `[start_version, until_version]`.
    ///
    /// Returns `None` if the stream has never been written.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn read(
        &self,
        object_doc: &ObjectDocument,
        start_version: Version,
        until_version: Option<Version>,
        chunk: Option<u32>,
    ) -> Result<Option<Vec<Event>>, StreamStoreError> {
        let Some(doc) = self.load_document(object_doc, chunk).await? else {
            return Ok(None);
        };

        Ok(Some(select_window(doc.events, start_version, until_version)))
    }

    /// Streams events one at a time from a single GET, honoring the
    /// requested version window and checking `cancellation` between yields.
    /// The returned stream is finite, single-pass, and not restartable.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, cancellation)))]
    pub async fn read_as_stream(
        &self,
        object_doc: &ObjectDocument,
        start_version: Version,
        until_version: Option<Version>,
        chunk: Option<u32>,
        cancellation: CancellationToken,
    ) -> Result<BoxStream<'static, Result<Event, StreamStoreError>>, StreamStoreError> {
        let Some(doc) = self.load_document(object_doc, chunk).await? else {
            return Ok(stream::empty().boxed());
        };

        let events = select_window(doc.events, start_version, until_version);

        let out = stream::iter(events).map(move |event| {
            if cancellation.is_cancelled() {
                Err(StreamStoreError::Cancelled)
            } else {
                Ok(event)
            }
        });

        Ok(out.boxed())
    }

    async fn load_document(
        &self,
        object_doc: &ObjectDocument,
        chunk: Option<u32>,
    ) -> Result<Option<StreamDocument>, StreamStoreError> {
        let bucket = object_doc.bucket();
        let object_key = match chunk {
            Some(chunk) => key::stream_chunk_key(&object_doc.active.stream_identifier, chunk),
            None => object_doc.active.append_key(),
        };

        let Some(outcome) = self.adapter.get(&bucket, &object_key, None).await? else {
            return Ok(None);
        };

        let doc = StreamDocument::from_json(&outcome.bytes).map_err(StreamStoreError::Codec)?;
        Ok(Some(doc))
    }

    /// Removes events with `eventVersion` in `[from_version, to_version]`
    /// that a caller just wrote and failed to commit downstream. Idempotent:
    /// re-issuing after the window is already gone returns `0`.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn remove_events_for_failed_commit(
        &self,
        object_doc: &ObjectDocument,
        from_version: Version,
        to_version: Version,
    ) -> Result<usize, StreamStoreError> {
        let bucket = object_doc.bucket();
        let object_key = object_doc.active.append_key();

        let Some(etag) = self.adapter.head(&bucket, &object_key).await? else {
            return Ok(0);
        };

        let Some(outcome) = self.adapter.get(&bucket, &object_key, Some(&etag)).await? else {
            return Ok(0);
        };

        let mut doc = StreamDocument::from_json(&outcome.bytes).map_err(StreamStoreError::Codec)?;
        let original_count = doc.events.len();

        doc.events
            .retain(|e| e.event_version < from_version || e.event_version > to_version);

        let removed = original_count - doc.events.len();
        if removed == 0 {
            return Ok(0);
        }

        doc.seal_hash().map_err(StreamStoreError::Codec)?;
        let bytes = doc.to_canonical_json().map_err(StreamStoreError::Codec)?;

        match self
            .adapter
            .put(&bucket, &object_key, Bytes::from(bytes), Some(&outcome.etag), false)
            .await
        {
            Ok(_) => Ok(removed),
            Err(AdapterError::PreconditionFailed { .. }) => {
                // Another writer raced us; the caller's compensation can be
                // safely retried since the operation is idempotent.
                Err(StreamStoreError::OptimisticConcurrency {
                    stream_id: object_doc.active.stream_identifier.clone(),
                    expected: None,
                    actual: None,
                })
            }
            Err(err) => Err(StreamStoreError::Adapter(err)),
        }
    }
}

fn check_cancelled(cancellation: &CancellationToken) -> Result<(), StreamStoreError> {
    if cancellation.is_cancelled() {
        Err(StreamStoreError::Cancelled)
    } else {
        Ok(())
    }
}

fn append_events_into(
    doc: &mut StreamDocument,
    events: Vec<NewEvent>,
    start_version: Version,
    preserve_timestamps: bool,
) {
    let now = Utc::now();
    for (i, new_event) in events.into_iter().enumerate() {
        let timestamp = if preserve_timestamps {
            new_event.timestamp.unwrap_or(now)
        } else {
            now
        };

        let event_version = start_version + Version::try_from(i).unwrap_or(Version::MAX);
        doc.events.push(Event {
            event_version,
            event_type: new_event.event_type,
            payload: new_event.payload,
            timestamp,
            schema_version: new_event.schema_version,
            metadata: new_event.metadata,
        });
    }
}

fn select_window(events: Vec<Event>, start_version: Version, until_version: Option<Version>) -> Vec<Event> {
    events
        .into_iter()
        .filter(|e| {
            e.event_version >= start_version
                && until_version.map_or(true, |until| e.event_version <= until)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store_adapter::InMemoryProvider;
    use crate::registry::{ObjectDocumentRegistry, Registry};
    use crate::tags::TagStore;

    async fn fixtures() -> (EventStreamStore, Registry, Arc<ObjectStoreAdapter>) {
        let adapter = Arc::new(ObjectStoreAdapter::new(Arc::new(InMemoryProvider::new())));
        let tags = Arc::new(TagStore::new(adapter.clone()));
        let registry = Registry::new(adapter.clone(), tags);
        let store = EventStreamStore::new(adapter.clone());
        (store, registry, adapter)
    }

    fn event(n: i64) -> NewEvent {
        NewEvent::new("Sample", serde_json::json!({"n": n}), 1)
    }

    #[tokio::test]
    async fn append_then_read_round_trips_with_dense_versions() {
        let (store, registry, _adapter) = fixtures().await;
        let doc = registry
            .get_or_create("orders", "order-1", "memory", None)
            .await
            .unwrap();

        let outcome = store
            .append(&doc, vec![event(1), event(2), event(3)], false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.last_version, 2);

        let events = store.read(&doc, 0, None, None).await.unwrap().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_version, 0);
        assert_eq!(events[2].event_version, 2);
    }

    #[tokio::test]
    async fn second_append_continues_version_sequence() {
        let (store, registry, _adapter) = fixtures().await;
        let doc = registry
            .get_or_create("orders", "order-2", "memory", None)
            .await
            .unwrap();

        store
            .append(&doc, vec![event(1), event(2)], false, &CancellationToken::new())
            .await
            .unwrap();

        let outcome = store
            .append(&doc, vec![event(3)], false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.last_version, 2);
    }

    #[tokio::test]
    async fn concurrent_first_write_has_exactly_one_winner() {
        let (store, registry, _adapter) = fixtures().await;
        let doc = registry
            .get_or_create("proj", "s1", "memory", None)
            .await
            .unwrap();

        let a = store.append(&doc, vec![event(1)], false, &CancellationToken::new());
        let b = store.append(&doc, vec![event(1)], false, &CancellationToken::new());
        let (a, b) = tokio::join!(a, b);

        let successes = [a.is_ok(), b.is_ok()].into_iter().filter(|x| *x).count();
        assert_eq!(successes, 1);

        let events = store.read(&doc, 0, None, None).await.unwrap().unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn append_after_closure_marker_fails_without_io_on_second_attempt() {
        let (store, registry, _adapter) = fixtures().await;
        let doc = registry
            .get_or_create("proj", "s1", "memory", None)
            .await
            .unwrap();

        store
            .append(&doc, vec![event(1), event(2)], false, &CancellationToken::new())
            .await
            .unwrap();

        let closure = NewEvent::new(
            crate::codec::STREAM_CLOSED_EVENT_TYPE,
            serde_json::json!({"continuationStreamId": "s2"}),
            1,
        );
        store
            .append(&doc, vec![closure], false, &CancellationToken::new())
            .await
            .unwrap();

        let err = store
            .append(&doc, vec![event(3)], false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamStoreError::StreamClosed(_)));
        assert!(store.is_known_closed(&doc.active.stream_identifier));
    }

    #[tokio::test]
    async fn remove_events_for_failed_commit_is_idempotent() {
        let (store, registry, _adapter) = fixtures().await;
        let doc = registry
            .get_or_create("proj", "s1", "memory", None)
            .await
            .unwrap();

        store
            .append(
                &doc,
                (0..10).map(event).collect(),
                false,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let removed = store.remove_events_for_failed_commit(&doc, 5, 7).await.unwrap();
        assert_eq!(removed, 3);

        let events = store.read(&doc, 0, None, None).await.unwrap().unwrap();
        let versions: Vec<_> = events.iter().map(|e| e.event_version).collect();
        assert_eq!(versions, vec![0, 1, 2, 3, 4, 8, 9]);

        let removed_again = store.remove_events_for_failed_commit(&doc, 5, 7).await.unwrap();
        assert_eq!(removed_again, 0);
    }

    #[tokio::test]
    async fn read_as_stream_yields_requested_window_in_order() {
        let (store, registry, _adapter) = fixtures().await;
        let doc = registry
            .get_or_create("proj", "s1", "memory", None)
            .await
            .unwrap();

        store
            .append(&doc, (0..5).map(event).collect(), false, &CancellationToken::new())
            .await
            .unwrap();

        let items: Vec<_> = store
            .read_as_stream(&doc, 1, Some(3), None, CancellationToken::new())
            .await
            .unwrap()
            .map(|r| r.unwrap().event_version)
            .collect()
            .await;

        assert_eq!(items, vec![1, 2, 3]);
    }
}
