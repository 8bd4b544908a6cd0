//! Component C: the Object-Document Registry.
//!
//! Owns the per-logical-object descriptor (`ObjectDocument`): which stream is
//! currently active, the chain of streams that have been terminated (closed
//! by a live migration), and the set of user tags attached to the object.
//! The registry is the *only* writer of object documents -- the migration
//! engine (component G) never mutates one directly, it calls back into this
//! module after a verified stream closure.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::key;
use crate::object_store_adapter::ObjectStoreAdapter;
use crate::version::Version;

/// One chunk of a chunked stream, recorded so the append path knows which
/// object key currently receives new events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Zero-based chunk index.
    pub chunk: u32,
    /// Number of events written into this chunk so far.
    #[serde(rename = "eventCount")]
    pub event_count: u32,
}

/// Describes the currently-active stream for an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    /// The stream's identifier, unique for the object's lifetime.
    #[serde(rename = "streamIdentifier")]
    pub stream_identifier: String,

    /// Backend discriminator, e.g. `"s3"`, `"memory"`.
    #[serde(rename = "streamType")]
    pub stream_type: String,

    /// The version of the last event recorded in this stream, if any.
    #[serde(rename = "currentStreamVersion", default, skip_serializing_if = "Option::is_none")]
    pub current_stream_version: Option<Version>,

    /// Name of the bound data store.
    #[serde(rename = "dataStore")]
    pub data_store: String,

    /// Name of the bound document store (the bucket/container holding the
    /// stream document itself).
    #[serde(rename = "documentStore")]
    pub document_store: String,

    /// Name of the bound snapshot store.
    #[serde(rename = "snapShotStore")]
    pub snapshot_store: String,

    /// Chunk ledger, if this stream is chunked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkInfo>>,

    /// The stream document's content hash as last observed by this caller;
    /// the optimistic-concurrency token [`crate::stream_store::EventStreamStore::append`]
    /// checks before attempting a write. `None` until the caller has
    /// appended or otherwise recorded a hash.
    #[serde(rename = "lastDocumentHash", default, skip_serializing_if = "Option::is_none")]
    pub last_document_hash: Option<String>,
}

impl StreamInfo {
    /// The object key to append to: the last chunk's key if chunked,
    /// otherwise the stream's single unchunked key.
    #[must_use]
    pub fn append_key(&self) -> String {
        match self.chunks.as_ref().and_then(|c| c.last()) {
            Some(chunk) => key::stream_chunk_key(&self.stream_identifier, chunk.chunk),
            None => key::stream_key(&self.stream_identifier),
        }
    }
}

/// A stream that has been sealed, recorded in the object document's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminatedStream {
    /// The identifier of the stream that was sealed.
    #[serde(rename = "streamIdentifier")]
    pub stream_identifier: String,

    /// Backend discriminator of the terminated stream.
    #[serde(rename = "streamType")]
    pub stream_type: String,

    /// Why the stream was terminated, e.g. `"live-migration"`.
    pub reason: String,

    /// The stream that continues after this one, if any.
    #[serde(rename = "continuationStreamId", default, skip_serializing_if = "Option::is_none")]
    pub continuation_stream_id: Option<String>,
}

/// Per-logical-object descriptor: which stream is active, the chain of
/// terminated streams behind it, and the object's tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDocument {
    /// The logical object's id (unique within `objectName`).
    #[serde(rename = "objectId")]
    pub object_id: String,

    /// The logical object's bucket-qualifying name.
    #[serde(rename = "objectName")]
    pub object_name: String,

    /// The currently-active stream.
    pub active: StreamInfo,

    /// History of streams this object has terminated, oldest first.
    #[serde(rename = "terminatedStreams", default)]
    pub terminated_streams: Vec<TerminatedStream>,

    /// User-assigned tags.
    #[serde(rename = "documentTags", default)]
    pub document_tags: std::collections::BTreeSet<String>,

    /// ETag of this document as last observed; the optimistic-concurrency
    /// token for [`ObjectDocumentRegistry::set`]. Not part of the persisted
    /// JSON -- it tracks the *storage* precondition, not a content hash.
    #[serde(skip)]
    pub etag: String,
}

impl ObjectDocument {
    /// The bucket this object document -- and its active stream -- lives in.
    #[must_use]
    pub fn bucket(&self) -> String {
        key::bucket_for_object(&self.object_name)
    }

    fn registry_key(object_name: &str, object_id: &str) -> String {
        format!("objects/{}/{object_id}.json", object_name.to_lowercase())
    }
}

/// Operations exposed by the Object-Document Registry.
#[async_trait]
pub trait ObjectDocumentRegistry: Send + Sync {
    /// Returns the object document for `(object_name, object_id)`, creating
    /// a fresh one -- bound to a newly-minted active stream -- if none
    /// exists yet. Concurrent callers creating the same object converge on
    /// a single winner.
    async fn get_or_create(
        &self,
        object_name: &str,
        object_id: &str,
        stream_type: &str,
        store_override: Option<&str>,
    ) -> Result<ObjectDocument, RegistryError>;

    /// Returns the object document for `(object_name, object_id)`, or `None`
    /// if it has never been created.
    async fn get(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<Option<ObjectDocument>, RegistryError>;

    /// Persists `doc` with a conditional write against the ETag it was last
    /// read with.
    async fn set(&self, doc: &mut ObjectDocument) -> Result<(), RegistryError>;

    /// Returns every stream identifier tagged `tag` under `object_name`.
    async fn by_tag(
        &self,
        object_name: &str,
        tag: &str,
    ) -> Result<Vec<String>, RegistryError>;

    /// Returns the first stream identifier tagged `tag` under `object_name`,
    /// if any.
    async fn first_by_tag(
        &self,
        object_name: &str,
        tag: &str,
    ) -> Result<Option<String>, RegistryError> {
        Ok(self.by_tag(object_name, tag).await?.into_iter().next())
    }
}

/// The default [`ObjectDocumentRegistry`] implementation, persisting object
/// documents as JSON through the [`ObjectStoreAdapter`] using the same
/// GET-then-CAS-PUT discipline as the event stream store.
#[derive(Debug, Clone)]
pub struct Registry {
    adapter: Arc<ObjectStoreAdapter>,
    tags: Arc<crate::tags::TagStore>,
}

impl Registry {
    /// Builds a new registry over the given adapter and tag store.
    #[must_use]
    pub fn new(adapter: Arc<ObjectStoreAdapter>, tags: Arc<crate::tags::TagStore>) -> Self {
        Self { adapter, tags }
    }
}

#[async_trait]
impl ObjectDocumentRegistry for Registry {
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    async fn get_or_create(
        &self,
        object_name: &str,
        object_id: &str,
        stream_type: &str,
        store_override: Option<&str>,
    ) -> Result<ObjectDocument, RegistryError> {
        if object_name.is_empty() || object_id.is_empty() {
            return Err(RegistryError::InvalidArgument(
                "object_name and object_id must be non-empty".to_string(),
            ));
        }

        if let Some(existing) = self.get(object_name, object_id).await? {
            return Ok(existing);
        }

        let bucket = key::bucket_for_object(object_name);
        let store_name = store_override.unwrap_or(&bucket).to_string();

        let mut doc = ObjectDocument {
            object_id: object_id.to_string(),
            object_name: object_name.to_string(),
            active: StreamInfo {
                stream_identifier: uuid::Uuid::new_v4().to_string(),
                stream_type: stream_type.to_string(),
                current_stream_version: None,
                data_store: store_name.clone(),
                document_store: store_name.clone(),
                snapshot_store: store_name,
                chunks: None,
                last_document_hash: None,
            },
            terminated_streams: Vec::new(),
            document_tags: Default::default(),
            etag: String::new(),
        };

        let registry_key = ObjectDocument::registry_key(object_name, object_id);
        let bytes = serde_json::to_vec(&doc).map_err(RegistryError::Codec)?;

        match self
            .adapter
            .put(&bucket, &registry_key, Bytes::from(bytes), None, true)
            .await
        {
            Ok(outcome) => {
                doc.etag = outcome.etag;
                Ok(doc)
            }
            Err(crate::error::AdapterError::PreconditionFailed { .. }) => {
                // Another caller created it first; converge on their document.
                self.get(object_name, object_id)
                    .await?
                    .ok_or_else(|| {
                        RegistryError::ConcurrentDocumentUpdate {
                            object_name: object_name.to_string(),
                            object_id: object_id.to_string(),
                        }
                    })
            }
            Err(err) => Err(RegistryError::Adapter(err)),
        }
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    async fn get(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<Option<ObjectDocument>, RegistryError> {
        let bucket = key::bucket_for_object(object_name);
        let registry_key = ObjectDocument::registry_key(object_name, object_id);

        let Some(outcome) = self.adapter.get(&bucket, &registry_key, None).await? else {
            return Ok(None);
        };

        let mut doc: ObjectDocument =
            serde_json::from_slice(&outcome.bytes).map_err(RegistryError::Codec)?;
        doc.etag = outcome.etag;
        Ok(Some(doc))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, doc)))]
    async fn set(&self, doc: &mut ObjectDocument) -> Result<(), RegistryError> {
        let bucket = doc.bucket();
        let registry_key = ObjectDocument::registry_key(&doc.object_name, &doc.object_id);
        let if_match = if doc.etag.is_empty() {
            None
        } else {
            Some(doc.etag.clone())
        };

        let bytes = serde_json::to_vec(&*doc).map_err(RegistryError::Codec)?;

        let outcome = self
            .adapter
            .put(&bucket, &registry_key, Bytes::from(bytes), if_match.as_deref(), false)
            .await
            .map_err(|err| match err {
                crate::error::AdapterError::PreconditionFailed { .. } => {
                    RegistryError::ConcurrentDocumentUpdate {
                        object_name: doc.object_name.clone(),
                        object_id: doc.object_id.clone(),
                    }
                }
                other => RegistryError::Adapter(other),
            })?;

        doc.etag = outcome.etag;
        Ok(())
    }

    async fn by_tag(&self, object_name: &str, tag: &str) -> Result<Vec<String>, RegistryError> {
        let set = self.tags.get(object_name, tag).await.map_err(|err| match err {
            crate::error::TagStoreError::Adapter(a) => RegistryError::Adapter(a),
            crate::error::TagStoreError::Codec(e) => RegistryError::Codec(e),
            crate::error::TagStoreError::ConcurrentTagUpdate(key) => {
                RegistryError::InvalidArgument(format!("tag index `{key}` is under concurrent update"))
            }
        })?;
        Ok(set.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store_adapter::{InMemoryProvider, ObjectStoreAdapter};

    fn registry() -> Registry {
        let adapter = Arc::new(ObjectStoreAdapter::new(Arc::new(InMemoryProvider::new())));
        let tags = Arc::new(crate::tags::TagStore::new(adapter.clone()));
        Registry::new(adapter, tags)
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let registry = registry();
        let first = registry
            .get_or_create("orders", "order-1", "s3", None)
            .await
            .unwrap();
        let second = registry
            .get_or_create("orders", "order-1", "s3", None)
            .await
            .unwrap();

        assert_eq!(first.active.stream_identifier, second.active.stream_identifier);
    }

    #[tokio::test]
    async fn set_rejects_stale_etag() {
        let registry = registry();
        let mut doc = registry
            .get_or_create("orders", "order-2", "s3", None)
            .await
            .unwrap();

        let mut stale = doc.clone();
        registry.set(&mut doc).await.unwrap();

        let err = registry.set(&mut stale).await.unwrap_err();
        assert!(matches!(err, RegistryError::ConcurrentDocumentUpdate { .. }));
    }
}
