//! Component F: the Tag Store.
//!
//! Associates user-supplied tags with stream identifiers via a small JSON
//! set document at one object key per tag, using the same
//! GET-then-conditional-PUT discipline as the registry and the event stream
//! store -- the entire runtime has exactly one way of doing a safe
//! read-modify-write over an object store, and this is it.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{AdapterError, TagStoreError};
use crate::key;
use crate::object_store_adapter::ObjectStoreAdapter;

/// Number of GET→PUT retries attempted before giving up on a conflicting tag update.
const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
struct TagIndexDocument {
    #[serde(rename = "streamIds", default)]
    stream_ids: BTreeSet<String>,
}

/// Associates stream identifiers with user tags, keyed by `(object_name, tag)`.
#[derive(Debug, Clone)]
pub struct TagStore {
    adapter: Arc<ObjectStoreAdapter>,
}

impl TagStore {
    /// Builds a new tag store over the given adapter.
    #[must_use]
    pub fn new(adapter: Arc<ObjectStoreAdapter>) -> Self {
        Self { adapter }
    }

    /// Associates `stream_id` (read off `doc.active`) with `tag`.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn set(
        &self,
        object_name: &str,
        stream_id: &str,
        tag: &str,
    ) -> Result<(), TagStoreError> {
        self.update(object_name, tag, |set| {
            set.insert(stream_id.to_string());
        })
        .await
    }

    /// Returns every stream identifier tagged `tag` under `object_name`.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn get(&self, object_name: &str, tag: &str) -> Result<BTreeSet<String>, TagStoreError> {
        let bucket = key::bucket_for_object(object_name);
        let index_key = key::tag_index_key(tag);

        match self.adapter.get(&bucket, &index_key, None).await? {
            Some(outcome) => {
                let doc: TagIndexDocument =
                    serde_json::from_slice(&outcome.bytes).map_err(TagStoreError::Codec)?;
                Ok(doc.stream_ids)
            }
            None => Ok(BTreeSet::new()),
        }
    }

    /// Removes the association between `stream_id` and `tag`, if present.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn remove(
        &self,
        object_name: &str,
        stream_id: &str,
        tag: &str,
    ) -> Result<(), TagStoreError> {
        self.update(object_name, tag, |set| {
            set.remove(stream_id);
        })
        .await
    }

    async fn update(
        &self,
        object_name: &str,
        tag: &str,
        mutate: impl Fn(&mut BTreeSet<String>),
    ) -> Result<(), TagStoreError> {
        let bucket = key::bucket_for_object(object_name);
        let index_key = key::tag_index_key(tag);

        for _ in 0..MAX_RETRIES {
            let (mut doc, etag) = match self.adapter.get(&bucket, &index_key, None).await? {
                Some(outcome) => {
                    let doc: TagIndexDocument =
                        serde_json::from_slice(&outcome.bytes).map_err(TagStoreError::Codec)?;
                    (doc, Some(outcome.etag))
                }
                None => (TagIndexDocument::default(), None),
            };

            mutate(&mut doc.stream_ids);

            let bytes = serde_json::to_vec(&doc).map_err(TagStoreError::Codec)?;
            let result = self
                .adapter
                .put(
                    &bucket,
                    &index_key,
                    Bytes::from(bytes),
                    etag.as_deref(),
                    etag.is_none(),
                )
                .await;

            match result {
                Ok(_) => return Ok(()),
                Err(AdapterError::PreconditionFailed { .. }) => continue,
                Err(err) => return Err(TagStoreError::Adapter(err)),
            }
        }

        Err(TagStoreError::ConcurrentTagUpdate(index_key))
    }
}
