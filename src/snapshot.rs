//! Component E: the Snapshot Store.
//!
//! Snapshots are derived, reproducible state -- not the source of truth --
//! so `put` is a plain overwrite rather than a conditional write: there is no
//! optimistic-concurrency contract to uphold here, unlike the stream store
//! and the registry.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::SnapshotStoreError;
use crate::key;
use crate::object_store_adapter::ObjectStoreAdapter;
use crate::version::Version;

/// A point-in-time materialization of a stream's folded state.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// The stream this snapshot was taken from.
    pub stream_identifier: String,
    /// The stream version the snapshot reflects.
    pub version: Version,
    /// Optional caller-supplied label distinguishing multiple snapshots at
    /// the same version (e.g. different projections).
    pub label: Option<String>,
    /// Always `"application/json"` per the specification.
    pub content_type: &'static str,
    /// The snapshot's opaque body.
    pub body: Bytes,
    /// When this snapshot was written.
    pub last_modified: DateTime<Utc>,
}

/// Metadata-only view of a snapshot, as returned by [`SnapshotStore::list`].
#[derive(Debug, Clone)]
pub struct SnapshotMetadata {
    /// The stream this snapshot was taken from.
    pub stream_identifier: String,
    /// The stream version the snapshot reflects.
    pub version: Version,
    /// Optional caller-supplied label.
    pub label: Option<String>,
    /// The object key backing this snapshot.
    pub key: String,
}

/// Put/get/list/delete operations for snapshots keyed by `(stream, version, label?)`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    adapter: Arc<ObjectStoreAdapter>,
}

impl SnapshotStore {
    /// Builds a new snapshot store over the given adapter.
    #[must_use]
    pub fn new(adapter: Arc<ObjectStoreAdapter>) -> Self {
        Self { adapter }
    }

    /// Writes a snapshot, overwriting any prior snapshot at the same key.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, body)))]
    pub async fn put(
        &self,
        bucket: &str,
        stream_identifier: &str,
        version: Version,
        label: Option<&str>,
        body: Bytes,
    ) -> Result<(), SnapshotStoreError> {
        let object_key = key::snapshot_key(stream_identifier, version, label);
        self.adapter
            .put(bucket, &object_key, body, None, false)
            .await?;
        Ok(())
    }

    /// Reads a snapshot, or `None` if it doesn't exist.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn get(
        &self,
        bucket: &str,
        stream_identifier: &str,
        version: Version,
        label: Option<&str>,
    ) -> Result<Option<Snapshot>, SnapshotStoreError> {
        let object_key = key::snapshot_key(stream_identifier, version, label);
        let Some(outcome) = self.adapter.get(bucket, &object_key, None).await? else {
            return Ok(None);
        };

        Ok(Some(Snapshot {
            stream_identifier: stream_identifier.to_string(),
            version,
            label: label.map(ToString::to_string),
            content_type: "application/json",
            body: outcome.bytes,
            last_modified: Utc::now(),
        }))
    }

    /// Lists every snapshot recorded for `stream_identifier`.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn list(
        &self,
        bucket: &str,
        stream_identifier: &str,
    ) -> Result<Vec<SnapshotMetadata>, SnapshotStoreError> {
        let prefix = format!("snapshot/{stream_identifier}-");
        let mut out = Vec::new();
        let mut token = None;

        loop {
            let page = self.adapter.list(bucket, &prefix, token).await?;
            for key in &page.keys {
                if let Some(meta) = parse_snapshot_key(key, stream_identifier) {
                    out.push(meta);
                }
            }
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }

        Ok(out)
    }

    /// Deletes a snapshot. Deleting an absent snapshot is not an error.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn delete(
        &self,
        bucket: &str,
        stream_identifier: &str,
        version: Version,
        label: Option<&str>,
    ) -> Result<(), SnapshotStoreError> {
        let object_key = key::snapshot_key(stream_identifier, version, label);
        self.adapter.delete(bucket, &object_key).await?;
        Ok(())
    }
}

fn parse_snapshot_key(key: &str, stream_identifier: &str) -> Option<SnapshotMetadata> {
    let file_name = key.rsplit('/').next()?;
    let stripped = file_name.strip_suffix(".json")?;
    let rest = stripped.strip_prefix(stream_identifier)?.strip_prefix('-')?;

    let (version_str, label) = match rest.split_once('_') {
        Some((v, l)) => (v, Some(l.to_string())),
        None => (rest, None),
    };

    let version: Version = version_str.parse().ok()?;

    Some(SnapshotMetadata {
        stream_identifier: stream_identifier.to_string(),
        version,
        label,
        key: key.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store_adapter::InMemoryProvider;

    fn store() -> SnapshotStore {
        SnapshotStore::new(Arc::new(ObjectStoreAdapter::new(Arc::new(InMemoryProvider::new()))))
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = store();
        store
            .put("bucket", "s1", 3, None, Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let snap = store.get("bucket", "s1", 3, None).await.unwrap().unwrap();
        assert_eq!(snap.body, Bytes::from_static(b"{}"));
    }

    #[tokio::test]
    async fn put_overwrites_unconditionally() {
        let store = store();
        store
            .put("bucket", "s1", 3, None, Bytes::from_static(b"old"))
            .await
            .unwrap();
        store
            .put("bucket", "s1", 3, None, Bytes::from_static(b"new"))
            .await
            .unwrap();

        let snap = store.get("bucket", "s1", 3, None).await.unwrap().unwrap();
        assert_eq!(snap.body, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn list_finds_labeled_and_unlabeled_snapshots() {
        let store = store();
        store
            .put("bucket", "s1", 1, None, Bytes::from_static(b"a"))
            .await
            .unwrap();
        store
            .put("bucket", "s1", 2, Some("checkpoint"), Bytes::from_static(b"b"))
            .await
            .unwrap();

        let mut metas = store.list("bucket", "s1").await.unwrap();
        metas.sort_by_key(|m| m.version);

        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].version, 1);
        assert_eq!(metas[0].label, None);
        assert_eq!(metas[1].version, 2);
        assert_eq!(metas[1].label.as_deref(), Some("checkpoint"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = store();
        store
            .put("bucket", "s1", 1, None, Bytes::from_static(b"a"))
            .await
            .unwrap();
        store.delete("bucket", "s1", 1, None).await.unwrap();
        store.delete("bucket", "s1", 1, None).await.unwrap();
        assert!(store.get("bucket", "s1", 1, None).await.unwrap().is_none());
    }
}
