//! Component A: the Object-Store Adapter.
//!
//! A thin, typed layer over the [`object_store`] crate's `ObjectStore` trait,
//! the same "small capability set per backend" shape the design notes call
//! for: callers never see `object_store::Error` variants directly, only the
//! [`AdapterError`] taxonomy, and every 404-equivalent collapses to `None`
//! rather than an error.
//!
//! Multiple buckets are supported by routing through an
//! [`ObjectStoreProvider`], since a single [`object_store::ObjectStore`]
//! instance is conventionally scoped to one bucket/container -- this mirrors
//! how the teacher crate keeps backend-specific connection state (a `bb8`
//! pool, a `redis::aio::MultiplexedConnection`) behind a small trait rather
//! than hard-coding one backend into the store.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, ObjectStore, PutMode, PutOptions, PutPayload,
    UpdateVersion,
};

use crate::error::AdapterError;
use crate::hash::{content_md5_base64, content_md5_hex, sha256_hex};

/// The result of a successful GET.
#[derive(Debug, Clone)]
pub struct GetOutcome {
    /// The object's raw bytes.
    pub bytes: Bytes,
    /// The backend-assigned ETag, used as the optimistic-concurrency token.
    pub etag: String,
    /// SHA-256 of `bytes`, hex-encoded.
    pub hash: String,
}

/// The result of a successful PUT.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    /// The backend-assigned ETag after the write.
    pub etag: String,
    /// SHA-256 of the bytes written, hex-encoded.
    pub hash: String,
}

/// One page of a LIST operation.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Keys found in this page, relative to the bucket root.
    pub keys: Vec<String>,
    /// Opaque token to pass back in to continue listing, if more remain.
    pub next_token: Option<String>,
}

/// Maximum number of keys returned per [`ObjectStoreAdapter::list`] page.
const LIST_PAGE_SIZE: usize = 1000;

/// Whether `etag` looks like a bare (single-part) MD5 hex digest -- the
/// convention S3-compatible backends follow for a non-multipart PUT's ETag.
/// Multipart ETags carry a `-<partCount>` suffix and opaque backend-specific
/// ETags (e.g. the in-memory test backend's generation counter) are neither
/// quoted-32-hex nor this shape, so this check never produces a false
/// mismatch -- it only fires when the backend actually follows the
/// convention and the bytes it stored differ from what was sent.
fn looks_like_raw_md5_etag(etag: &str) -> bool {
    let etag = etag.trim_matches('"');
    etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Cross-checks a PUT's returned ETag against the MD5 we computed before
/// sending, when the ETag's shape makes that meaningful (see
/// [`looks_like_raw_md5_etag`]). A mismatch means the bytes the backend
/// stored are not the bytes we sent -- fatal, per the design notes.
fn check_put_integrity(
    bucket: &str,
    key: &str,
    expected_md5_hex: &str,
    etag: &str,
) -> Result<(), AdapterError> {
    let trimmed = etag.trim_matches('"');
    if looks_like_raw_md5_etag(etag) && !trimmed.eq_ignore_ascii_case(expected_md5_hex) {
        return Err(AdapterError::Integrity {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Resolves a bucket/container name to the backend [`ObjectStore`] instance
/// serving it, creating and caching per-bucket clients as needed.
///
/// Implementations are the "polymorphism over capabilities" seam from the
/// design notes: a new backend (S3, Azure, GCS, local disk, in-memory) is
/// just a new, small implementation of this trait.
#[async_trait]
pub trait ObjectStoreProvider: Send + Sync + fmt::Debug {
    /// Returns the object store backing `bucket`, creating it lazily if this
    /// provider supports that (in-memory/local backends do; a hosted S3
    /// account typically does not, and `ensure_container` will fail instead).
    async fn store_for_bucket(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, AdapterError>;

    /// Whether this backend supports atomic conditional writes
    /// (`If-Match`/`If-None-Match`). When `false`, the adapter falls back to
    /// unconditional PUTs and callers lose the optimistic-concurrency
    /// guarantee -- acceptable only for single-writer development backends.
    fn supports_conditional_writes(&self) -> bool {
        true
    }
}

/// An [`ObjectStoreProvider`] that hands out one [`object_store::memory::InMemory`]
/// store per bucket name, lazily created on first use. Used for tests and
/// for local development; a production deployment supplies a provider backed
/// by `object_store::aws::AmazonS3Builder` or similar.
#[derive(Debug, Default, Clone)]
pub struct InMemoryProvider {
    buckets: Arc<DashMap<String, Arc<dyn ObjectStore>>>,
}

impl InMemoryProvider {
    /// Creates an empty provider with no buckets yet created.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStoreProvider for InMemoryProvider {
    async fn store_for_bucket(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, AdapterError> {
        if let Some(store) = self.buckets.get(bucket) {
            return Ok(store.clone());
        }

        let store: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        self.buckets.insert(bucket.to_string(), store.clone());
        Ok(store)
    }
}

/// The Object-Store Adapter: typed GET/PUT/HEAD/LIST/DELETE with conditional
/// headers, MD5 integrity, and a cached bucket-existence check.
#[derive(Debug, Clone)]
pub struct ObjectStoreAdapter {
    provider: Arc<dyn ObjectStoreProvider>,
    /// Process-wide (per-adapter-instance, for test hermeticity) cache of
    /// buckets known to exist. Monotonic: never evicted.
    verified_buckets: Arc<DashSet<String>>,
}

impl ObjectStoreAdapter {
    /// Builds a new adapter over the given bucket-resolution strategy.
    #[must_use]
    pub fn new(provider: Arc<dyn ObjectStoreProvider>) -> Self {
        Self {
            provider,
            verified_buckets: Arc::new(DashSet::new()),
        }
    }

    /// Ensures the named bucket/container exists, caching the result so
    /// repeated calls for the same bucket are a single hash-set lookup.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::ContainerMissing`] if the backend cannot
    /// resolve or create the bucket.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn ensure_container(&self, bucket: &str) -> Result<(), AdapterError> {
        if self.verified_buckets.contains(bucket) {
            return Ok(());
        }

        self.provider
            .store_for_bucket(bucket)
            .await
            .map_err(|_| AdapterError::ContainerMissing(bucket.to_string()))?;

        self.verified_buckets.insert(bucket.to_string());
        Ok(())
    }

    /// GETs an object, returning `None` on a 404-equivalent (missing key or
    /// missing bucket) rather than an error.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn get(
        &self,
        bucket: &str,
        key: &str,
        expected_etag: Option<&str>,
    ) -> Result<Option<GetOutcome>, AdapterError> {
        let store = match self.provider.store_for_bucket(bucket).await {
            Ok(store) => store,
            Err(_) => return Ok(None),
        };

        let path = object_store::path::Path::from(key);
        let options = GetOptions {
            if_match: expected_etag.map(ToString::to_string),
            ..Default::default()
        };

        match store.get_opts(&path, options).await {
            Ok(result) => {
                let etag = result.meta.e_tag.clone().unwrap_or_default();
                let bytes = result
                    .bytes()
                    .await
                    .map_err(AdapterError::Transport)?;
                let hash = sha256_hex(&bytes);
                Ok(Some(GetOutcome { bytes, etag, hash }))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(object_store::Error::Precondition { path, source: _ }) => {
                Err(AdapterError::PreconditionFailed {
                    bucket: bucket.to_string(),
                    key: path,
                })
            }
            Err(err) => Err(AdapterError::Transport(err)),
        }
    }

    /// HEADs an object, returning its ETag, or `None` if absent.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn head(&self, bucket: &str, key: &str) -> Result<Option<String>, AdapterError> {
        let store = match self.provider.store_for_bucket(bucket).await {
            Ok(store) => store,
            Err(_) => return Ok(None),
        };

        let path = object_store::path::Path::from(key);
        match store.head(&path).await {
            Ok(meta) => Ok(Some(meta.e_tag.unwrap_or_default())),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(AdapterError::Transport(err)),
        }
    }

    /// PUTs an object with optional conditional-write preconditions.
    ///
    /// At most one of `if_match`/`if_none_match` should be set; `if_none_match`
    /// must be `"*"` (any other value is not supported by S3-compatible
    /// conditional writes and is rejected by the backend as unsupported).
    ///
    /// Sends a Content-MD5 alongside the payload as custom metadata for
    /// transport integrity, and cross-checks the backend's returned ETag
    /// against it when the ETag's shape makes that meaningful (see
    /// [`check_put_integrity`]), returning [`AdapterError::Integrity`] on a
    /// mismatch.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, bytes)))]
    pub async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        if_match: Option<&str>,
        if_none_match_any: bool,
    ) -> Result<PutOutcome, AdapterError> {
        self.ensure_container(bucket).await?;
        let store = self
            .provider
            .store_for_bucket(bucket)
            .await
            .map_err(|_| AdapterError::ContainerMissing(bucket.to_string()))?;

        let hash = sha256_hex(&bytes);
        let md5_b64 = content_md5_base64(&bytes);
        let md5_hex = content_md5_hex(&bytes);
        let path = object_store::path::Path::from(key);
        let payload = PutPayload::from(bytes);

        let mode = if !self.provider.supports_conditional_writes() {
            PutMode::Overwrite
        } else if if_none_match_any {
            PutMode::Create
        } else if let Some(etag) = if_match {
            PutMode::Update(UpdateVersion {
                e_tag: Some(etag.to_string()),
                version: None,
            })
        } else {
            PutMode::Overwrite
        };

        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::Metadata(std::borrow::Cow::Borrowed("content-md5")),
            AttributeValue::from(md5_b64),
        );

        let options = PutOptions {
            mode,
            attributes,
            ..Default::default()
        };

        match store.put_opts(&path, payload, options).await {
            Ok(result) => {
                let etag = result.e_tag.unwrap_or_default();
                check_put_integrity(bucket, key, &md5_hex, &etag)?;
                Ok(PutOutcome { etag, hash })
            }
            Err(object_store::Error::AlreadyExists { path, source: _ }) => {
                Err(AdapterError::PreconditionFailed {
                    bucket: bucket.to_string(),
                    key: path,
                })
            }
            Err(object_store::Error::Precondition { path, source: _ }) => {
                Err(AdapterError::PreconditionFailed {
                    bucket: bucket.to_string(),
                    key: path,
                })
            }
            Err(object_store::Error::NotFound { .. }) => {
                Err(AdapterError::ContainerMissing(bucket.to_string()))
            }
            Err(err) => Err(AdapterError::Transport(err)),
        }
    }

    /// DELETEs an object. Deleting an already-absent key is not an error.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<(), AdapterError> {
        let store = self
            .provider
            .store_for_bucket(bucket)
            .await
            .map_err(|_| AdapterError::ContainerMissing(bucket.to_string()))?;

        let path = object_store::path::Path::from(key);
        match store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(AdapterError::Transport(err)),
        }
    }

    /// Lists keys under `prefix`, one page at a time.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ListPage, AdapterError> {
        use futures::StreamExt;

        let store = self
            .provider
            .store_for_bucket(bucket)
            .await
            .map_err(|_| AdapterError::ContainerMissing(bucket.to_string()))?;

        let prefix_path = object_store::path::Path::from(prefix);

        let mut stream = match continuation_token {
            Some(ref last_key) => {
                store.list_with_offset(Some(&prefix_path), &object_store::path::Path::from(last_key.as_str()))
            }
            None => store.list(Some(&prefix_path)),
        };

        let mut keys = Vec::with_capacity(LIST_PAGE_SIZE);
        while keys.len() < LIST_PAGE_SIZE {
            match stream.next().await {
                Some(Ok(meta)) => keys.push(meta.location.to_string()),
                Some(Err(err)) => return Err(AdapterError::Transport(err)),
                None => {
                    return Ok(ListPage {
                        keys,
                        next_token: None,
                    })
                }
            }
        }

        let next_token = keys.last().cloned();
        Ok(ListPage { keys, next_token })
    }

    /// A lightweight readiness probe: LISTs the bucket and reports whether
    /// the backend answered without error. Wiring this into an HTTP health
    /// endpoint is the excluded external collaborator; this method is the
    /// contract it would call.
    pub async fn is_healthy(&self, bucket: &str) -> bool {
        self.list(bucket, "", None).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> ObjectStoreAdapter {
        ObjectStoreAdapter::new(Arc::new(InMemoryProvider::new()))
    }

    #[tokio::test]
    async fn get_on_missing_key_returns_none() {
        let adapter = adapter();
        adapter.ensure_container("bucket").await.unwrap();
        assert!(adapter.get("bucket", "missing.json", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_then_get_round_trips_bytes_and_hash() {
        let adapter = adapter();
        let put = adapter
            .put("bucket", "s1.json", Bytes::from_static(b"hello"), None, true)
            .await
            .unwrap();

        let got = adapter.get("bucket", "s1.json", None).await.unwrap().unwrap();
        assert_eq!(got.bytes, Bytes::from_static(b"hello"));
        assert_eq!(got.hash, put.hash);
    }

    #[tokio::test]
    async fn create_mode_rejects_a_second_write() {
        let adapter = adapter();
        adapter
            .put("bucket", "s1.json", Bytes::from_static(b"first"), None, true)
            .await
            .unwrap();

        let err = adapter
            .put("bucket", "s1.json", Bytes::from_static(b"second"), None, true)
            .await
            .unwrap_err();

        assert!(matches!(err, AdapterError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn stale_if_match_is_rejected() {
        let adapter = adapter();
        adapter
            .put("bucket", "s1.json", Bytes::from_static(b"first"), None, true)
            .await
            .unwrap();

        let err = adapter
            .put(
                "bucket",
                "s1.json",
                Bytes::from_static(b"second"),
                Some("not-the-real-etag"),
                false,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AdapterError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn list_pages_through_keys() {
        let adapter = adapter();
        for i in 0..3 {
            adapter
                .put("bucket", &format!("s{i}.json"), Bytes::from_static(b"x"), None, true)
                .await
                .unwrap();
        }

        let page = adapter.list("bucket", "", None).await.unwrap();
        assert_eq!(page.keys.len(), 3);
    }

    #[tokio::test]
    async fn healthy_when_bucket_is_listable() {
        let adapter = adapter();
        assert!(adapter.is_healthy("bucket").await);
    }

    #[test]
    fn put_integrity_passes_when_backend_echoes_the_same_md5_as_a_raw_etag() {
        let expected = crate::hash::content_md5_hex(b"hello");
        assert!(check_put_integrity("bucket", "s1.json", &expected, &expected).is_ok());
        assert!(check_put_integrity("bucket", "s1.json", &expected, &format!("\"{expected}\"")).is_ok());
    }

    #[test]
    fn put_integrity_flags_a_raw_md5_etag_that_does_not_match() {
        let expected = crate::hash::content_md5_hex(b"hello");
        let wrong = crate::hash::content_md5_hex(b"goodbye");
        let err = check_put_integrity("bucket", "s1.json", &expected, &wrong).unwrap_err();
        assert!(matches!(err, AdapterError::Integrity { .. }));
    }

    #[test]
    fn put_integrity_is_inert_for_etags_that_are_not_md5_shaped() {
        // Multipart ETags and opaque backend-specific ETags (like the
        // in-memory backend's own generation counter) are never flagged.
        let expected = crate::hash::content_md5_hex(b"hello");
        assert!(check_put_integrity("bucket", "s1.json", &expected, "deadbeefdeadbeefdeadbeefdeadbeef-2").is_ok());
        assert!(check_put_integrity("bucket", "s1.json", &expected, "7").is_ok());
    }
}
