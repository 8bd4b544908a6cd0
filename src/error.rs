//! Error taxonomy for the object-store-backed event stream runtime.
//!
//! Each component gets its own `thiserror` enum, following the same shape as
//! `eventually-postgres::store::Error` and `eventually-redis::store::StoreError`
//! in the wider `eventually` family: one variant per failure kind, wrapping the
//! underlying cause with `#[source]`/`#[from]` rather than flattening everything
//! into a string.

use crate::version::Version;

/// Errors returned by the [`ObjectStoreAdapter`][crate::object_store_adapter::ObjectStoreAdapter].
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The bucket/container does not exist and auto-creation is disabled.
    #[error("container `{0}` does not exist")]
    ContainerMissing(String),

    /// An `ifMatch`/`ifNoneMatch` precondition failed.
    #[error("precondition failed for `{bucket}/{key}`")]
    PreconditionFailed {
        /// Bucket the write targeted.
        bucket: String,
        /// Key the write targeted.
        key: String,
    },

    /// The Content-MD5 sent alongside a PUT did not match what the backend computed.
    #[error("integrity check failed writing `{bucket}/{key}`")]
    Integrity {
        /// Bucket the write targeted.
        bucket: String,
        /// Key the write targeted.
        key: String,
    },

    /// Network or backend-side failure, presumed retriable with backoff.
    #[error("object store transport error: {0}")]
    Transport(#[source] object_store::Error),
}

/// Errors returned by the [`ObjectDocumentRegistry`][crate::registry::ObjectDocumentRegistry].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Invalid input was supplied (empty object name, empty object id, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `set` lost a conditional write race against another writer.
    #[error("concurrent update to object document `{object_name}/{object_id}`")]
    ConcurrentDocumentUpdate {
        /// The logical object's name (bucket).
        object_name: String,
        /// The logical object's id.
        object_id: String,
    },

    /// The underlying object store failed.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Failure decoding/encoding the object document.
    #[error("failed to (de)serialize object document: {0}")]
    Codec(#[source] serde_json::Error),
}

/// Errors returned by the [`EventStreamStore`][crate::stream_store::EventStreamStore].
#[derive(Debug, thiserror::Error)]
pub enum StreamStoreError {
    /// Invalid input was supplied (empty events, empty stream identifier, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The stream's last event is the closure marker; no further appends are possible.
    #[error("stream `{0}` is closed")]
    StreamClosed(String),

    /// The caller's expected prior document hash did not match what is stored.
    #[error("optimistic concurrency conflict on stream `{stream_id}`: expected version {expected:?}, found version {actual:?}")]
    OptimisticConcurrency {
        /// Stream that was being appended to.
        stream_id: String,
        /// Version the caller believed was current.
        expected: Option<Version>,
        /// Version actually stored.
        actual: Option<Version>,
    },

    /// Two callers raced to create the same stream's first document.
    #[error("concurrent creation of stream `{0}`")]
    ConcurrentStreamCreation(String),

    /// The underlying object store failed.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Failure decoding/encoding the stream document.
    #[error("failed to (de)serialize stream document: {0}")]
    Codec(#[source] serde_json::Error),

    /// The read or append was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
}

impl StreamStoreError {
    /// Whether a caller may usefully retry this operation after reloading state.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StreamStoreError::OptimisticConcurrency { .. }
                | StreamStoreError::ConcurrentStreamCreation(_)
                | StreamStoreError::Adapter(AdapterError::Transport(_))
        )
    }
}

/// Errors returned by the [`SnapshotStore`][crate::snapshot::SnapshotStore].
#[derive(Debug, thiserror::Error)]
pub enum SnapshotStoreError {
    /// The underlying object store failed.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Failure decoding/encoding the snapshot envelope.
    #[error("failed to (de)serialize snapshot: {0}")]
    Codec(#[source] serde_json::Error),
}

/// Errors returned by the [`TagStore`][crate::tags::TagStore].
#[derive(Debug, thiserror::Error)]
pub enum TagStoreError {
    /// The underlying object store failed.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Failure decoding/encoding the tag index document.
    #[error("failed to (de)serialize tag index: {0}")]
    Codec(#[source] serde_json::Error),

    /// `set`/`remove` lost a conditional write race against another writer after all retries.
    #[error("concurrent update to tag index `{0}`")]
    ConcurrentTagUpdate(String),
}
