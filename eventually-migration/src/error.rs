//! Error taxonomy for the live migration engine.
//!
//! Mirrors the shape of [`eventually_object_store::error`]: one `thiserror`
//! enum, every variant carrying enough context to log and decide a retry
//! policy without downcasting.

use std::time::Duration;

use eventually_object_store::error::{RegistryError, StreamStoreError};

/// Errors that can end a live migration run.
///
/// `TransformFailure` is deliberately absent here: a transform error is
/// handled internally by skipping the offending event and logging a
/// warning, never by aborting the migration (see `DESIGN.md`).
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// `closeTimeout` elapsed before the source and target streams converged.
    #[error("live migration did not converge within {0:?}")]
    Timeout(Duration),

    /// `maxIterations` catch-up rounds elapsed without converging.
    #[error("live migration exceeded {0} catch-up iterations")]
    MaxIterationsExceeded(u32),

    /// A read or append against the source or target stream failed.
    #[error(transparent)]
    Stream(#[from] StreamStoreError),

    /// Persisting the post-migration object document failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The cancellation signal was observed.
    #[error("live migration cancelled")]
    Cancelled,
}

impl MigrationError {
    /// Whether `ATTEMPT_CLOSE` should retry from `CATCH_UP` rather than fail
    /// the whole migration: an optimistic-concurrency conflict, or any
    /// transport error whose message looks conflict-shaped.
    #[must_use]
    pub fn is_close_retriable(&self) -> bool {
        match self {
            MigrationError::Stream(StreamStoreError::OptimisticConcurrency { .. }) => true,
            MigrationError::Stream(StreamStoreError::Adapter(adapter_err)) => {
                let message = adapter_err.to_string().to_lowercase();
                message.contains("conflict") || message.contains("etag") || message.contains("precondition")
            }
            _ => false,
        }
    }
}
