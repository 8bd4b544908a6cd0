//! Inputs to a live migration run: [`LiveMigrationContext`], [`Options`],
//! and the [`Transformer`] seam.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventually_object_store::codec::Event;
use eventually_object_store::registry::ObjectDocument;
use futures::future::BoxFuture;
use uuid::Uuid;

const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_CATCH_UP_DELAY: Duration = Duration::from_millis(100);

/// Whether `ATTEMPT_CLOSE` keeps retrying on a conflict-shaped failure, or
/// fails the migration outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStrategy {
    /// Retry from `CATCH_UP` indefinitely (subject to `closeTimeout`/`maxIterations`).
    KeepTrying,
    /// Fail the migration on the first conflict.
    Fail,
}

/// Progress snapshot emitted after each catch-up round.
#[derive(Debug, Clone, Copy)]
pub struct CatchUpProgress {
    /// Highest event version observed on the source stream, if any.
    pub source_version: Option<u32>,
    /// Highest event version observed on the target stream, if any.
    pub target_version: Option<u32>,
    /// Events copied so far across the whole migration.
    pub total_events_copied: u64,
}

/// An event as it is being copied (or about to be appended) to the target.
#[derive(Debug, Clone)]
pub struct EventProgress {
    /// The event, post-transform.
    pub event: Event,
    /// Events copied so far, including this one.
    pub total_events_copied: u64,
}

/// Tunables and optional callbacks for a [`crate::engine::MigrationEngine`] run.
#[derive(Clone)]
pub struct Options {
    /// Wall-clock deadline for the whole migration to converge. Must be > 0.
    pub close_timeout: Duration,
    /// Delay between catch-up rounds while the source is still advancing.
    pub catch_up_delay: Duration,
    /// Maximum catch-up rounds before giving up with `MaxIterationsExceeded`. `0` means unlimited.
    pub max_iterations: u32,
    /// What `ATTEMPT_CLOSE` does when it hits a conflict-shaped failure.
    pub failure_strategy: FailureStrategy,
    /// Called after every catch-up round with a progress snapshot.
    pub on_catch_up_progress: Option<Arc<dyn Fn(CatchUpProgress) + Send + Sync>>,
    /// Called after an event has been appended to the target.
    pub on_event_copied: Option<Arc<dyn Fn(EventProgress) -> BoxFuture<'static, ()> + Send + Sync>>,
    /// Called immediately before an event is appended to the target.
    pub on_before_append: Option<Arc<dyn Fn(EventProgress) -> BoxFuture<'static, ()> + Send + Sync>>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("close_timeout", &self.close_timeout)
            .field("catch_up_delay", &self.catch_up_delay)
            .field("max_iterations", &self.max_iterations)
            .field("failure_strategy", &self.failure_strategy)
            .field("on_catch_up_progress", &self.on_catch_up_progress.is_some())
            .field("on_event_copied", &self.on_event_copied.is_some())
            .field("on_before_append", &self.on_before_append.is_some())
            .finish()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            catch_up_delay: DEFAULT_CATCH_UP_DELAY,
            max_iterations: 0,
            failure_strategy: FailureStrategy::KeepTrying,
            on_catch_up_progress: None,
            on_event_copied: None,
            on_before_append: None,
        }
    }
}

/// Translates a source event into its target-stream representation.
///
/// The identity transform (used when a context carries no transformer) is
/// simply `Ok(event)`. A transform that returns `Err` causes the engine to
/// skip that one event -- logged, not fatal to the migration.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Transforms a single event read from the source stream.
    ///
    /// # Errors
    ///
    /// Any error here causes the caller to skip copying this event.
    async fn transform(&self, event: Event) -> Result<Event, TransformError>;
}

/// The error a [`Transformer`] reports for a single event it could not translate.
#[derive(Debug, thiserror::Error)]
#[error("transform failed for event version {event_version}: {reason}")]
pub struct TransformError {
    /// Version of the offending event, for the skip-and-log message.
    pub event_version: u32,
    /// Human-readable reason, surfaced only in logs.
    pub reason: String,
}

/// Everything a [`crate::engine::MigrationEngine`] needs to migrate one open stream.
#[derive(Clone)]
pub struct LiveMigrationContext {
    /// Identifies this migration run; stamped onto the closure marker.
    pub migration_id: Uuid,
    /// The object document whose active stream is being migrated. The
    /// engine never mutates this directly -- it calls back into the
    /// registry at `LINK` with a fresh copy carrying the new active stream.
    pub object_document: ObjectDocument,
    /// Identifier of the stream to migrate into. Freshly minted by the caller.
    pub target_stream_id: String,
    /// Backend discriminator of the target stream, e.g. `"s3"`.
    pub target_stream_type: String,
    /// Data-store binding for the target stream.
    pub data_store: String,
    /// Document-store binding for the target stream.
    pub document_store: String,
    /// Tunables and callbacks.
    pub options: Options,
    /// Per-event translation; `None` means the identity transform.
    pub transformer: Option<Arc<dyn Transformer>>,
}

impl LiveMigrationContext {
    /// The stream identifier being migrated away from.
    #[must_use]
    pub fn source_stream_id(&self) -> &str {
        &self.object_document.active.stream_identifier
    }
}
