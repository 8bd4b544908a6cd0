//! The outcome of a [`crate::engine::MigrationEngine::run`] call.

use std::time::Duration;

use uuid::Uuid;

use crate::error::MigrationError;

/// The result of a live migration run. The engine never propagates an
/// error out of `run` -- every failure is packed in here instead, so a
/// caller always gets a value back, never a thrown exception.
#[derive(Debug)]
pub struct LiveMigrationResult {
    /// Whether the migration converged and the object document now points at the target stream.
    pub success: bool,
    /// Identifies this migration run.
    pub migration_id: Uuid,
    /// The stream migrated away from.
    pub source_stream_id: String,
    /// The stream migrated into.
    pub target_stream_id: String,
    /// Total events copied from source to target, including any late events.
    pub total_events_copied: u64,
    /// Number of catch-up rounds performed.
    pub iterations: u32,
    /// Wall-clock time the whole run took.
    pub elapsed: Duration,
    /// The failure, if `success` is `false`.
    pub error: Option<MigrationError>,
}

impl LiveMigrationResult {
    /// Whether this run did not converge.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !self.success
    }
}
