//! Component G: the Live Migration Engine.
//!
//! Drives one open, hot stream through `CATCH_UP -> ATTEMPT_CLOSE ->
//! POST_CLOSE_VERIFY -> LINK -> DONE` without quiescing writers. The only
//! critical section anywhere in this module is the append path's own
//! `(GET doc, CAS PUT doc)`, inherited unchanged from
//! [`eventually_object_store::stream_store::EventStreamStore`]; the engine
//! itself holds no lock.

use chrono::Utc;
use eventually_object_store::codec::{ClosureMarkerPayload, Metadata, STREAM_CLOSED_EVENT_TYPE};
use eventually_object_store::error::StreamStoreError;
use eventually_object_store::registry::{ObjectDocument, ObjectDocumentRegistry, StreamInfo, TerminatedStream};
use eventually_object_store::stream_store::{EventStreamStore, NewEvent};
use eventually_object_store::version::Version;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::{CatchUpProgress, EventProgress, FailureStrategy, LiveMigrationContext};
use crate::error::MigrationError;
use crate::result::LiveMigrationResult;

#[derive(Debug, Default, Clone, Copy)]
struct RunOutcome {
    total_events_copied: u64,
    iterations: u32,
}

/// Runs live migrations against one [`EventStreamStore`]/[`ObjectDocumentRegistry`] pair.
pub struct MigrationEngine<'a> {
    stream_store: &'a EventStreamStore,
    registry: &'a dyn ObjectDocumentRegistry,
}

impl<'a> MigrationEngine<'a> {
    /// Builds an engine over the given stream store and registry.
    #[must_use]
    pub fn new(stream_store: &'a EventStreamStore, registry: &'a dyn ObjectDocumentRegistry) -> Self {
        Self { stream_store, registry }
    }

    /// Runs one migration to completion (or failure). Never returns an
    /// error: every failure mode is packed into the returned
    /// [`LiveMigrationResult`].
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self, ctx, cancellation)))]
    pub async fn run(&self, ctx: LiveMigrationContext, cancellation: CancellationToken) -> LiveMigrationResult {
        let start = Instant::now();
        let deadline = start + ctx.options.close_timeout;
        let migration_id = ctx.migration_id;
        let source_stream_id = ctx.source_stream_id().to_string();
        let target_stream_id = ctx.target_stream_id.clone();

        let (success, outcome, error) = match self.run_inner(&ctx, &cancellation, deadline).await {
            Ok(outcome) => (true, outcome, None),
            Err((err, outcome)) => (false, outcome, Some(err)),
        };

        LiveMigrationResult {
            success,
            migration_id,
            source_stream_id,
            target_stream_id,
            total_events_copied: outcome.total_events_copied,
            iterations: outcome.iterations,
            elapsed: start.elapsed(),
            error,
        }
    }

    async fn run_inner(
        &self,
        ctx: &LiveMigrationContext,
        cancellation: &CancellationToken,
        deadline: Instant,
    ) -> Result<RunOutcome, (MigrationError, RunOutcome)> {
        let mut outcome = RunOutcome::default();
        let mut source = ctx.object_document.clone();
        let mut target = build_target_handle(ctx);

        loop {
            let steady = match self
                .catch_up_until_steady(ctx, &mut source, &mut target, cancellation, deadline, &mut outcome)
                .await
            {
                Ok(version) => version,
                Err(err) => return Err((err, outcome)),
            };

            match self.attempt_close(ctx, &mut source, steady, cancellation).await {
                Ok(true) => break,
                Ok(false) => continue,
                Err(err) => return Err((err, outcome)),
            }
        }

        loop {
            match self.copy_late_events(ctx, &source, &mut target, cancellation).await {
                Ok(0) => break,
                Ok(copied) => outcome.total_events_copied += copied,
                Err(err) => return Err((err, outcome)),
            }
        }

        if let Err(err) = self.link(ctx, &target).await {
            return Err((err, outcome));
        }

        Ok(outcome)
    }

    /// Reads events forward from `start_version`, skipping the closure
    /// marker (it is never copied), transforming and appending each to
    /// `target` one at a time.
    async fn copy_range(
        &self,
        ctx: &LiveMigrationContext,
        source: &ObjectDocument,
        target: &mut ObjectDocument,
        start_version: Version,
        cancellation: &CancellationToken,
    ) -> Result<u64, MigrationError> {
        let events = self
            .stream_store
            .read(source, start_version, None, None)
            .await?
            .unwrap_or_default();

        let mut copied = 0u64;

        for event in events {
            if cancellation.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }
            if event.is_closure_marker() {
                continue;
            }

            let event_version = event.event_version;
            let transformed = match &ctx.transformer {
                Some(transformer) => match transformer.transform(event).await {
                    Ok(transformed) => transformed,
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            migration.id = %ctx.migration_id,
                            event.version = event_version,
                            reason = %_err.reason,
                            "skipping event: transform failed"
                        );
                        continue;
                    }
                },
                None => event,
            };

            let progress = EventProgress {
                event: transformed.clone(),
                total_events_copied: copied + 1,
            };

            if let Some(cb) = &ctx.options.on_before_append {
                cb(progress.clone()).await;
            }

            let new_event = NewEvent {
                event_type: transformed.event_type.clone(),
                payload: transformed.payload.clone(),
                schema_version: transformed.schema_version,
                metadata: transformed.metadata.clone(),
                timestamp: Some(transformed.timestamp),
            };

            let append_outcome = self.stream_store.append(target, vec![new_event], true, cancellation).await?;
            target.active.current_stream_version = Some(append_outcome.last_version);
            target.active.last_document_hash = Some(append_outcome.new_document_hash);
            copied += 1;

            if let Some(cb) = &ctx.options.on_event_copied {
                cb(progress).await;
            }
        }

        Ok(copied)
    }

    /// Reads the source stream's highest event version, or `None` if it has never been written.
    async fn source_version(&self, source: &ObjectDocument) -> Result<Option<Version>, MigrationError> {
        Ok(self
            .stream_store
            .read(source, 0, None, None)
            .await?
            .and_then(|events| events.last().map(|e| e.event_version)))
    }

    /// Copies source events forward until the source and target converge,
    /// enforcing `closeTimeout`/`maxIterations` along the way. Returns the
    /// source version observed at convergence.
    async fn catch_up_until_steady(
        &self,
        ctx: &LiveMigrationContext,
        source: &mut ObjectDocument,
        target: &mut ObjectDocument,
        cancellation: &CancellationToken,
        deadline: Instant,
        outcome: &mut RunOutcome,
    ) -> Result<Option<Version>, MigrationError> {
        loop {
            if cancellation.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(MigrationError::Timeout(ctx.options.close_timeout));
            }

            outcome.iterations += 1;
            if ctx.options.max_iterations != 0 && outcome.iterations > ctx.options.max_iterations {
                return Err(MigrationError::MaxIterationsExceeded(ctx.options.max_iterations));
            }

            let source_version = self.source_version(source).await?;
            let target_version = target.active.current_stream_version;
            let s_v = source_version.map_or(-1i64, i64::from);
            let t_v = target_version.map_or(-1i64, i64::from);

            if s_v > t_v {
                #[allow(clippy::cast_sign_loss)]
                let start_version = Version::try_from(t_v + 1).unwrap_or(0);
                let copied = self.copy_range(ctx, source, target, start_version, cancellation).await?;
                outcome.total_events_copied += copied;
            }

            let new_target_version = target.active.current_stream_version;

            if let Some(cb) = &ctx.options.on_catch_up_progress {
                cb(CatchUpProgress {
                    source_version,
                    target_version: new_target_version,
                    total_events_copied: outcome.total_events_copied,
                });
            }

            if s_v == new_target_version.map_or(-1i64, i64::from) {
                return Ok(source_version);
            }

            tokio::time::sleep(ctx.options.catch_up_delay).await;
        }
    }

    /// Reloads the source fresh and appends the closure marker through the
    /// normal append path. Returns `Ok(true)` on success, `Ok(false)` when
    /// the caller should go back to `CATCH_UP` (the source advanced, or the
    /// append lost a conflict-shaped race).
    async fn attempt_close(
        &self,
        ctx: &LiveMigrationContext,
        source: &mut ObjectDocument,
        steady_source_version: Option<Version>,
        cancellation: &CancellationToken,
    ) -> Result<bool, MigrationError> {
        if cancellation.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }

        let reloaded_version = self.source_version(source).await?;
        if reloaded_version != steady_source_version {
            return Ok(false);
        }

        let closed_at = Utc::now();
        let payload = ClosureMarkerPayload {
            continuation_stream_id: ctx.target_stream_id.clone(),
            migration_id: ctx.migration_id,
            closed_at,
            source_stream_type: Some(source.active.stream_type.clone()),
            target_stream_type: Some(ctx.target_stream_type.clone()),
            source_data_store: Some(source.active.data_store.clone()),
            target_data_store: Some(ctx.data_store.clone()),
            target_document_store: Some(ctx.document_store.clone()),
        };

        let closure_event = NewEvent {
            event_type: STREAM_CLOSED_EVENT_TYPE.to_string(),
            payload: serde_json::to_value(&payload).map_err(|err| MigrationError::Stream(StreamStoreError::Codec(err)))?,
            schema_version: 1,
            metadata: Metadata::new(),
            timestamp: Some(closed_at),
        };

        match self.stream_store.append(source, vec![closure_event], true, cancellation).await {
            Ok(append_outcome) => {
                source.active.current_stream_version = Some(append_outcome.last_version);
                source.active.last_document_hash = Some(append_outcome.new_document_hash);
                Ok(true)
            }
            Err(err) => {
                let wrapped = MigrationError::Stream(err);
                let keep_trying = ctx.options.failure_strategy == FailureStrategy::KeepTrying;
                if wrapped.is_close_retriable() && keep_trying {
                    Ok(false)
                } else {
                    Err(wrapped)
                }
            }
        }
    }

    /// Copies any events appended to the source between the version check
    /// and the successful closure append. The source is sealed by this
    /// point, so this converges in at most one non-empty pass.
    async fn copy_late_events(
        &self,
        ctx: &LiveMigrationContext,
        source: &ObjectDocument,
        target: &mut ObjectDocument,
        cancellation: &CancellationToken,
    ) -> Result<u64, MigrationError> {
        let start_version = target.active.current_stream_version.map_or(0, |v| v + 1);
        self.copy_range(ctx, source, target, start_version, cancellation).await
    }

    /// The atomic hand-off: records the source as terminated and flips the
    /// object document's active stream to the target, through the registry.
    async fn link(&self, ctx: &LiveMigrationContext, target: &ObjectDocument) -> Result<(), MigrationError> {
        let mut doc = self
            .registry
            .get(&ctx.object_document.object_name, &ctx.object_document.object_id)
            .await?
            .unwrap_or_else(|| ctx.object_document.clone());

        doc.terminated_streams.push(TerminatedStream {
            stream_identifier: ctx.source_stream_id().to_string(),
            stream_type: ctx.object_document.active.stream_type.clone(),
            reason: "live-migration".to_string(),
            continuation_stream_id: Some(ctx.target_stream_id.clone()),
        });
        doc.active = target.active.clone();

        self.registry.set(&mut doc).await?;
        Ok(())
    }
}

fn build_target_handle(ctx: &LiveMigrationContext) -> ObjectDocument {
    let mut target = ctx.object_document.clone();
    target.active = StreamInfo {
        stream_identifier: ctx.target_stream_id.clone(),
        stream_type: ctx.target_stream_type.clone(),
        current_stream_version: None,
        data_store: ctx.data_store.clone(),
        document_store: ctx.document_store.clone(),
        snapshot_store: ctx.object_document.active.snapshot_store.clone(),
        chunks: None,
        last_document_hash: None,
    };
    target
}
