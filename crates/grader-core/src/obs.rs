//! Structured observability hooks for the batch lifecycle.
//!
//! This module provides:
//! - Batch-scoped tracing spans via `BatchSpan`
//! - Emission functions for key lifecycle events: start, artifact evaluated,
//!   finish, cache lookup
//!
//! Lifecycle events go out at `info!`; per-lookup cache events at `debug!`.

use std::future::Future;

use tracing::instrument::Instrumented;
use tracing::{debug, info, Instrument};

/// Span tagged with a batch id, attached to the batch future.
///
/// Entering a span guard across `.await` would make the batch future
/// `!Send`, so the span is attached with `Instrument` instead.
///
/// # Example
///
/// ```ignore
/// let span = BatchSpan::new("5f0c...");
/// span.attach(async { /* every event here carries batch_id */ }).await;
/// ```
pub struct BatchSpan {
    span: tracing::Span,
}

impl BatchSpan {
    pub fn new(batch_id: &str) -> Self {
        Self {
            span: tracing::info_span!("grader.batch", batch_id = %batch_id),
        }
    }

    pub fn attach<F: Future>(&self, fut: F) -> Instrumented<F> {
        fut.instrument(self.span.clone())
    }
}

/// Emit event: batch started.
///
/// ```ignore
/// emit_batch_started("5f0c...", 3, 1);
/// // logs: event=batch.started batch_id=5f0c... artifacts=3 skipped=1
/// ```
pub fn emit_batch_started(batch_id: &str, artifacts: usize, skipped: usize) {
    info!(event = "batch.started", batch_id = %batch_id, artifacts, skipped);
}

/// Emit event: one artifact has a verdict.
pub fn emit_artifact_evaluated(artifact: &str, success: bool, points_lost: u32, external_calls: u64) {
    info!(
        event = "artifact.evaluated",
        artifact = %artifact,
        success,
        points_lost,
        external_calls,
    );
}

/// Emit event: batch finished with duration and error count.
pub fn emit_batch_finished(batch_id: &str, duration_ms: u64, evaluated: usize, errors: usize) {
    info!(
        event = "batch.finished",
        batch_id = %batch_id,
        duration_ms,
        evaluated,
        errors,
    );
}

/// Emit event: one cache lookup resolved.
pub fn emit_cache_lookup(site: &str, key: &str, hit: bool, error: bool, latency_ms: u64) {
    debug!(
        event = "cache.lookup",
        site = %site,
        key = %key,
        hit,
        error,
        latency_ms,
    );
}

/// Emit event: batch deadline passed with tasks still running (warning level).
pub fn emit_batch_timeout(batch_id: &str, aborted: usize) {
    tracing::warn!(event = "batch.timeout", batch_id = %batch_id, aborted);
}
