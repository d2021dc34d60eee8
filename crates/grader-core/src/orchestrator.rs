//! Batch orchestration.
//!
//! Fans a batch of artifacts out over a fixed-width pool of tokio tasks, one
//! [`ConsensusEngine::evaluate_artifact`] call per artifact, and folds the
//! results into a [`BatchReport`]. A task that panics or is cut off by the
//! batch deadline becomes an error verdict; siblings keep running.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use grader_state::CacheBackend;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::aggregate;
use crate::cache::{CacheLayer, CacheSite};
use crate::config::GraderConfig;
use crate::consensus::{ArtifactEvaluation, ConsensusEngine};
use crate::domain::{BatchReport, Result, Rubric, TokenUsage, Verdict};
use crate::model::{CachedModelClient, ModelClient};
use crate::obs::{
    emit_artifact_evaluated, emit_batch_finished, emit_batch_started, emit_batch_timeout, BatchSpan,
};
use crate::rubric_store::CachedRubricStore;
use crate::submission::parse_submission;

/// Runs batches of artifacts through the consensus engine.
pub struct Orchestrator {
    engine: Arc<ConsensusEngine>,
    max_workers: usize,
    batch_timeout: Option<Duration>,
    response_cache: Option<CacheLayer>,
}

/// Running totals over completed artifact tasks.
#[derive(Default)]
struct BatchTally {
    verdicts: BTreeMap<String, Verdict>,
    tokens: TokenUsage,
    external_calls: u64,
    cache_hits: u64,
}

impl BatchTally {
    fn record(&mut self, artifact: String, evaluation: ArtifactEvaluation) {
        emit_artifact_evaluated(
            &artifact,
            !evaluation.verdict.is_error(),
            evaluation.verdict.points_lost(),
            evaluation.external_calls,
        );
        self.tokens += evaluation.verdict.tokens_used();
        self.external_calls += evaluation.external_calls;
        self.cache_hits += evaluation.cache_hits;
        self.verdicts.insert(artifact, evaluation.verdict);
    }
}

fn join_failure(artifact: &str, err: JoinError) -> ArtifactEvaluation {
    if err.is_panic() {
        warn!(artifact, "evaluation task panicked");
        ArtifactEvaluation::failed("evaluation task panicked")
    } else {
        ArtifactEvaluation::failed("evaluation task cancelled")
    }
}

impl Orchestrator {
    pub fn new(engine: ConsensusEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            max_workers: 3,
            batch_timeout: None,
            response_cache: None,
        }
    }

    /// Wire an orchestrator from configuration.
    ///
    /// Every cache site shares `backend`; each gets its configured TTL.
    pub fn from_config(
        config: &GraderConfig,
        model: Arc<dyn ModelClient>,
        backend: Arc<dyn CacheBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let model_cache = CacheLayer::new(Arc::clone(&backend), CacheSite::ModelCall)
            .with_ttl(config.cache.for_site(CacheSite::ModelCall));
        let response_cache = CacheLayer::new(backend, CacheSite::Response)
            .with_ttl(config.cache.for_site(CacheSite::Response));

        let engine = ConsensusEngine::new(CachedModelClient::new(model, model_cache), config.policy)
            .with_opinion_workers(config.opinion_workers);

        let mut orchestrator = Self::new(engine)
            .with_max_workers(config.max_workers)
            .with_response_cache(response_cache);
        if let Some(timeout) = config.batch_timeout() {
            orchestrator = orchestrator.with_batch_timeout(timeout);
        }
        Ok(orchestrator)
    }

    /// Artifacts evaluated concurrently (at least one).
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    /// Deadline for the whole batch. Tasks still running when it passes are
    /// aborted and reported as errors.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    /// Cache whole submission reports through the response site.
    pub fn with_response_cache(mut self, cache: CacheLayer) -> Self {
        self.response_cache = Some(cache);
        self
    }

    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Evaluate every artifact that has a rubric.
    ///
    /// Never fails. Artifacts without a rubric are listed in
    /// `BatchReport::skipped`; everything else gets a verdict, an error
    /// verdict if its task failed.
    pub async fn evaluate_batch(
        &self,
        artifacts: &BTreeMap<String, String>,
        rubrics: &BTreeMap<String, Rubric>,
    ) -> BatchReport {
        let batch_id = Uuid::new_v4();
        let span = BatchSpan::new(&batch_id.to_string());
        span.attach(self.run_batch(batch_id, artifacts, rubrics))
            .await
    }

    async fn run_batch(
        &self,
        batch_id: Uuid,
        artifacts: &BTreeMap<String, String>,
        rubrics: &BTreeMap<String, Rubric>,
    ) -> BatchReport {
        let started = Instant::now();
        let batch_id_str = batch_id.to_string();

        let mut skipped = Vec::new();
        let mut work = Vec::new();
        for (name, content) in artifacts {
            match rubrics.get(name) {
                Some(rubric) => work.push((name.clone(), content.clone(), rubric.clone())),
                None => {
                    warn!(artifact = %name, "no rubric for artifact; skipping");
                    skipped.push(name.clone());
                }
            }
        }
        emit_batch_started(&batch_id_str, work.len(), skipped.len());

        let sem = Arc::new(Semaphore::new(self.max_workers));
        let mut aborts: HashMap<String, AbortHandle> = HashMap::with_capacity(work.len());
        let mut pending = FuturesUnordered::new();
        for (name, content, rubric) in work {
            let engine = Arc::clone(&self.engine);
            let sem = Arc::clone(&sem);
            let artifact = name.clone();
            let handle = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                engine.evaluate_artifact(&artifact, &content, &rubric).await
            });
            aborts.insert(name.clone(), handle.abort_handle());
            pending.push(async move { (name, handle.await) });
        }

        let deadline = self.batch_timeout.map(|t| tokio::time::Instant::now() + t);
        let mut tally = BatchTally::default();
        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => pending.next().await,
            };
            let Some((name, joined)) = next else {
                break;
            };
            aborts.remove(&name);
            let evaluation = joined.unwrap_or_else(|e| join_failure(&name, e));
            tally.record(name, evaluation);
        }

        if !aborts.is_empty() {
            emit_batch_timeout(&batch_id_str, aborts.len());
            for (name, handle) in aborts {
                handle.abort();
                tally.record(name, ArtifactEvaluation::failed("batch timeout exceeded"));
            }
        }

        let summary = aggregate(&tally.verdicts);
        let error_evaluations = tally.verdicts.values().filter(|v| v.is_error()).count();
        let files_evaluated = tally.verdicts.len();
        let duration = started.elapsed();
        emit_batch_finished(
            &batch_id_str,
            duration.as_millis() as u64,
            files_evaluated,
            error_evaluations,
        );

        let model_metrics = self.engine.model().cache().metrics();
        model_metrics.flush(CacheSite::ModelCall.prefix());

        BatchReport {
            batch_id,
            per_artifact: tally.verdicts,
            skipped,
            total_points_lost: summary.total_points_lost,
            overall_feedback: summary.overall_feedback,
            files_evaluated,
            successful_evaluations: files_evaluated - error_evaluations,
            error_evaluations,
            aggregate_tokens: tally.tokens,
            external_call_count: tally.external_calls,
            cache_hits: tally.cache_hits,
            evaluation_time_seconds: duration.as_secs_f64(),
            generated_at: Utc::now(),
        }
    }

    /// Parse a pasted submission, look up each artifact's rubric, and
    /// evaluate the batch.
    ///
    /// Fails only when the rubric store cannot be reached. With a response
    /// cache configured, a report in which every artifact succeeded is
    /// reused for an identical submission and rubric set.
    pub async fn evaluate_submission(
        &self,
        text: &str,
        rubric_store: &CachedRubricStore,
    ) -> Result<BatchReport> {
        let artifacts = parse_submission(text);
        let rubrics = rubric_store
            .rubrics_for(artifacts.keys().map(String::as_str))
            .await?;
        debug!(artifacts = artifacts.len(), rubrics = rubrics.len(), "submission parsed");

        let Some(cache) = &self.response_cache else {
            return Ok(self.evaluate_batch(&artifacts, &rubrics).await);
        };

        #[derive(Serialize)]
        struct SubmissionArgs<'a> {
            artifacts: &'a BTreeMap<String, String>,
            rubrics: &'a BTreeMap<String, Rubric>,
            policy: String,
        }
        let args = SubmissionArgs {
            artifacts: &artifacts,
            rubrics: &rubrics,
            policy: self.engine.policy().to_string(),
        };
        let cached = cache
            .with_cache_if(
                "evaluate_submission",
                &args,
                || async {
                    Ok::<_, std::convert::Infallible>(
                        self.evaluate_batch(&artifacts, &rubrics).await,
                    )
                },
                BatchReport::all_succeeded,
            )
            .await;
        let cached = match cached {
            Ok(cached) => cached,
            Err(never) => match never {},
        };
        if cached.insight.hit {
            info!(batch_id = %cached.value.batch_id, "submission report served from cache");
        }
        Ok(cached.value)
    }
}
