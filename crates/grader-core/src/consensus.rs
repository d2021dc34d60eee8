//! Multi-evaluator consensus.
//!
//! One artifact, several model calls, one [`Verdict`]. Two reconciliation
//! policies share the same verdict shape:
//!
//! - **Adjudicated** (default): `N` independent opinions fetched in parallel,
//!   then one adjudicator call that merges the usable ones. No usable
//!   opinion, or an adjudicator that fails, yields an error verdict; an
//!   opinion is never promoted on its own.
//! - **Double pass**: an initial call and a double-check call. The
//!   double-check wins if the initial is an error and it is not, or if it
//!   lists strictly more issues.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::cache::Cached;
use crate::domain::{RawVerdict, Rubric, TokenUsage, Verdict};
use crate::model::{CachedModelClient, ChatMessage, ModelCallResult};
use crate::parser::parse;
use crate::prompt::{adjudicator_messages, opinion_messages, pass_messages, Pass};

/// How model responses for one artifact are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsensusPolicy {
    /// `opinions` parallel calls merged by one adjudicator call.
    Adjudicated {
        #[serde(default = "default_opinions")]
        opinions: usize,
    },
    /// Initial call plus double-check call.
    DoublePass,
}

fn default_opinions() -> usize {
    3
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        ConsensusPolicy::Adjudicated {
            opinions: default_opinions(),
        }
    }
}

impl std::fmt::Display for ConsensusPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusPolicy::Adjudicated { opinions } => write!(f, "adjudicated:{opinions}"),
            ConsensusPolicy::DoublePass => f.write_str("double_pass"),
        }
    }
}

impl std::str::FromStr for ConsensusPolicy {
    type Err = String;

    /// `double_pass`, `adjudicated`, or `adjudicated:<opinions>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.split_once(':') {
            None if s == "double_pass" || s == "double-pass" => Ok(ConsensusPolicy::DoublePass),
            None if s == "adjudicated" => Ok(ConsensusPolicy::default()),
            Some(("adjudicated", n)) => match n.trim().parse::<usize>() {
                Ok(opinions) if opinions > 0 => Ok(ConsensusPolicy::Adjudicated { opinions }),
                _ => Err(format!("invalid opinion count '{n}'")),
            },
            _ => Err(format!(
                "unknown policy '{s}' (expected double_pass, adjudicated or adjudicated:<n>)"
            )),
        }
    }
}

/// A verdict plus what it cost to obtain.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactEvaluation {
    pub verdict: Verdict,
    /// Calls that reached the model (not answered from cache).
    pub external_calls: u64,
    pub cache_hits: u64,
}

impl ArtifactEvaluation {
    /// Error verdict with no calls recorded.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::error(message),
            external_calls: 0,
            cache_hits: 0,
        }
    }
}

/// Per-artifact call accounting.
#[derive(Debug, Default)]
struct CallLedger {
    tokens: TokenUsage,
    external_calls: u64,
    cache_hits: u64,
}

impl CallLedger {
    /// Record one call and return its result.
    fn record(&mut self, call: Cached<ModelCallResult>) -> ModelCallResult {
        if call.insight.hit {
            self.cache_hits += 1;
        } else {
            self.external_calls += 1;
            if let ModelCallResult::Success(reply) = &call.value {
                self.tokens += reply.tokens;
            }
        }
        call.value
    }

    fn finish(self, verdict: Verdict, started: Instant) -> ArtifactEvaluation {
        ArtifactEvaluation {
            verdict: verdict
                .with_tokens(self.tokens)
                .with_timing(started.elapsed().as_secs_f64()),
            external_calls: self.external_calls,
            cache_hits: self.cache_hits,
        }
    }
}

/// Parsed verdict for a successful call; `None` for an empty or failed one.
fn interpret(result: ModelCallResult, label: &str) -> Option<RawVerdict> {
    match result {
        ModelCallResult::Success(reply) => Some(parse(&reply.content)),
        ModelCallResult::Empty => {
            warn!(call = label, "model returned an empty response");
            None
        }
        ModelCallResult::Failure { reason } => {
            warn!(call = label, %reason, "model call failed");
            None
        }
    }
}

/// Double-pass selection. `None` when neither pass produced anything.
pub fn select_double_pass(
    initial: Option<RawVerdict>,
    double_check: Option<RawVerdict>,
) -> Option<RawVerdict> {
    match (initial, double_check) {
        (None, check) => check,
        (Some(initial), None) => Some(initial),
        (Some(initial), Some(check)) => {
            if initial.is_error() && !check.is_error() {
                Some(check)
            } else if check.issue_count() > initial.issue_count() {
                Some(check)
            } else {
                Some(initial)
            }
        }
    }
}

/// Reconciles several model calls into one verdict per artifact.
pub struct ConsensusEngine {
    model: CachedModelClient,
    policy: ConsensusPolicy,
    opinion_workers: usize,
}

impl ConsensusEngine {
    pub fn new(model: CachedModelClient, policy: ConsensusPolicy) -> Self {
        Self {
            model,
            policy,
            opinion_workers: 3,
        }
    }

    /// Bound on concurrent opinion calls per artifact.
    pub fn with_opinion_workers(mut self, workers: usize) -> Self {
        self.opinion_workers = workers.max(1);
        self
    }

    pub fn policy(&self) -> ConsensusPolicy {
        self.policy
    }

    pub fn model(&self) -> &CachedModelClient {
        &self.model
    }

    /// Evaluate one artifact. Never fails: every failure path ends in an
    /// error verdict.
    #[instrument(skip(self, content, rubric), fields(policy = %self.policy))]
    pub async fn evaluate_artifact(
        &self,
        artifact: &str,
        content: &str,
        rubric: &Rubric,
    ) -> ArtifactEvaluation {
        match self.policy {
            ConsensusPolicy::DoublePass => self.double_pass(artifact, content, rubric).await,
            ConsensusPolicy::Adjudicated { opinions } => {
                self.adjudicated(artifact, content, rubric, opinions).await
            }
        }
    }

    async fn double_pass(&self, artifact: &str, content: &str, rubric: &Rubric) -> ArtifactEvaluation {
        let started = Instant::now();
        let mut ledger = CallLedger::default();

        let initial_msgs = pass_messages(Pass::Initial, artifact, content, rubric);
        let check_msgs = pass_messages(Pass::DoubleCheck, artifact, content, rubric);
        let (initial, check) =
            tokio::join!(self.model.call(&initial_msgs), self.model.call(&check_msgs));

        let initial = interpret(ledger.record(initial), "initial");
        let check = interpret(ledger.record(check), "double_check");

        let verdict = match select_double_pass(initial, check) {
            Some(raw) => Verdict::from_raw(raw),
            None => Verdict::error("no usable response from initial or double-check call"),
        };
        ledger.finish(verdict, started)
    }

    async fn adjudicated(
        &self,
        artifact: &str,
        content: &str,
        rubric: &Rubric,
        opinions: usize,
    ) -> ArtifactEvaluation {
        let started = Instant::now();
        let mut ledger = CallLedger::default();

        let sem = Arc::new(Semaphore::new(self.opinion_workers));
        let mut pending = FuturesUnordered::new();
        for index in 1..=opinions.max(1) {
            let sem = Arc::clone(&sem);
            let messages = opinion_messages(index, artifact, content, rubric);
            pending.push(async move {
                let _permit = sem.acquire_owned().await.ok();
                (index, self.model.call(&messages).await)
            });
        }

        let mut collected: Vec<(usize, Cached<ModelCallResult>)> = Vec::with_capacity(opinions);
        while let Some(done) = pending.next().await {
            collected.push(done);
        }
        // Stable adjudicator prompt (and cache key) regardless of completion order.
        collected.sort_by_key(|(index, _)| *index);

        let total = collected.len();
        let usable: Vec<RawVerdict> = collected
            .into_iter()
            .filter_map(|(index, call)| {
                let label = format!("opinion_{index}");
                interpret(ledger.record(call), &label).filter(|raw| {
                    if raw.is_error() {
                        warn!(call = %label, "opinion not interpretable; excluded");
                    }
                    !raw.is_error()
                })
            })
            .collect();

        if usable.is_empty() {
            return ledger.finish(
                Verdict::error(format!("all {total} opinions were empty or unusable")),
                started,
            );
        }
        debug!(usable = usable.len(), total, "opinions collected");

        let messages: Vec<ChatMessage> = adjudicator_messages(artifact, rubric, &usable);
        let verdict = match ledger.record(self.model.call(&messages).await) {
            ModelCallResult::Success(reply) => {
                let raw = parse(&reply.content);
                if raw.is_error() {
                    Verdict::error("adjudicator output not interpretable")
                } else {
                    Verdict::from_raw(raw)
                }
            }
            ModelCallResult::Empty => Verdict::error("adjudicator returned an empty response"),
            ModelCallResult::Failure { reason } => {
                Verdict::error(format!("adjudicator call failed: {reason}"))
            }
        };
        ledger.finish(verdict, started)
    }
}
