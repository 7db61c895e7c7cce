//! OrchestrationCoordinator: owns the pipeline state machine.
//!
//! `INIT → DISPATCHED → COLLECTING → AGGREGATED → SYNTHESIZING →
//! {COMPLETE | PARTIAL | FAILED}` (plus `CANCELLED`). One concurrent
//! retrieval task per entity; results are merged once, after every
//! task settles, so there is no shared mutable state between workers.
//! Retry policy (timeouts only, exponential backoff) lives here, not
//! in the worker, keeping it centrally testable.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use shared_types::{
    ComparisonRequest, ComparisonStatus, EntityFailure, EntityId, EntityResult, FailureKind,
    MetricKind, MissingEntity, SectionKind, SynthesisResult, TimeScope,
};

use crate::aggregate::aggregate;
use crate::backend::{NarrativeBackend, RetrievalBackend};
use crate::cache::{request_signature, ComparisonCache};
use crate::config::EngineConfig;
use crate::error::PipelineError;
use crate::retrieval::{retrieve, RetrievalOptions};
use crate::synthesis::synthesize;

/// State-machine tag for one in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum PipelineStage {
    Init,
    Dispatched,
    Collecting,
    Aggregated,
    Synthesizing,
    Complete,
    Partial,
    Failed,
    Cancelled,
}

/// Per-request pipeline state; created at entry, destroyed when the
/// request terminates. Never shared across requests.
struct PipelineState {
    run_id: String,
    stage: PipelineStage,
}

impl PipelineState {
    fn new(run_id: String) -> Self {
        tracing::debug!(run_id = %run_id, stage = %PipelineStage::Init, "pipeline entered");
        Self {
            run_id,
            stage: PipelineStage::Init,
        }
    }

    fn advance(&mut self, next: PipelineStage) {
        tracing::debug!(run_id = %self.run_id, from = %self.stage, to = %next, "pipeline transition");
        self.stage = next;
    }
}

/// One entity's retrieval task. Owned exclusively by the coordinator
/// for its lifetime; never shared between workers.
struct EntityQueryTask {
    entity: EntityId,
    /// Attempts made so far (capped at `EngineConfig::max_attempts`).
    attempt: u32,
    deadline: Instant,
}

/// The comparison engine: coordinator plus its shared cache and the
/// two external backend seams.
pub struct ComparisonEngine {
    retrieval: Arc<dyn RetrievalBackend>,
    narrative: Arc<dyn NarrativeBackend>,
    config: EngineConfig,
    cache: Arc<ComparisonCache>,
}

impl ComparisonEngine {
    pub fn new(
        retrieval: Arc<dyn RetrievalBackend>,
        narrative: Arc<dyn NarrativeBackend>,
        config: EngineConfig,
    ) -> Self {
        Self {
            retrieval,
            narrative,
            config,
            cache: Arc::new(ComparisonCache::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one comparison to a terminal outcome.
    pub async fn run(&self, request: &ComparisonRequest) -> Result<SynthesisResult, PipelineError> {
        self.run_cancellable(request, CancellationToken::new())
            .await
    }

    /// Run one comparison under a caller-held cancellation token.
    /// Cancellation aborts outstanding retrieval tasks and returns
    /// `PipelineError::Cancelled`; no partial result is produced.
    pub async fn run_cancellable(
        &self,
        request: &ComparisonRequest,
        cancel: CancellationToken,
    ) -> Result<SynthesisResult, PipelineError> {
        let started = std::time::Instant::now();
        let mut state = PipelineState::new(Ulid::new().to_string());

        // Request invariants (entity count, non-empty metrics) hold by
        // construction of `ComparisonRequest`; an invalid request never
        // reaches this point, so no tasks are ever spawned for one.
        let signature = request_signature(request);
        if let Some(hit) = self.cache.get(&signature) {
            tracing::info!(run_id = %state.run_id, "cache hit; skipping dispatch");
            return Ok(hit);
        }

        state.advance(PipelineStage::Dispatched);
        let global_deadline = Instant::now() + self.config.global_deadline;
        let mut tasks: JoinSet<(EntityId, EntityResult)> = JoinSet::new();
        for entity in request.entities() {
            let task = EntityQueryTask {
                entity: entity.clone(),
                attempt: 0,
                deadline: global_deadline,
            };
            let backend = Arc::clone(&self.retrieval);
            let metrics: Vec<MetricKind> = request.metrics().iter().copied().collect();
            let sections: Vec<SectionKind> = request.required_sections().iter().copied().collect();
            let time_scope = request.time_scope();
            let config = self.config.clone();
            tasks.spawn(async move {
                let entity = task.entity.clone();
                let result =
                    run_entity_task(backend.as_ref(), task, &metrics, &sections, time_scope, &config)
                        .await;
                (entity, result)
            });
        }

        state.advance(PipelineStage::Collecting);
        let mut results: BTreeMap<EntityId, EntityResult> = BTreeMap::new();
        while results.len() < request.entities().len() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    state.advance(PipelineStage::Cancelled);
                    tracing::info!(run_id = %state.run_id, "run cancelled by caller");
                    return Err(PipelineError::Cancelled);
                }
                _ = tokio::time::sleep_until(global_deadline) => {
                    // Still-pending tasks are forcibly failed; their
                    // in-flight work is aborted, not awaited further.
                    tasks.abort_all();
                    for entity in request.entities() {
                        results.entry(entity.clone()).or_insert_with(|| {
                            EntityResult::Failure(EntityFailure {
                                kind: FailureKind::Timeout,
                                detail: "global deadline elapsed before retrieval settled"
                                    .to_string(),
                                attempts: 0,
                            })
                        });
                    }
                    tracing::warn!(run_id = %state.run_id, "global deadline elapsed");
                    break;
                }
                joined = tasks.join_next() => {
                    match joined {
                        Some(Ok((entity, result))) => {
                            tracing::debug!(
                                run_id = %state.run_id,
                                entity = %entity,
                                success = result.is_success(),
                                "entity task settled"
                            );
                            results.insert(entity, result);
                        }
                        Some(Err(join_err)) => {
                            tracing::error!(run_id = %state.run_id, error = %join_err, "entity task aborted");
                        }
                        None => break,
                    }
                }
            }
        }
        // Any hole left by an aborted task is attributed, never dropped.
        for entity in request.entities() {
            results.entry(entity.clone()).or_insert_with(|| {
                EntityResult::Failure(EntityFailure {
                    kind: FailureKind::Backend,
                    detail: "retrieval task aborted".to_string(),
                    attempts: 0,
                })
            });
        }

        // Quorum: at least one success is required to synthesize.
        if !results.values().any(EntityResult::is_success) {
            state.advance(PipelineStage::Failed);
            let failures = request
                .entities()
                .iter()
                .filter_map(|entity| match results.get(entity) {
                    Some(EntityResult::Failure(failure)) => Some(MissingEntity {
                        entity: entity.clone(),
                        kind: failure.kind,
                        detail: failure.detail.clone(),
                    }),
                    _ => None,
                })
                .collect();
            return Err(PipelineError::InsufficientData { failures });
        }

        state.advance(PipelineStage::Aggregated);
        let comparison = aggregate(request, results);

        state.advance(PipelineStage::Synthesizing);
        let outcome = match synthesize(self.narrative.as_ref(), request, &comparison).await {
            Ok(outcome) => outcome,
            Err(error) => {
                state.advance(PipelineStage::Failed);
                // The merged comparison is still useful; hand it back.
                return Err(PipelineError::Synthesis {
                    error,
                    fallback: Box::new(comparison),
                });
            }
        };

        let status = if comparison.missing_entities.is_empty() {
            ComparisonStatus::Complete
        } else {
            ComparisonStatus::Partial
        };
        state.advance(match status {
            ComparisonStatus::Complete => PipelineStage::Complete,
            _ => PipelineStage::Partial,
        });

        let result = SynthesisResult {
            narrative: outcome.narrative,
            table: outcome.table,
            citations: outcome.citations,
            status,
            missing_entities: comparison.missing_entities.clone(),
            verdict: outcome.verdict,
            confidence: outcome.confidence,
            processing_time_ms: started.elapsed().as_millis() as u64,
        };
        // Advisory cache: written only on COMPLETE/PARTIAL. Partial
        // results carry the shorter TTL so a degraded comparison is
        // re-attempted sooner.
        let ttl = match status {
            ComparisonStatus::Complete => self.config.result_cache_ttl,
            _ => self.config.partial_cache_ttl,
        };
        self.cache.put(signature, result.clone(), ttl);
        tracing::info!(
            run_id = %state.run_id,
            status = %result.status,
            missing = result.missing_entities.len(),
            elapsed_ms = result.processing_time_ms,
            "pipeline finished"
        );
        Ok(result)
    }
}

/// Drive one entity's task to a terminal state, applying the retry
/// policy: timeouts retried with exponential backoff up to the attempt
/// cap, `NotFound` and backend errors never retried. Each attempt gets
/// the remaining global budget subdivided across the attempts still
/// allowed, so retries cannot starve.
async fn run_entity_task(
    backend: &dyn RetrievalBackend,
    mut task: EntityQueryTask,
    metrics: &[MetricKind],
    sections: &[SectionKind],
    time_scope: TimeScope,
    config: &EngineConfig,
) -> EntityResult {
    let opts = RetrievalOptions {
        top_k: config.top_k,
        score_threshold: config.score_threshold,
    };

    loop {
        task.attempt += 1;
        let now = Instant::now();
        let remaining = task.deadline.duration_since(now);
        if remaining.is_zero() {
            return EntityResult::Failure(EntityFailure {
                kind: FailureKind::Timeout,
                detail: format!("retrieval timed out after {} attempts", task.attempt - 1),
                attempts: task.attempt - 1,
            });
        }
        let attempts_left = config.max_attempts().saturating_sub(task.attempt - 1).max(1);
        let attempt_deadline = now + remaining / attempts_left;

        let result = retrieve(
            backend,
            &task.entity,
            metrics,
            sections,
            time_scope,
            attempt_deadline,
            opts,
        )
        .await;

        match result {
            EntityResult::Failure(failure) if failure.kind == FailureKind::Timeout => {
                if task.attempt >= config.max_attempts() {
                    return EntityResult::Failure(EntityFailure {
                        kind: FailureKind::Timeout,
                        detail: format!("retrieval timed out after {} attempts", task.attempt),
                        attempts: task.attempt,
                    });
                }
                let backoff = backoff_delay(config.retry_base_delay, task.attempt);
                tracing::info!(
                    entity = %task.entity,
                    attempt = task.attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrieval timed out; retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            EntityResult::Failure(mut failure) => {
                // NotFound / backend errors are terminal immediately.
                failure.attempts = task.attempt;
                return EntityResult::Failure(failure);
            }
            success => return success,
        }
    }
}

/// Exponential backoff before retry `attempt + 1`, saturating instead
/// of overflowing under an absurd attempt cap from the environment.
fn backoff_delay(base: std::time::Duration, attempt: u32) -> std::time::Duration {
    base.saturating_mul(2u32.saturating_pow(attempt - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_doubles_per_attempt_and_saturates() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(250));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(1));
        // Attempt counts past the width of the multiplier clamp rather
        // than panicking.
        assert_eq!(backoff_delay(base, 33), backoff_delay(base, 64));
    }
}
