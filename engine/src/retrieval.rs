//! Retrieval worker: one deadline-bounded backend round-trip per call.
//!
//! Stateless between invocations; yields exactly one `EntityResult`,
//! either fully populated or a typed failure. Retry policy lives with
//! the coordinator, not here.

use std::collections::BTreeSet;

use tokio::time::Instant;

use shared_types::{
    EntityFailure, EntityId, EntityResult, FailureKind, MetricKind, RetrievedPassage, SectionKind,
    TimeScope,
};

use crate::backend::{RetrievalBackend, RetrievalError};

/// Worker knobs carried from `EngineConfig`.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalOptions {
    pub top_k: usize,
    pub score_threshold: f64,
}

/// Query the backend for one entity and extract the requested metrics.
///
/// - Entity not indexed: `Failure{NotFound}`, immediately.
/// - `deadline` exceeded (query or extraction): `Failure{Timeout}`.
/// - Metrics the extractor cannot produce are omitted, never failures;
///   partial metric coverage is the aggregator's concern.
pub async fn retrieve(
    backend: &dyn RetrievalBackend,
    entity: &EntityId,
    metrics: &[MetricKind],
    sections: &[SectionKind],
    time_scope: TimeScope,
    deadline: Instant,
    opts: RetrievalOptions,
) -> EntityResult {
    let query = backend.query(entity, sections, time_scope, opts.top_k);
    let passages = match tokio::time::timeout_at(deadline, query).await {
        Ok(Ok(passages)) => passages,
        Ok(Err(RetrievalError::EntityNotFound(_))) => {
            tracing::info!(entity = %entity, "entity has no indexed documents");
            return failure(FailureKind::NotFound, "entity has no indexed filings");
        }
        Ok(Err(RetrievalError::Unavailable(detail))) => {
            tracing::warn!(entity = %entity, error = %detail, "retrieval backend unavailable");
            return failure(FailureKind::Backend, &detail);
        }
        Err(_) => {
            tracing::warn!(entity = %entity, "retrieval query exceeded deadline");
            return failure(FailureKind::Timeout, "retrieval query exceeded deadline");
        }
    };

    let passages = filter_passages(passages, opts);
    tracing::debug!(entity = %entity, kept = passages.len(), "passages after threshold/dedup");

    if passages.is_empty() {
        // Indexed but nothing relevant: a success with no data, not a
        // failure. The aggregator reports the metric gaps.
        return EntityResult::Success {
            metrics: Default::default(),
            passages,
        };
    }

    let extraction = backend.extract_metrics(entity, &passages, metrics);
    let extracted = match tokio::time::timeout_at(deadline, extraction).await {
        Ok(Ok(map)) => map,
        Ok(Err(RetrievalError::EntityNotFound(_))) => {
            return failure(FailureKind::NotFound, "entity has no indexed filings");
        }
        Ok(Err(RetrievalError::Unavailable(detail))) => {
            tracing::warn!(entity = %entity, error = %detail, "metric extraction failed");
            return failure(FailureKind::Backend, &detail);
        }
        Err(_) => {
            tracing::warn!(entity = %entity, "metric extraction exceeded deadline");
            return failure(FailureKind::Timeout, "metric extraction exceeded deadline");
        }
    };

    // Drop anything the extractor returned for metrics we never asked for.
    let requested: BTreeSet<MetricKind> = metrics.iter().copied().collect();
    let extracted = extracted
        .into_iter()
        .filter(|(kind, _)| requested.contains(kind))
        .collect();

    EntityResult::Success {
        metrics: extracted,
        passages,
    }
}

/// Threshold filter, dedup by source, cap at top-k. Order (descending
/// relevance from the backend) is preserved.
fn filter_passages(passages: Vec<RetrievedPassage>, opts: RetrievalOptions) -> Vec<RetrievedPassage> {
    let mut seen = BTreeSet::new();
    passages
        .into_iter()
        .filter(|p| p.relevance_score >= opts.score_threshold)
        .filter(|p| seen.insert(p.source.clone()))
        .take(opts.top_k)
        .collect()
}

fn failure(kind: FailureKind, detail: &str) -> EntityResult {
    EntityResult::Failure(EntityFailure {
        kind,
        detail: detail.to_string(),
        attempts: 1,
    })
}
