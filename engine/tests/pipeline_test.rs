//! End-to-end pipeline tests over scripted backends.
//!
//! No network, no real vector index, no real model: `ScriptedRetrieval`
//! plays back per-entity outcome queues (the last entry repeats) and
//! `ScriptedNarrative` returns a fixed reply. Timeouts are exercised
//! with genuinely slow scripts under a shrunk global deadline, so the
//! retry and deadline arithmetic runs for real.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use engine::backend::{
    GenerationError, NarrativeBackend, NarrativeContext, RetrievalBackend, RetrievalError,
};
use engine::{ComparisonEngine, EngineConfig, PipelineError, SynthesisError};
use shared_types::{
    ComparisonRequest, ComparisonStatus, EntityId, ExtractedMetric, FailureKind, MetricKind,
    MetricValue, RetrievedPassage, SectionKind, SourceRef, TimeScope, Unit,
};

// ─── Scripted backends ───────────────────────────────────────────────────────

#[derive(Clone)]
enum QueryScript {
    Passages(Vec<RetrievedPassage>),
    NotFound,
    Unavailable(String),
    /// Sleeps past any test deadline; the caller's timeout fires first.
    Hang,
}

struct ScriptedRetrieval {
    scripts: Mutex<HashMap<EntityId, VecDeque<QueryScript>>>,
    metrics: HashMap<EntityId, BTreeMap<MetricKind, ExtractedMetric>>,
    query_calls: Mutex<HashMap<EntityId, usize>>,
}

impl ScriptedRetrieval {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            metrics: HashMap::new(),
            query_calls: Mutex::new(HashMap::new()),
        }
    }

    fn script(mut self, entity: &str, outcomes: Vec<QueryScript>) -> Self {
        self.scripts
            .get_mut()
            .unwrap()
            .insert(EntityId::new(entity), outcomes.into());
        self
    }

    fn with_metrics(mut self, entity: &str, metrics: BTreeMap<MetricKind, ExtractedMetric>) -> Self {
        self.metrics.insert(EntityId::new(entity), metrics);
        self
    }

    fn calls(&self, entity: &str) -> usize {
        self.query_calls
            .lock()
            .unwrap()
            .get(&EntityId::new(entity))
            .copied()
            .unwrap_or(0)
    }

    fn next_script(&self, entity: &EntityId) -> QueryScript {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts
            .get_mut(entity)
            .unwrap_or_else(|| panic!("no script for {entity}"));
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        }
    }
}

#[async_trait]
impl RetrievalBackend for ScriptedRetrieval {
    async fn query(
        &self,
        entity: &EntityId,
        _sections: &[SectionKind],
        _time_scope: TimeScope,
        _top_k: usize,
    ) -> Result<Vec<RetrievedPassage>, RetrievalError> {
        *self
            .query_calls
            .lock()
            .unwrap()
            .entry(entity.clone())
            .or_insert(0) += 1;
        match self.next_script(entity) {
            QueryScript::Passages(passages) => Ok(passages),
            QueryScript::NotFound => Err(RetrievalError::EntityNotFound(entity.clone())),
            QueryScript::Unavailable(detail) => Err(RetrievalError::Unavailable(detail)),
            QueryScript::Hang => {
                tokio::time::sleep(Duration::from_secs(120)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn extract_metrics(
        &self,
        entity: &EntityId,
        _passages: &[RetrievedPassage],
        kinds: &[MetricKind],
    ) -> Result<BTreeMap<MetricKind, ExtractedMetric>, RetrievalError> {
        Ok(self
            .metrics
            .get(entity)
            .map(|metrics| {
                metrics
                    .iter()
                    .filter(|(kind, _)| kinds.contains(kind))
                    .map(|(kind, metric)| (*kind, metric.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

struct ScriptedNarrative {
    reply: String,
}

#[async_trait]
impl NarrativeBackend for ScriptedNarrative {
    async fn generate(&self, _context: &NarrativeContext) -> Result<String, GenerationError> {
        Ok(self.reply.clone())
    }
}

struct FailingNarrative;

#[async_trait]
impl NarrativeBackend for FailingNarrative {
    async fn generate(&self, _context: &NarrativeContext) -> Result<String, GenerationError> {
        Err(GenerationError("model overloaded".to_string()))
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn passage(document_id: &str, score: f64) -> RetrievedPassage {
    RetrievedPassage {
        text: format!("Excerpt from {document_id}."),
        source: SourceRef {
            document_id: document_id.to_string(),
            section: "financial_statements".to_string(),
            page: Some(12),
        },
        relevance_score: score,
    }
}

fn revenue(value_millions: f64, document_id: &str) -> ExtractedMetric {
    ExtractedMetric {
        kind: MetricKind::Revenue,
        value: MetricValue::Numeric(value_millions),
        unit: Unit::UsdMillions,
        origin: SourceRef {
            document_id: document_id.to_string(),
            section: "financial_statements".to_string(),
            page: Some(12),
        },
        period: Some("FY2025".to_string()),
    }
}

fn request(entities: &[&str]) -> ComparisonRequest {
    ComparisonRequest::new(
        entities.iter().map(EntityId::new),
        [MetricKind::Revenue],
        TimeScope::Latest,
        [SectionKind::FinancialStatements],
    )
    .expect("valid request")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shrunk budgets so timeout paths settle in milliseconds.
fn test_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        global_deadline: Duration::from_secs(3),
        retry_base_delay: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

fn two_entity_fixture(narrative: &str) -> (ComparisonEngine, Arc<ScriptedRetrieval>) {
    let retrieval = Arc::new(
        ScriptedRetrieval::new()
            .script("ALPHA", vec![QueryScript::Passages(vec![passage("alpha-10k", 0.9)])])
            .script("BETA", vec![QueryScript::Passages(vec![passage("beta-10k", 0.85)])])
            .with_metrics(
                "ALPHA",
                BTreeMap::from([(MetricKind::Revenue, revenue(500.0, "alpha-10k"))]),
            )
            .with_metrics(
                "BETA",
                BTreeMap::from([(MetricKind::Revenue, revenue(300.0, "beta-10k"))]),
            ),
    );
    let engine = ComparisonEngine::new(
        Arc::clone(&retrieval) as Arc<dyn RetrievalBackend>,
        Arc::new(ScriptedNarrative {
            reply: narrative.to_string(),
        }),
        test_config(),
    );
    (engine, retrieval)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

/// Both entities succeed: COMPLETE result with a table row per entity
/// and bound citations.
#[tokio::test]
async fn test_all_entities_succeed_complete() {
    let (engine, _) = two_entity_fixture("Alpha outgrew Beta [1] against Beta's filing [2].");
    let result = engine.run(&request(&["alpha", "beta"])).await.expect("pipeline ok");

    assert_eq!(result.status, ComparisonStatus::Complete);
    assert!(result.missing_entities.is_empty());
    assert_eq!(result.table.rows.len(), 2);
    assert_eq!(result.table.metrics, vec![MetricKind::Revenue]);
    assert_eq!(result.citations.len(), 2);
    assert_eq!(result.citations[0].ordinal, 1);
    assert_eq!(result.citations[0].source.document_id, "alpha-10k");
    // Winner on the only comparable numeric metric.
    let verdict = result.verdict.expect("verdict present");
    assert_eq!(verdict.winner, Some(EntityId::new("alpha")));
}

/// A repeated request is served from cache without touching backends.
#[tokio::test]
async fn test_cache_hit_skips_backends() {
    let (engine, retrieval) = two_entity_fixture("Comparable revenue disclosed [1] and [2].");
    let req = request(&["alpha", "beta"]);

    let first = engine.run(&req).await.expect("first run ok");
    assert_eq!(retrieval.calls("ALPHA"), 1);

    let second = engine.run(&req).await.expect("second run ok");
    assert_eq!(retrieval.calls("ALPHA"), 1, "cache hit must not re-query");
    assert_eq!(retrieval.calls("BETA"), 1);
    assert_eq!(second, first, "cached result replayed verbatim");
}

/// Partial results are cached under the shorter partial TTL, so a
/// comparison degraded by a missing entity is re-attempted once that
/// TTL lapses, while it still serves from cache inside it.
#[tokio::test]
async fn test_partial_result_expires_on_short_ttl() {
    let retrieval = Arc::new(
        ScriptedRetrieval::new()
            .script("ALPHA", vec![QueryScript::Passages(vec![passage("alpha-10k", 0.9)])])
            .script("BETA", vec![QueryScript::NotFound])
            .with_metrics(
                "ALPHA",
                BTreeMap::from([(MetricKind::Revenue, revenue(500.0, "alpha-10k"))]),
            ),
    );
    let config = EngineConfig {
        global_deadline: Duration::from_secs(3),
        retry_base_delay: Duration::from_millis(10),
        result_cache_ttl: Duration::from_secs(3600),
        partial_cache_ttl: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let engine = ComparisonEngine::new(
        Arc::clone(&retrieval) as Arc<dyn RetrievalBackend>,
        Arc::new(ScriptedNarrative {
            reply: "Only Alpha reported revenue [1].".to_string(),
        }),
        config,
    );
    let req = request(&["alpha", "beta"]);

    let first = engine.run(&req).await.expect("first run ok");
    assert_eq!(first.status, ComparisonStatus::Partial);
    assert_eq!(retrieval.calls("ALPHA"), 1);

    // Inside the partial TTL: served from cache.
    let _ = engine.run(&req).await.expect("cached run ok");
    assert_eq!(retrieval.calls("ALPHA"), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let third = engine.run(&req).await.expect("rerun ok");
    assert_eq!(third.status, ComparisonStatus::Partial);
    assert_eq!(retrieval.calls("ALPHA"), 2, "partial entry expired; run re-dispatched");
}

/// One entity unknown to the index: PARTIAL, with the absence noted in
/// the narrative and no retries spent on NotFound.
#[tokio::test]
async fn test_unknown_entity_yields_partial() {
    let retrieval = Arc::new(
        ScriptedRetrieval::new()
            .script("ALPHA", vec![QueryScript::Passages(vec![passage("alpha-10k", 0.9)])])
            .script("BETA", vec![QueryScript::Passages(vec![passage("beta-10k", 0.85)])])
            .script("GAMMA", vec![QueryScript::NotFound])
            .with_metrics(
                "ALPHA",
                BTreeMap::from([(MetricKind::Revenue, revenue(500.0, "alpha-10k"))]),
            )
            .with_metrics(
                "BETA",
                BTreeMap::from([(MetricKind::Revenue, revenue(300.0, "beta-10k"))]),
            ),
    );
    let engine = ComparisonEngine::new(
        Arc::clone(&retrieval) as Arc<dyn RetrievalBackend>,
        Arc::new(ScriptedNarrative {
            reply: "Alpha leads [1]; Beta follows [2].".to_string(),
        }),
        test_config(),
    );

    let result = engine
        .run(&request(&["alpha", "beta", "gamma"]))
        .await
        .expect("pipeline ok");

    assert_eq!(result.status, ComparisonStatus::Partial);
    assert_eq!(result.missing_entities.len(), 1);
    assert_eq!(result.missing_entities[0].entity, EntityId::new("gamma"));
    assert_eq!(result.missing_entities[0].kind, FailureKind::NotFound);
    assert!(
        result.narrative.contains("GAMMA is not included"),
        "absence must be stated: {}",
        result.narrative
    );
    // Table only carries entities with data.
    assert_eq!(result.table.rows.len(), 2);
    assert_eq!(retrieval.calls("GAMMA"), 1, "NotFound is never retried");
}

/// Two timeouts then a success: the retry loop recovers and the run
/// still completes.
#[tokio::test]
async fn test_timeout_retried_then_recovers() {
    let retrieval = Arc::new(
        ScriptedRetrieval::new()
            .script(
                "ALPHA",
                vec![
                    QueryScript::Hang,
                    QueryScript::Hang,
                    QueryScript::Passages(vec![passage("alpha-10k", 0.9)]),
                ],
            )
            .script("BETA", vec![QueryScript::Passages(vec![passage("beta-10k", 0.85)])])
            .with_metrics(
                "ALPHA",
                BTreeMap::from([(MetricKind::Revenue, revenue(500.0, "alpha-10k"))]),
            )
            .with_metrics(
                "BETA",
                BTreeMap::from([(MetricKind::Revenue, revenue(300.0, "beta-10k"))]),
            ),
    );
    let engine = ComparisonEngine::new(
        Arc::clone(&retrieval) as Arc<dyn RetrievalBackend>,
        Arc::new(ScriptedNarrative {
            reply: "Both filings disclose revenue [1][2].".to_string(),
        }),
        test_config(),
    );

    let result = engine.run(&request(&["alpha", "beta"])).await.expect("pipeline ok");
    assert_eq!(result.status, ComparisonStatus::Complete);
    assert_eq!(retrieval.calls("ALPHA"), 3, "two retries after timeouts");
    assert_eq!(retrieval.calls("BETA"), 1);
}

/// A persistently slow entity exhausts its attempt budget and the run
/// degrades to PARTIAL with a Timeout attribution.
#[tokio::test]
async fn test_timeout_exhausts_attempts_partial() {
    let retrieval = Arc::new(
        ScriptedRetrieval::new()
            .script("ALPHA", vec![QueryScript::Passages(vec![passage("alpha-10k", 0.9)])])
            .script("BETA", vec![QueryScript::Hang])
            .with_metrics(
                "ALPHA",
                BTreeMap::from([(MetricKind::Revenue, revenue(500.0, "alpha-10k"))]),
            ),
    );
    let engine = ComparisonEngine::new(
        Arc::clone(&retrieval) as Arc<dyn RetrievalBackend>,
        Arc::new(ScriptedNarrative {
            reply: "Only Alpha's filing answered [1].".to_string(),
        }),
        test_config(),
    );

    let result = engine.run(&request(&["alpha", "beta"])).await.expect("pipeline ok");
    assert_eq!(result.status, ComparisonStatus::Partial);
    assert_eq!(result.missing_entities.len(), 1);
    assert_eq!(result.missing_entities[0].kind, FailureKind::Timeout);
    assert!(retrieval.calls("BETA") <= 3, "attempt cap respected");
}

/// Backend errors are terminal immediately; no retry is attempted.
#[tokio::test]
async fn test_backend_error_not_retried() {
    let retrieval = Arc::new(
        ScriptedRetrieval::new()
            .script("ALPHA", vec![QueryScript::Passages(vec![passage("alpha-10k", 0.9)])])
            .script("BETA", vec![QueryScript::Unavailable("qdrant down".to_string())])
            .with_metrics(
                "ALPHA",
                BTreeMap::from([(MetricKind::Revenue, revenue(500.0, "alpha-10k"))]),
            ),
    );
    let engine = ComparisonEngine::new(
        Arc::clone(&retrieval) as Arc<dyn RetrievalBackend>,
        Arc::new(ScriptedNarrative {
            reply: "Alpha reported revenue [1].".to_string(),
        }),
        test_config(),
    );

    let result = engine.run(&request(&["alpha", "beta"])).await.expect("pipeline ok");
    assert_eq!(result.status, ComparisonStatus::Partial);
    assert_eq!(result.missing_entities[0].kind, FailureKind::Backend);
    assert_eq!(retrieval.calls("BETA"), 1);
}

/// Zero successes: no synthesis call, a typed failure naming every
/// entity and reason, and nothing cached.
#[tokio::test]
async fn test_zero_successes_insufficient_data() {
    let retrieval = Arc::new(
        ScriptedRetrieval::new()
            .script("ALPHA", vec![QueryScript::NotFound])
            .script("BETA", vec![QueryScript::Unavailable("index offline".to_string())]),
    );
    let engine = ComparisonEngine::new(
        Arc::clone(&retrieval) as Arc<dyn RetrievalBackend>,
        Arc::new(FailingNarrative),
        test_config(),
    );
    let req = request(&["alpha", "beta"]);

    let err = engine.run(&req).await.expect_err("must fail");
    match err {
        PipelineError::InsufficientData { failures } => {
            assert_eq!(failures.len(), 2);
            assert_eq!(failures[0].entity, EntityId::new("alpha"));
            assert_eq!(failures[0].kind, FailureKind::NotFound);
            assert_eq!(failures[1].kind, FailureKind::Backend);
        }
        other => panic!("expected InsufficientData, got {other:?}"),
    }

    // Failures are never cached: a second run queries again.
    let _ = engine.run(&req).await;
    assert_eq!(retrieval.calls("ALPHA"), 2);
}

/// Cancellation mid-collection yields Cancelled, not a partial result,
/// and writes no cache entry.
#[tokio::test]
async fn test_cancellation_during_collection() {
    let retrieval = Arc::new(
        ScriptedRetrieval::new()
            .script("ALPHA", vec![QueryScript::Hang])
            .script("BETA", vec![QueryScript::Hang]),
    );
    let engine = Arc::new(ComparisonEngine::new(
        Arc::clone(&retrieval) as Arc<dyn RetrievalBackend>,
        Arc::new(FailingNarrative),
        test_config(),
    ));
    let req = request(&["alpha", "beta"]);
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let engine = Arc::clone(&engine);
        let req = req.clone();
        let cancel = cancel.clone();
        async move { engine.run_cancellable(&req, cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();

    let outcome = run.await.expect("join ok");
    assert!(matches!(outcome, Err(PipelineError::Cancelled)));
}

/// Narrative generation failure surfaces as a synthesis error that
/// still carries the merged comparison for the caller.
#[tokio::test]
async fn test_synthesis_failure_carries_fallback() {
    let retrieval = Arc::new(
        ScriptedRetrieval::new()
            .script("ALPHA", vec![QueryScript::Passages(vec![passage("alpha-10k", 0.9)])])
            .script("BETA", vec![QueryScript::Passages(vec![passage("beta-10k", 0.85)])])
            .with_metrics(
                "ALPHA",
                BTreeMap::from([(MetricKind::Revenue, revenue(500.0, "alpha-10k"))]),
            )
            .with_metrics(
                "BETA",
                BTreeMap::from([(MetricKind::Revenue, revenue(300.0, "beta-10k"))]),
            ),
    );
    let engine = ComparisonEngine::new(
        Arc::clone(&retrieval) as Arc<dyn RetrievalBackend>,
        Arc::new(FailingNarrative),
        test_config(),
    );

    let err = engine.run(&request(&["alpha", "beta"])).await.expect_err("must fail");
    match err {
        PipelineError::Synthesis { error, fallback } => {
            assert!(matches!(error, SynthesisError::Generation(_)));
            assert_eq!(fallback.successful_entities().count(), 2);
            assert!(fallback.comparable_metrics.contains(&MetricKind::Revenue));
        }
        other => panic!("expected Synthesis, got {other:?}"),
    }
}

/// A citation marker outside the supplied documents is a hard failure,
/// never silently dropped.
#[tokio::test]
async fn test_unbound_citation_fails_synthesis() {
    let (engine, _) = two_entity_fixture("A hallucinated source [9] backs this claim.");

    let err = engine.run(&request(&["alpha", "beta"])).await.expect_err("must fail");
    match err {
        PipelineError::Synthesis { error, .. } => match error {
            SynthesisError::UnboundCitation { marker, supplied } => {
                assert_eq!(marker, "[9]");
                assert_eq!(supplied, 2);
            }
            other => panic!("expected UnboundCitation, got {other:?}"),
        },
        other => panic!("expected Synthesis, got {other:?}"),
    }
}

/// The global deadline bounds the whole run even when every per-attempt
/// budget would otherwise be spent retrying.
#[tokio::test]
async fn test_global_deadline_bounds_run() {
    let retrieval = Arc::new(
        ScriptedRetrieval::new()
            .script("ALPHA", vec![QueryScript::Passages(vec![passage("alpha-10k", 0.9)])])
            .script("BETA", vec![QueryScript::Hang])
            .with_metrics(
                "ALPHA",
                BTreeMap::from([(MetricKind::Revenue, revenue(500.0, "alpha-10k"))]),
            ),
    );
    let config = EngineConfig {
        global_deadline: Duration::from_millis(200),
        retry_base_delay: Duration::from_millis(10),
        ..EngineConfig::default()
    };
    let engine = ComparisonEngine::new(
        Arc::clone(&retrieval) as Arc<dyn RetrievalBackend>,
        Arc::new(ScriptedNarrative {
            reply: "Alpha's filing answered in time [1].".to_string(),
        }),
        config,
    );

    let started = std::time::Instant::now();
    let result = engine.run(&request(&["alpha", "beta"])).await.expect("pipeline ok");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "run must settle near the global deadline"
    );
    assert_eq!(result.status, ComparisonStatus::Partial);
    assert_eq!(result.missing_entities[0].kind, FailureKind::Timeout);
}
