//! External backend seams.
//!
//! The engine never talks to a vector index or an LLM directly; it
//! calls these traits. Implementations live with the caller (or in
//! tests as scripted mocks). Entity-not-found must be signalled
//! distinctly from transient failure so the coordinator can apply the
//! right retry policy.

use std::collections::BTreeMap;

use async_trait::async_trait;

use shared_types::{
    EntityId, ExtractedMetric, MetricKind, RetrievedPassage, SectionKind, TimeScope,
};

/// Retrieval backend error. `EntityNotFound` is terminal for the
/// entity; `Unavailable` is transient from the backend's point of view
/// but is not retried by the engine (only timeouts are).
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RetrievalError {
    #[error("entity not indexed: {0}")]
    EntityNotFound(EntityId),
    #[error("retrieval backend unavailable: {0}")]
    Unavailable(String),
}

/// Narrative backend error.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("narrative backend error: {0}")]
pub struct GenerationError(pub String);

/// Semantic retrieval plus structured extraction over one entity's
/// documents.
#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    /// Top-k passages for the entity, scoped to the given sections and
    /// time scope, sorted by descending relevance.
    async fn query(
        &self,
        entity: &EntityId,
        sections: &[SectionKind],
        time_scope: TimeScope,
        top_k: usize,
    ) -> Result<Vec<RetrievedPassage>, RetrievalError>;

    /// Pull the requested metrics out of passage text. Metrics the
    /// extractor cannot confidently produce are simply absent from the
    /// returned map.
    async fn extract_metrics(
        &self,
        entity: &EntityId,
        passages: &[RetrievedPassage],
        kinds: &[MetricKind],
    ) -> Result<BTreeMap<MetricKind, ExtractedMetric>, RetrievalError>;
}

/// Context payload handed to the narrative backend: everything the
/// generator may cite, with stable document numbering.
#[derive(Debug, Clone, PartialEq)]
pub struct NarrativeContext {
    /// Rendered prompt context: per-entity `[Document N]` blocks plus
    /// metric summaries. Document numbers are the only valid citation
    /// markers.
    pub rendered: String,
    /// Number of documents supplied; markers must fall in `1..=count`.
    pub document_count: usize,
}

/// Narrative generation. May be slow, occasionally malformed, and
/// non-deterministic; invoked exactly once per synthesis attempt.
#[async_trait]
pub trait NarrativeBackend: Send + Sync {
    /// Returns narrative prose with embedded `[n]` citation markers
    /// referencing document numbers from the context.
    async fn generate(&self, context: &NarrativeContext) -> Result<String, GenerationError>;
}
