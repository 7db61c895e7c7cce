//! Pipeline error taxonomy.
//!
//! Per-entity failures never surface here; they are folded into
//! `missing_entities` on the result. Only request validation, a
//! zero-success quorum, synthesis failure, and caller cancellation
//! prevent a usable `SynthesisResult`.

use shared_types::{AggregatedComparison, MissingEntity, RequestError};

/// Fatal error from the narrative synthesis step.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SynthesisError {
    /// The narrative backend call failed. Not retried: generation is
    /// costly and non-deterministic.
    #[error("narrative generation failed: {0}")]
    Generation(String),
    /// The generated narrative cited a passage that was never supplied
    /// in context. Hard validation failure, never silently dropped.
    #[error("unbound citation marker {marker} (context has {supplied} passages)")]
    UnboundCitation { marker: String, supplied: usize },
}

/// Terminal pipeline failure returned to the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// Request validation lives in `ComparisonRequest::new`, so the
    /// engine itself never constructs this; the conversion lets a
    /// caller funnel validation failures into one error type.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    /// Zero entities produced data; synthesis was skipped.
    #[error("insufficient data: no entity retrieval succeeded ({})", describe_failures(.failures))]
    InsufficientData { failures: Vec<MissingEntity> },

    /// Synthesis failed after aggregation succeeded. The aggregated
    /// comparison is carried so the caller still gets the merged data.
    #[error("synthesis failed: {error}")]
    Synthesis {
        error: SynthesisError,
        fallback: Box<AggregatedComparison>,
    },

    /// Caller-initiated cancellation. Distinct from `Failed`; no
    /// partial result is produced.
    #[error("comparison cancelled by caller")]
    Cancelled,
}

fn describe_failures(failures: &[MissingEntity]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.entity, f.detail))
        .collect::<Vec<_>>()
        .join("; ")
}
