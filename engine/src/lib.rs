//! Comparative filing analysis engine.
//!
//! Orchestrates concurrent per-entity retrieval, deterministic
//! aggregation, and citation-bound narrative synthesis behind a
//! single coordinator. External systems plug in through two seams:
//! [`backend::RetrievalBackend`] (vector search + metric extraction)
//! and [`backend::NarrativeBackend`] (text generation).

pub mod actors;
pub mod aggregate;
pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod retrieval;
pub mod synthesis;

pub use backend::{GenerationError, NarrativeBackend, RetrievalBackend, RetrievalError};
pub use cache::ComparisonCache;
pub use config::EngineConfig;
pub use error::{PipelineError, SynthesisError};
pub use pipeline::ComparisonEngine;
