//! Data model shared between the comparison engine and its callers
//!
//! These types cross the engine boundary in both directions:
//! - inbound: a validated `ComparisonRequest`
//! - outbound: `AggregatedComparison` and `SynthesisResult`
//!
//! Serializable with serde for JSON over whatever transport the caller
//! layers on top. Collections use BTree containers so serialized output
//! and repeated merges are byte-for-byte deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier for a comparison subject (a company ticker, e.g. "AAPL").
///
/// Normalized to uppercase on construction so request signatures and
/// per-entity maps never split on case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// A named quantity or category being compared across entities.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MetricKind {
    Revenue,
    RevenueGrowth,
    NetIncome,
    GrossMargin,
    OperatingMargin,
    Eps,
    Headcount,
    CeoName,
}

impl MetricKind {
    /// The unit every entity's value is normalized to before a direct
    /// side-by-side comparison. `None` means the metric has no declared
    /// canonical unit and is compared as reported.
    pub fn canonical_unit(&self) -> Option<Unit> {
        match self {
            MetricKind::Revenue | MetricKind::NetIncome | MetricKind::Eps => Some(Unit::Usd),
            MetricKind::RevenueGrowth | MetricKind::GrossMargin | MetricKind::OperatingMargin => {
                Some(Unit::Percent)
            }
            MetricKind::Headcount => Some(Unit::Count),
            MetricKind::CeoName => None,
        }
    }
}

/// Unit attached to an extracted metric value.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Unit {
    Usd,
    UsdThousands,
    UsdMillions,
    UsdBillions,
    Percent,
    Ratio,
    Count,
    Text,
}

impl Unit {
    /// Scale factor that converts a value in `self` into `target`.
    /// `None` when the units are dimensionally incompatible.
    pub fn conversion_to(&self, target: Unit) -> Option<f64> {
        if *self == target {
            return Some(1.0);
        }
        let usd_factor = |unit: Unit| match unit {
            Unit::Usd => Some(1.0),
            Unit::UsdThousands => Some(1e3),
            Unit::UsdMillions => Some(1e6),
            Unit::UsdBillions => Some(1e9),
            _ => None,
        };
        if let (Some(from), Some(to)) = (usd_factor(*self), usd_factor(target)) {
            return Some(from / to);
        }
        match (*self, target) {
            (Unit::Ratio, Unit::Percent) => Some(100.0),
            (Unit::Percent, Unit::Ratio) => Some(0.01),
            _ => None,
        }
    }
}

/// The value of a metric: numeric (with its unit carried alongside on
/// `ExtractedMetric`) or categorical (a name, a label).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum MetricValue {
    Numeric(f64),
    Categorical(String),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Numeric(n) => write!(f, "{n}"),
            MetricValue::Categorical(s) => f.write_str(s),
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// Which reporting window the comparison covers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeScope {
    /// Most recent filing available per entity.
    #[default]
    Latest,
    FiscalYear(i32),
}

impl fmt::Display for TimeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeScope::Latest => f.write_str("latest"),
            TimeScope::FiscalYear(year) => write!(f, "fy{year}"),
        }
    }
}

/// Filing section the retrieval backend should search.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SectionKind {
    BusinessOverview,
    RiskFactors,
    ManagementDiscussion,
    FinancialStatements,
}

/// Why a `ComparisonRequest` could not be constructed.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("too few entities: got {0}, need at least 2")]
    TooFewEntities(usize),
    #[error("too many entities: got {0}, at most 3 supported")]
    TooManyEntities(usize),
    #[error("duplicate entity: {0}")]
    DuplicateEntity(EntityId),
    #[error("request has no metrics to compare")]
    NoMetrics,
}

/// Immutable, validated comparison request.
///
/// Fields are private so the 2..=3 unique-entity invariant holds for
/// the whole lifetime of the value. Deserialization goes through the
/// same validation via `try_from`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawComparisonRequest", into = "RawComparisonRequest")]
pub struct ComparisonRequest {
    entities: Vec<EntityId>,
    metrics: BTreeSet<MetricKind>,
    time_scope: TimeScope,
    required_sections: BTreeSet<SectionKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawComparisonRequest {
    entities: Vec<EntityId>,
    metrics: BTreeSet<MetricKind>,
    time_scope: TimeScope,
    required_sections: BTreeSet<SectionKind>,
}

impl From<ComparisonRequest> for RawComparisonRequest {
    fn from(req: ComparisonRequest) -> Self {
        Self {
            entities: req.entities,
            metrics: req.metrics,
            time_scope: req.time_scope,
            required_sections: req.required_sections,
        }
    }
}

impl TryFrom<RawComparisonRequest> for ComparisonRequest {
    type Error = RequestError;

    fn try_from(raw: RawComparisonRequest) -> Result<Self, Self::Error> {
        ComparisonRequest::new(raw.entities, raw.metrics, raw.time_scope, raw.required_sections)
    }
}

impl ComparisonRequest {
    pub const MIN_ENTITIES: usize = 2;
    pub const MAX_ENTITIES: usize = 3;

    pub fn new(
        entities: impl IntoIterator<Item = EntityId>,
        metrics: impl IntoIterator<Item = MetricKind>,
        time_scope: TimeScope,
        required_sections: impl IntoIterator<Item = SectionKind>,
    ) -> Result<Self, RequestError> {
        let entities: Vec<EntityId> = entities.into_iter().collect();
        if entities.len() < Self::MIN_ENTITIES {
            return Err(RequestError::TooFewEntities(entities.len()));
        }
        if entities.len() > Self::MAX_ENTITIES {
            return Err(RequestError::TooManyEntities(entities.len()));
        }
        let mut seen = BTreeSet::new();
        for entity in &entities {
            if !seen.insert(entity.clone()) {
                return Err(RequestError::DuplicateEntity(entity.clone()));
            }
        }
        let metrics: BTreeSet<MetricKind> = metrics.into_iter().collect();
        if metrics.is_empty() {
            return Err(RequestError::NoMetrics);
        }
        Ok(Self {
            entities,
            metrics,
            time_scope,
            required_sections: required_sections.into_iter().collect(),
        })
    }

    /// Caller-supplied order; synthesis output follows it.
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    pub fn metrics(&self) -> &BTreeSet<MetricKind> {
        &self.metrics
    }

    pub fn time_scope(&self) -> TimeScope {
        self.time_scope
    }

    pub fn required_sections(&self) -> &BTreeSet<SectionKind> {
        &self.required_sections
    }
}

// ============================================================================
// Retrieval artifacts
// ============================================================================

/// Provenance of a retrieved passage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceRef {
    pub document_id: String,
    pub section: String,
    pub page: Option<u32>,
}

/// One unit of source text returned by the retrieval backend.
/// Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedPassage {
    pub text: String,
    pub source: SourceRef,
    /// Similarity score in `[0, 1]`.
    pub relevance_score: f64,
}

/// A metric value pulled out of passage text by the extraction backend.
///
/// `origin` points at one of the passages held by the owning
/// `EntityResult`; the passage itself is not duplicated here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedMetric {
    pub kind: MetricKind,
    pub value: MetricValue,
    pub unit: Unit,
    pub origin: SourceRef,
    /// Reporting period as stated in the filing (e.g. "FY2024"), when
    /// the extractor could determine it.
    pub period: Option<String>,
}

/// Why one entity's retrieval ended without data.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// The entity has no indexed documents. Never retried.
    NotFound,
    /// The backend call exceeded its deadline (possibly after retries).
    Timeout,
    /// The backend reported a non-timeout error.
    Backend,
}

/// Terminal failure record for one entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityFailure {
    pub kind: FailureKind,
    pub detail: String,
    /// Retrieval attempts made before giving up (1-based count).
    pub attempts: u32,
}

/// Outcome of one entity's retrieval task. Exactly one per entity per
/// completed task; a worker never partially returns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum EntityResult {
    Success {
        metrics: BTreeMap<MetricKind, ExtractedMetric>,
        passages: Vec<RetrievedPassage>,
    },
    Failure(EntityFailure),
}

impl EntityResult {
    pub fn is_success(&self) -> bool {
        matches!(self, EntityResult::Success { .. })
    }

    pub fn metrics(&self) -> Option<&BTreeMap<MetricKind, ExtractedMetric>> {
        match self {
            EntityResult::Success { metrics, .. } => Some(metrics),
            EntityResult::Failure(_) => None,
        }
    }

    pub fn passages(&self) -> &[RetrievedPassage] {
        match self {
            EntityResult::Success { passages, .. } => passages,
            EntityResult::Failure(_) => &[],
        }
    }
}

// ============================================================================
// Aggregation
// ============================================================================

/// An entity absent from the comparison, with the attributed reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MissingEntity {
    pub entity: EntityId,
    pub kind: FailureKind,
    pub detail: String,
}

/// Normalized merge of all entity results for one request.
/// Built once by the aggregator; immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedComparison {
    /// Entity results in the canonical order of `request.entities`,
    /// regardless of task completion order.
    pub per_entity: Vec<(EntityId, EntityResult)>,
    pub missing_entities: Vec<MissingEntity>,
    /// Metrics present (and unit-normalizable) for every successful entity.
    pub comparable_metrics: BTreeSet<MetricKind>,
    /// Metrics present for some entities, or demoted from comparable.
    pub partial_metrics: BTreeSet<MetricKind>,
    /// Human-readable inconsistency notes (unit mismatch, period skew).
    pub notes: Vec<String>,
}

impl AggregatedComparison {
    pub fn result_for(&self, entity: &EntityId) -> Option<&EntityResult> {
        self.per_entity
            .iter()
            .find(|(id, _)| id == entity)
            .map(|(_, result)| result)
    }

    pub fn successful_entities(&self) -> impl Iterator<Item = &EntityId> {
        self.per_entity
            .iter()
            .filter(|(_, result)| result.is_success())
            .map(|(id, _)| id)
    }
}

// ============================================================================
// Synthesis
// ============================================================================

/// One resolved citation. Ordinals are 1-based, assigned in first-use
/// order across the narrative, deduplicated by identical `source`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CitationRecord {
    pub ordinal: u32,
    pub entity: EntityId,
    pub source: SourceRef,
}

/// A table cell: either a rendered value or an explicit absence.
/// Never serialized as an empty string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "cell", content = "value")]
pub enum TableCell {
    Value(String),
    NotAvailable,
}

impl fmt::Display for TableCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableCell::Value(v) => f.write_str(v),
            TableCell::NotAvailable => f.write_str("not available"),
        }
    }
}

/// One row of the comparison table: an entity and its cells, one per
/// column in `ComparisonTable::metrics` order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableRow {
    pub entity: EntityId,
    pub cells: Vec<TableCell>,
}

/// Side-by-side table over comparable ∪ partial metrics. Rows cover
/// successful entities only; missing entities are reported separately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ComparisonTable {
    pub metrics: Vec<MetricKind>,
    pub rows: Vec<TableRow>,
}

/// Overall pipeline outcome attached to a `SynthesisResult`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ComparisonStatus {
    /// Every requested entity succeeded.
    Complete,
    /// Some, but not all, entities succeeded.
    Partial,
    /// Zero entities succeeded, or synthesis failed fatally. The
    /// engine reports those outcomes as a pipeline error rather than a
    /// result; this variant exists for callers that flatten the error
    /// into a result payload on the wire.
    Failed,
}

/// Synthesizer self-assessment of answer quality, driven by metric
/// coverage and missing entities.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Optional head-to-head verdict, present only when at least two
/// entities succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonVerdict {
    pub summary: String,
    pub winner: Option<EntityId>,
    pub metric: Option<MetricKind>,
}

/// Terminal artifact of one pipeline run, handed to the caller.
/// Self-contained: every citation resolves without re-querying.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SynthesisResult {
    pub narrative: String,
    pub table: ComparisonTable,
    pub citations: Vec<CitationRecord>,
    pub status: ComparisonStatus,
    pub missing_entities: Vec<MissingEntity>,
    pub verdict: Option<ComparisonVerdict>,
    pub confidence: Confidence,
    pub processing_time_ms: u64,
}

// ============================================================================
// Tests
// ============================================================================
