//! Synthesizer: turns an `AggregatedComparison` into a citation-bound
//! narrative plus a side-by-side table.
//!
//! The narrative backend is invoked exactly once per call. Generated
//! citation markers are document numbers from the supplied context;
//! this module validates every marker against what was actually
//! supplied (an unresolvable marker is a hard failure) and renumbers
//! them into deduplicated first-use ordinals.

use std::collections::BTreeMap;

use regex::Regex;

use shared_types::{
    AggregatedComparison, CitationRecord, ComparisonRequest, ComparisonTable, ComparisonVerdict,
    Confidence, EntityId, MetricKind, MetricValue, SourceRef, TableCell, TableRow,
};

use crate::backend::{NarrativeBackend, NarrativeContext};
use crate::error::SynthesisError;

/// Synthesis output before the coordinator attaches status and timing.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutcome {
    pub narrative: String,
    pub table: ComparisonTable,
    pub citations: Vec<CitationRecord>,
    pub verdict: Option<ComparisonVerdict>,
    pub confidence: Confidence,
}

/// One context document slot; slot `i` is cited as `[i + 1]`.
#[derive(Debug, Clone, PartialEq)]
struct ContextSlot {
    entity: EntityId,
    source: SourceRef,
}

/// Generate and validate the narrative for one aggregated comparison.
pub async fn synthesize(
    backend: &dyn NarrativeBackend,
    request: &ComparisonRequest,
    comparison: &AggregatedComparison,
) -> Result<SynthesisOutcome, SynthesisError> {
    let (context, slots) = build_context(request, comparison);
    tracing::debug!(
        documents = context.document_count,
        comparable = comparison.comparable_metrics.len(),
        partial = comparison.partial_metrics.len(),
        "invoking narrative backend"
    );

    // Single call; failure here is fatal to synthesis and never retried.
    let raw = backend
        .generate(&context)
        .await
        .map_err(|e| SynthesisError::Generation(e.to_string()))?;

    let (mut narrative, citations) = bind_citations(&raw, &slots)?;

    if !comparison.missing_entities.is_empty() {
        narrative.push_str("\n\n");
        narrative.push_str(&missing_note(comparison));
    }

    let table = build_table(comparison);
    let verdict = build_verdict(comparison);
    let confidence = assess_confidence(comparison);

    Ok(SynthesisOutcome {
        narrative,
        table,
        citations,
        verdict,
        confidence,
    })
}

/// Render the context payload: per-entity numbered document blocks,
/// then comparable metrics (primary) and partial metrics (secondary,
/// caveated). Document numbering is global across entities.
fn build_context(
    request: &ComparisonRequest,
    comparison: &AggregatedComparison,
) -> (NarrativeContext, Vec<ContextSlot>) {
    let mut slots: Vec<ContextSlot> = Vec::new();
    let mut parts: Vec<String> = vec!["Context from company filings:".to_string()];

    for (entity, result) in &comparison.per_entity {
        let passages = result.passages();
        if passages.is_empty() {
            continue;
        }
        parts.push(format!("{}\nContext for {entity}:\n{}", "=".repeat(80), "=".repeat(80)));
        for passage in passages {
            slots.push(ContextSlot {
                entity: entity.clone(),
                source: passage.source.clone(),
            });
            parts.push(format!(
                "[Document {n}]\nCompany: {entity}\nSection: {section}\nRelevance Score: {score:.2}\n\n{text}",
                n = slots.len(),
                section = passage.source.section,
                score = passage.relevance_score,
                text = passage.text,
            ));
        }
    }

    if !comparison.comparable_metrics.is_empty() {
        parts.push("Directly comparable metrics (present for every company):".to_string());
        for kind in &comparison.comparable_metrics {
            parts.push(metric_line(comparison, *kind));
        }
    }
    if !comparison.partial_metrics.is_empty() {
        parts.push(
            "Partially available metrics (NOT present for every company; any comparison must carry an explicit caveat):"
                .to_string(),
        );
        for kind in &comparison.partial_metrics {
            parts.push(metric_line(comparison, *kind));
        }
    }
    for note in &comparison.notes {
        parts.push(format!("Data note: {note}"));
    }
    parts.push(
        "Cite every figure or company-specific claim with the bracketed document number, e.g. [2]."
            .to_string(),
    );

    let rendered = parts.join("\n\n");
    let document_count = slots.len();
    (
        NarrativeContext {
            rendered,
            document_count,
        },
        slots,
    )
}

fn metric_line(comparison: &AggregatedComparison, kind: MetricKind) -> String {
    let mut values: Vec<String> = Vec::new();
    for (entity, result) in &comparison.per_entity {
        let Some(metrics) = result.metrics() else {
            continue;
        };
        match metrics.get(&kind) {
            Some(metric) => {
                let period = metric
                    .period
                    .as_deref()
                    .map(|p| format!(" ({p})"))
                    .unwrap_or_default();
                values.push(format!("{entity} {} {}{period}", metric.value, metric.unit));
            }
            None => values.push(format!("{entity} not available")),
        }
    }
    format!("- {kind}: {}", values.join("; "))
}

/// Validate every `[n]` marker against the supplied slots and rewrite
/// markers into 1-based first-use ordinals, deduplicated by source.
fn bind_citations(
    raw: &str,
    slots: &[ContextSlot],
) -> Result<(String, Vec<CitationRecord>), SynthesisError> {
    // Markers are small bracketed integers as instructed in the context.
    let marker = Regex::new(r"\[(\d+)\]").expect("static regex");

    let mut ordinal_by_source: BTreeMap<SourceRef, u32> = BTreeMap::new();
    let mut citations: Vec<CitationRecord> = Vec::new();

    for caps in marker.captures_iter(raw) {
        let text = &caps[0];
        let number: usize = caps[1]
            .parse()
            .map_err(|_| SynthesisError::UnboundCitation {
                marker: text.to_string(),
                supplied: slots.len(),
            })?;
        let slot = number
            .checked_sub(1)
            .and_then(|idx| slots.get(idx))
            .ok_or_else(|| SynthesisError::UnboundCitation {
                marker: text.to_string(),
                supplied: slots.len(),
            })?;
        if !ordinal_by_source.contains_key(&slot.source) {
            let ordinal = citations.len() as u32 + 1;
            ordinal_by_source.insert(slot.source.clone(), ordinal);
            citations.push(CitationRecord {
                ordinal,
                entity: slot.entity.clone(),
                source: slot.source.clone(),
            });
        }
    }

    let rewritten = marker.replace_all(raw, |caps: &regex::Captures<'_>| {
        // Validated above; every marker resolves.
        let number: usize = caps[1].parse().unwrap_or(0);
        match number.checked_sub(1).and_then(|idx| slots.get(idx)) {
            Some(slot) => format!("[{}]", ordinal_by_source[&slot.source]),
            None => caps[0].to_string(),
        }
    });

    Ok((rewritten.into_owned(), citations))
}

/// Deterministic appendix naming each absent entity and why. Required,
/// checkable output, independent of what the generator produced.
fn missing_note(comparison: &AggregatedComparison) -> String {
    let mut lines: Vec<String> = Vec::new();
    for missing in &comparison.missing_entities {
        lines.push(format!(
            "Note: {} is not included in this comparison ({}).",
            missing.entity, missing.detail
        ));
    }
    lines.join("\n")
}

/// Table over comparable ∪ partial metrics, comparable columns first.
/// Rows cover successful entities in canonical order; a metric absent
/// for an entity renders as an explicit not-available cell.
fn build_table(comparison: &AggregatedComparison) -> ComparisonTable {
    let metrics: Vec<MetricKind> = comparison
        .comparable_metrics
        .iter()
        .chain(comparison.partial_metrics.iter())
        .copied()
        .collect();

    let rows = comparison
        .per_entity
        .iter()
        .filter_map(|(entity, result)| {
            let entity_metrics = result.metrics()?;
            let cells = metrics
                .iter()
                .map(|kind| match entity_metrics.get(kind) {
                    Some(metric) => TableCell::Value(format!("{} {}", metric.value, metric.unit)),
                    None => TableCell::NotAvailable,
                })
                .collect();
            Some(TableRow {
                entity: entity.clone(),
                cells,
            })
        })
        .collect();

    ComparisonTable { metrics, rows }
}

/// Head-to-head verdict on the first comparable numeric metric.
/// Absent unless at least two entities succeeded (a company is not
/// compared against itself).
fn build_verdict(comparison: &AggregatedComparison) -> Option<ComparisonVerdict> {
    if comparison.successful_entities().count() < 2 {
        return None;
    }
    for kind in &comparison.comparable_metrics {
        let mut best: Option<(&EntityId, f64)> = None;
        let mut all_numeric = true;
        for (entity, result) in &comparison.per_entity {
            let Some(metrics) = result.metrics() else {
                continue;
            };
            match metrics.get(kind).map(|m| &m.value) {
                Some(MetricValue::Numeric(value)) => {
                    let improves = match best {
                        None => true,
                        Some((_, top)) => *value > top,
                    };
                    if improves {
                        best = Some((entity, *value));
                    }
                }
                _ => {
                    all_numeric = false;
                    break;
                }
            }
        }
        if let (true, Some((winner, _))) = (all_numeric, best) {
            return Some(ComparisonVerdict {
                summary: format!("{winner} leads on {kind} among the compared companies."),
                winner: Some(winner.clone()),
                metric: Some(*kind),
            });
        }
    }
    None
}

fn assess_confidence(comparison: &AggregatedComparison) -> Confidence {
    let degraded_coverage =
        !comparison.partial_metrics.is_empty() || !comparison.notes.is_empty();
    match (comparison.missing_entities.is_empty(), degraded_coverage) {
        (true, false) => Confidence::High,
        (false, true) => Confidence::Low,
        _ => Confidence::Medium,
    }
}
