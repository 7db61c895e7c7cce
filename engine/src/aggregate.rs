//! Aggregator: merges per-entity results into one normalized
//! comparison structure.
//!
//! Pure and deterministic: no I/O, no clocks, BTree iteration order
//! throughout, so aggregating the same inputs twice yields identical
//! output. A successful entity's data is never discarded because a
//! sibling failed.

use std::collections::{BTreeMap, BTreeSet};

use shared_types::{
    AggregatedComparison, ComparisonRequest, EntityFailure, EntityId, EntityResult,
    ExtractedMetric, FailureKind, MetricKind, MetricValue, MissingEntity, Unit,
};

/// Merge worker results into an `AggregatedComparison`.
///
/// `results` holds one entry per requested entity; canonical output
/// order is re-established from `request.entities` regardless of task
/// completion order.
pub fn aggregate(
    request: &ComparisonRequest,
    mut results: BTreeMap<EntityId, EntityResult>,
) -> AggregatedComparison {
    let mut per_entity: Vec<(EntityId, EntityResult)> = Vec::with_capacity(request.entities().len());
    for entity in request.entities() {
        let result = results.remove(entity).unwrap_or_else(|| {
            EntityResult::Failure(EntityFailure {
                kind: FailureKind::Backend,
                detail: "no result recorded for entity".to_string(),
                attempts: 0,
            })
        });
        per_entity.push((entity.clone(), result));
    }

    let missing_entities: Vec<MissingEntity> = per_entity
        .iter()
        .filter_map(|(entity, result)| match result {
            EntityResult::Failure(failure) => Some(MissingEntity {
                entity: entity.clone(),
                kind: failure.kind,
                detail: failure.detail.clone(),
            }),
            EntityResult::Success { .. } => None,
        })
        .collect();

    let successes: Vec<(&EntityId, &BTreeMap<MetricKind, ExtractedMetric>)> = per_entity
        .iter()
        .filter_map(|(entity, result)| result.metrics().map(|metrics| (entity, metrics)))
        .collect();

    // Intersection / union of metric keys over successful entities,
    // restricted to what the request asked for.
    let mut union: BTreeSet<MetricKind> = BTreeSet::new();
    let mut intersection: BTreeSet<MetricKind> = request.metrics().clone();
    for (_, metrics) in &successes {
        let keys: BTreeSet<MetricKind> = metrics.keys().copied().collect();
        union.extend(keys.iter().copied());
        intersection = intersection.intersection(&keys).copied().collect();
    }
    union = union.intersection(request.metrics()).copied().collect();
    if successes.is_empty() {
        intersection.clear();
    }

    let mut comparable = intersection;
    let mut partial: BTreeSet<MetricKind> =
        union.difference(&comparable).copied().collect();
    let mut notes: Vec<String> = Vec::new();

    // Unit normalization for comparable metrics with a declared
    // canonical unit; a metric that cannot be normalized for every
    // entity is demoted to partial with a note, never silently compared.
    let mut normalized: BTreeMap<(EntityId, MetricKind), ExtractedMetric> = BTreeMap::new();
    let mut demoted: BTreeSet<MetricKind> = BTreeSet::new();
    for kind in &comparable {
        let Some(canonical) = kind.canonical_unit() else {
            continue;
        };
        let mut candidates: Vec<(EntityId, ExtractedMetric)> = Vec::new();
        let mut demotion_note: Option<String> = None;
        for (entity, metrics) in &successes {
            let metric = &metrics[kind];
            match normalize(metric, canonical) {
                Some(converted) => candidates.push(((*entity).clone(), converted)),
                None => {
                    demotion_note = Some(format!(
                        "{kind} demoted from comparable: {entity} reported {} {}, not normalizable to {canonical}",
                        metric.value, metric.unit,
                    ));
                    break;
                }
            }
        }
        match demotion_note {
            Some(note) => {
                notes.push(note);
                demoted.insert(*kind);
            }
            None => {
                for (entity, metric) in candidates {
                    normalized.insert((entity, *kind), metric);
                }
            }
        }
    }

    // Reporting-period skew: known periods that disagree across
    // entities demote the metric rather than guessing an alignment.
    for kind in &comparable {
        if demoted.contains(kind) {
            continue;
        }
        let periods: BTreeSet<&str> = successes
            .iter()
            .filter_map(|(_, metrics)| metrics[kind].period.as_deref())
            .collect();
        if periods.len() > 1 {
            let listed = periods.into_iter().collect::<Vec<_>>().join(" vs ");
            notes.push(format!(
                "{kind} demoted from comparable: reporting periods differ ({listed})"
            ));
            demoted.insert(*kind);
        }
    }

    for kind in &demoted {
        comparable.remove(kind);
        partial.insert(*kind);
    }

    // Apply normalized values for metrics that stayed comparable;
    // demoted metrics keep their as-reported values.
    let per_entity = per_entity
        .into_iter()
        .map(|(entity, result)| {
            let result = match result {
                EntityResult::Success { metrics, passages } => {
                    let metrics = metrics
                        .into_iter()
                        .map(|(kind, metric)| {
                            let metric = if comparable.contains(&kind) {
                                normalized
                                    .remove(&(entity.clone(), kind))
                                    .unwrap_or(metric)
                            } else {
                                metric
                            };
                            (kind, metric)
                        })
                        .collect();
                    EntityResult::Success { metrics, passages }
                }
                failure => failure,
            };
            (entity, result)
        })
        .collect();

    AggregatedComparison {
        per_entity,
        missing_entities,
        comparable_metrics: comparable,
        partial_metrics: partial,
        notes,
    }
}

/// Convert a metric to the canonical unit. `None` when the value kind
/// or unit cannot be reconciled.
fn normalize(metric: &ExtractedMetric, canonical: Unit) -> Option<ExtractedMetric> {
    match (&metric.value, canonical) {
        (MetricValue::Categorical(_), Unit::Text) => Some(metric.clone()),
        (MetricValue::Categorical(_), _) => None,
        (MetricValue::Numeric(value), _) => {
            let factor = metric.unit.conversion_to(canonical)?;
            Some(ExtractedMetric {
                kind: metric.kind,
                value: MetricValue::Numeric(value * factor),
                unit: canonical,
                origin: metric.origin.clone(),
                period: metric.period.clone(),
            })
        }
    }
}
