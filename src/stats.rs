//! Processing statistics over persisted records.
//!
//! The confidence threshold trades cost against accuracy, and these figures
//! show where that trade currently lands. Escalation is broken down per
//! document type, first-stage confidences are counted on either side of the
//! threshold, and costs are totalled overall and per day.
//!
//! A threshold sweep replays the recorded first-stage confidences against
//! other thresholds and projects the escalation rate and per-document cost
//! each would have produced, using the configured price table.
//!
//! [`summarize`] is a pure function of the records; `tdv stats` feeds it from
//! [`RecordStore::records_since`](crate::storage::RecordStore::records_since).

use crate::config::{ModelTier, PipelineConfig};
use crate::types::ProcessingRecord;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Width of the band either side of the threshold counted as "near" it.
pub const BOUNDARY_BAND: f64 = 0.05;

/// Thresholds replayed by the sweep.
pub const SWEEP_THRESHOLDS: [f64; 8] = [0.60, 0.65, 0.70, 0.75, 0.80, 0.85, 0.90, 0.95];

/// Everything `tdv stats` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingStats {
    pub since: DateTime<Utc>,
    pub documents: usize,
    /// Record count per terminal state.
    pub by_state: BTreeMap<String, usize>,
    pub escalation: EscalationStats,
    pub boundary: ThresholdBoundary,
    pub costs: CostStats,
    pub threshold_sweep: Vec<ThresholdProjection>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationStats {
    /// Records that reached classification.
    pub classified: usize,
    pub escalated: usize,
    pub escalation_rate: f64,
    pub by_type: BTreeMap<String, TypeStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeStats {
    pub documents: usize,
    pub escalated: usize,
    pub escalation_rate: f64,
    pub total_cost: BigDecimal,
}

/// First-stage confidences within [`BOUNDARY_BAND`] of the threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdBoundary {
    pub threshold: f64,
    pub band: f64,
    pub just_below: usize,
    pub just_above: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostStats {
    pub total: BigDecimal,
    pub classification: BigDecimal,
    pub extraction: BigDecimal,
    pub average_per_document: BigDecimal,
    /// Keyed by completion date, `YYYY-MM-DD`.
    pub by_day: BTreeMap<String, DayCost>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayCost {
    pub documents: usize,
    pub cost: BigDecimal,
}

/// What one threshold would have produced on the same documents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdProjection {
    pub threshold: f64,
    pub escalation_rate: f64,
    pub projected_cost_per_document: BigDecimal,
}

fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 10_000.0).round() / 10_000.0
}

fn mean(total: &BigDecimal, count: usize) -> BigDecimal {
    if count == 0 {
        return BigDecimal::from(0);
    }
    (total.clone() / BigDecimal::from(count as u64)).round(6)
}

/// Summarise records completed since `since` against the current config.
pub fn summarize(
    records: &[ProcessingRecord],
    config: &PipelineConfig,
    since: DateTime<Utc>,
) -> ProcessingStats {
    let zero = BigDecimal::from(0);
    let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_type: BTreeMap<String, TypeStats> = BTreeMap::new();
    let mut by_day: BTreeMap<String, DayCost> = BTreeMap::new();
    let (mut classified, mut escalated) = (0, 0);
    let mut classification_cost = zero.clone();
    let mut total = zero.clone();

    for record in records {
        *by_state.entry(record.state.as_str().to_string()).or_default() += 1;
        total += &record.costs.total;
        classification_cost += &record.costs.classification;

        let day = by_day
            .entry(record.completed_at.format("%Y-%m-%d").to_string())
            .or_insert_with(|| DayCost {
                documents: 0,
                cost: zero.clone(),
            });
        day.documents += 1;
        day.cost += &record.costs.total;

        let Some(classification) = &record.classification else {
            continue;
        };
        classified += 1;
        escalated += usize::from(record.escalated);
        let entry = by_type
            .entry(classification.document_type.as_str().to_string())
            .or_insert_with(|| TypeStats {
                documents: 0,
                escalated: 0,
                escalation_rate: 0.0,
                total_cost: zero.clone(),
            });
        entry.documents += 1;
        entry.escalated += usize::from(record.escalated);
        entry.total_cost += &record.costs.total;
    }
    for stats in by_type.values_mut() {
        stats.escalation_rate = rate(stats.escalated, stats.documents);
    }

    let confidences: Vec<f64> = records
        .iter()
        .filter_map(|r| r.first_stage_confidence)
        .collect();
    let threshold = config.confidence_threshold;
    let boundary = ThresholdBoundary {
        threshold,
        band: BOUNDARY_BAND,
        just_below: confidences
            .iter()
            .filter(|c| **c >= threshold - BOUNDARY_BAND && **c < threshold)
            .count(),
        just_above: confidences
            .iter()
            .filter(|c| **c >= threshold && **c <= threshold + BOUNDARY_BAND)
            .count(),
    };

    let extraction = &total - &classification_cost;
    ProcessingStats {
        since,
        documents: records.len(),
        by_state,
        escalation: EscalationStats {
            classified,
            escalated,
            escalation_rate: rate(escalated, classified),
            by_type,
        },
        boundary,
        costs: CostStats {
            average_per_document: mean(&total, records.len()),
            total,
            classification: classification_cost,
            extraction,
            by_day,
        },
        threshold_sweep: SWEEP_THRESHOLDS
            .iter()
            .map(|t| project(&confidences, *t, config))
            .collect(),
    }
}

/// Replay first-stage confidences at `threshold`, assuming one extraction
/// call per accepted document.
fn project(confidences: &[f64], threshold: f64, config: &PipelineConfig) -> ThresholdProjection {
    let cheap = config.price_table.price(ModelTier::Cheap);
    let capable = config.price_table.price(ModelTier::Capable);
    let mut cost = BigDecimal::from(0);
    let mut escalations = 0;
    for &c in confidences {
        cost += cheap;
        if c < config.reject_floor {
            continue;
        }
        if c < threshold {
            escalations += 1;
            cost += capable;
            cost += capable;
        } else {
            cost += cheap;
        }
    }
    ThresholdProjection {
        threshold,
        escalation_rate: rate(escalations, confidences.len()),
        projected_cost_per_document: mean(&cost, confidences.len()),
    }
}
