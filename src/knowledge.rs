//! Steps 3 and 5: entity-knowledge arithmetic
//!
//! Evidence-weighted confidence updates, monthly exponential time
//! decay, a flat penalty for patterns whose recent scores run cold,
//! and pruning below the confidence floor. All pure functions over
//! PatternStat / EntityKnowledgeRecord; the workflow owns persistence.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::types::{DecayDirective, EntityKnowledgeRecord, PatternStat};

/// No single observation may move confidence by more than half.
pub const MAX_UPDATE_WEIGHT: f64 = 0.5;

/// Patterns below this confidence are pruned.
pub const PRUNE_THRESHOLD: f64 = 0.20;

/// Monthly decay multiplier for stale patterns.
pub const MONTHLY_DECAY: f64 = 0.95;

/// Days a pattern may go unvalidated before time decay kicks in.
pub const DECAY_GRACE_DAYS: i64 = 30;

/// Flat multiplier when the recent-accuracy mean runs below the floor.
pub const PERFORMANCE_PENALTY: f64 = 0.9;
pub const PERFORMANCE_FLOOR: f64 = 0.5;

/// Update weight for new evidence against an established pattern.
/// Shrinks with sample size so well-observed patterns move slowly,
/// scales with the evidence score, and never exceeds 0.5.
pub fn update_weight(sample_size: u32, evidence: f64) -> f64 {
    ((1.0 / (1.0 + sample_size as f64 * 0.1)) * evidence).min(MAX_UPDATE_WEIGHT)
}

/// Fold a new validation score into an existing pattern.
pub fn apply_evidence(stat: &mut PatternStat, evidence: f64, now: DateTime<Utc>) {
    let w = update_weight(stat.sample_size, evidence);
    stat.confidence = stat.confidence * (1.0 - w) + evidence * w;
    stat.sample_size += 1;
    stat.push_recent(evidence);
    stat.last_validated_at = now;
}

/// Monthly exponential decay once a pattern has gone more than the
/// grace period without validation. Non-increasing.
pub fn time_decay(stat: &mut PatternStat, now: DateTime<Utc>) {
    let days = (now - stat.last_validated_at).num_days();
    if days > DECAY_GRACE_DAYS {
        stat.confidence *= MONTHLY_DECAY.powf(days as f64 / DECAY_GRACE_DAYS as f64);
    }
}

/// Flat penalty when recent validations have been running cold.
pub fn performance_decay(stat: &mut PatternStat) {
    if let Some(mean) = stat.recent_mean() {
        if mean < PERFORMANCE_FLOOR {
            stat.confidence *= PERFORMANCE_PENALTY;
        }
    }
}

/// Time-decay every pattern in the record except the ones just
/// validated. Run inline from step 3 so untouched patterns age even
/// while a sibling is being updated; pruning waits for the sweep.
pub fn decay_siblings(
    record: &mut EntityKnowledgeRecord,
    validated: &HashSet<String>,
    now: DateTime<Utc>,
) {
    for (key, stat) in record.patterns.iter_mut() {
        if !validated.contains(key) {
            time_decay(stat, now);
        }
    }
}

/// Full step-5 sweep over one record: time decay, performance penalty,
/// scheduled factor decays, then pruning. Returns how many patterns
/// were pruned. Re-running the sweep is harmless (decay is a pure
/// function of elapsed time and stored scores).
pub fn sweep_record(
    record: &mut EntityKnowledgeRecord,
    directives: &[DecayDirective],
    now: DateTime<Utc>,
) -> usize {
    for (key, stat) in record.patterns.iter_mut() {
        time_decay(stat, now);
        performance_decay(stat);

        let key_lower = key.to_lowercase();
        for directive in directives {
            if directive.expert_id == record.expert_id
                && key_lower.contains(&directive.factor.to_lowercase())
            {
                stat.confidence *= directive.penalty;
            }
        }
    }

    let before = record.patterns.len();
    record
        .patterns
        .retain(|_, stat| stat.confidence >= PRUNE_THRESHOLD);
    before - record.patterns.len()
}
