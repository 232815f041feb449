//! Core types for the reckon reconciliation engine
//!
//! The data model splits cleanly into three lifetimes:
//! - immutable inputs (EventOutcome, ExpertForecast)
//! - ephemeral per-run values (AccuracyAnalysis, LearningItem, DecayDirective)
//! - long-lived knowledge (EntityKnowledgeRecord, PairingMemoryRow) that is
//!   decayed and trimmed but never deleted wholesale

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How many recent accuracy scores a pattern keeps.
pub const RECENT_WINDOW: usize = 5;

/// Maximum pairing-memory rows per (pair, expert) key.
pub const PAIRING_WINDOW: usize = 15;

/// Lifecycle state of an event as reported by the ingestion feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Scheduled,
    Live,
    Final,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Scheduled => "scheduled",
            EventStatus::Live => "live",
            EventStatus::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(EventStatus::Scheduled),
            "live" => Some(EventStatus::Live),
            "final" => Some(EventStatus::Final),
            _ => None,
        }
    }
}

/// A completed (or pending) real-world event.
///
/// Created by an external ingestion process; this crate only ever flips
/// `reconciled` from false to true, exactly once, via a successful
/// workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventOutcome {
    pub id: String,
    pub home_entity: String,
    pub away_entity: String,
    pub home_score: Option<f64>,
    pub away_score: Option<f64>,
    pub event_date: DateTime<Utc>,
    pub status: EventStatus,
    /// Arbitrary final-stats payload from the feed.
    pub final_stats: serde_json::Value,
    pub reconciled: bool,
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl EventOutcome {
    /// Final, scores present, not yet reconciled.
    pub fn ready_for_reconciliation(&self) -> bool {
        self.status == EventStatus::Final
            && self.home_score.is_some()
            && self.away_score.is_some()
            && !self.reconciled
    }

    /// Winning entity id, or None on a draw.
    pub fn winner(&self) -> Option<&str> {
        let (h, a) = (self.home_score?, self.away_score?);
        if h > a {
            Some(&self.home_entity)
        } else if a > h {
            Some(&self.away_entity)
        } else {
            None
        }
    }

    /// Home-minus-away score margin.
    pub fn margin(&self) -> Option<f64> {
        Some(self.home_score? - self.away_score?)
    }

    /// Combined score of both participants.
    pub fn total(&self) -> Option<f64> {
        Some(self.home_score? + self.away_score?)
    }

    /// Ordered pairing key for this event's participants.
    pub fn pair_key(&self) -> String {
        pair_key(&self.home_entity, &self.away_entity)
    }
}

/// Ordered pairing key: home first, away second. Order matters - a home
/// matchup and its reverse are different memories.
pub fn pair_key(home: &str, away: &str) -> String {
    format!("{}|{}", home, away)
}

/// A single predicted value. Categories are a closed set; a forecast
/// naming a category this engine does not know fails step 1 loudly
/// instead of silently scoring nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum CategoryValue {
    Categorical(String),
    Numeric(f64),
}

/// The fixed forecast-category taxonomy and its outcome extractors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Which participant wins. Categorical, exact match.
    Winner,
    /// Home-minus-away margin. Numeric, normalized by 50.
    Margin,
    /// Combined score. Numeric, normalized by 60.
    Total,
}

impl Category {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "winner" => Some(Category::Winner),
            "margin" => Some(Category::Margin),
            "total" => Some(Category::Total),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Category::Winner => "winner",
            Category::Margin => "margin",
            Category::Total => "total",
        }
    }

    /// Error normalizer for numeric categories.
    pub fn scale(&self) -> Option<f64> {
        match self {
            Category::Winner => None,
            Category::Margin => Some(50.0),
            Category::Total => Some(60.0),
        }
    }
}

/// One expert's forecast for one event. Read-only input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertForecast {
    pub id: String,
    pub expert_id: String,
    pub event_id: String,
    /// Category name -> predicted value.
    pub predictions: HashMap<String, CategoryValue>,
    /// Category name -> stated confidence in [0, 1].
    pub confidence: HashMap<String, f64>,
    /// Reasoning-factor labels behind this forecast.
    pub reasoning_factors: Vec<String>,
}

/// Per-category accuracy result for one expert. Ephemeral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracyAnalysis {
    pub expert_id: String,
    pub category: String,
    pub predicted: CategoryValue,
    pub actual: CategoryValue,
    /// Accuracy score in [0, 1].
    pub score: f64,
    /// Whether |stated confidence - score| < 0.3.
    pub calibrated: bool,
    pub factors: Vec<String>,
    /// Signed error: predicted minus actual for numeric categories,
    /// 0.0 / 1.0 for categorical match / mismatch.
    pub error: f64,
}

/// Whether a learned insight belongs to one participant or to the
/// ordered pairing of both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LearningScope {
    Entity { entity_id: String },
    Pairing { pair_key: String },
}

/// A classified insight derived from a high-accuracy analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningItem {
    pub expert_id: String,
    pub scope: LearningScope,
    pub pattern_key: String,
    /// Validation score, equal to the source accuracy score.
    pub validation: f64,
}

/// A scheduled confidence penalty for a reasoning factor that backed a
/// badly-missed forecast. Recorded in step 2, applied in step 5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayDirective {
    pub expert_id: String,
    pub factor: String,
    /// Multiplier in (0, 1], proportional to the miss magnitude.
    pub penalty: f64,
}

/// Statistics for one learned pattern inside an EntityKnowledgeRecord.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternStat {
    pub confidence: f64,
    pub sample_size: u32,
    pub created_at: DateTime<Utc>,
    pub last_validated_at: DateTime<Utc>,
    /// Ring buffer of the last `RECENT_WINDOW` validation scores.
    pub recent_accuracy: Vec<f64>,
}

impl PatternStat {
    /// First observation of a pattern.
    pub fn new(evidence: f64, now: DateTime<Utc>) -> Self {
        Self {
            confidence: evidence,
            sample_size: 1,
            created_at: now,
            last_validated_at: now,
            recent_accuracy: vec![evidence],
        }
    }

    /// Append a score, dropping the oldest beyond the window.
    pub fn push_recent(&mut self, score: f64) {
        if self.recent_accuracy.len() >= RECENT_WINDOW {
            self.recent_accuracy.remove(0);
        }
        self.recent_accuracy.push(score);
    }

    pub fn recent_mean(&self) -> Option<f64> {
        if self.recent_accuracy.is_empty() {
            return None;
        }
        Some(self.recent_accuracy.iter().sum::<f64>() / self.recent_accuracy.len() as f64)
    }
}

/// Durable per-(entity, expert) knowledge. Created lazily on first
/// observation; patterns decay and prune but the record persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityKnowledgeRecord {
    pub entity_id: String,
    pub expert_id: String,
    pub patterns: HashMap<String, PatternStat>,
    pub updated_at: DateTime<Utc>,
}

impl EntityKnowledgeRecord {
    pub fn new(entity_id: &str, expert_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            expert_id: expert_id.to_string(),
            patterns: HashMap::new(),
            updated_at: now,
        }
    }
}

/// One row of pairing-scoped memory for a repeated matchup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingMemoryRow {
    /// Database row id, None before insertion.
    pub id: Option<i64>,
    pub pair_key: String,
    pub expert_id: String,
    pub event_date: DateTime<Utc>,
    pub forecast: serde_json::Value,
    pub outcome: serde_json::Value,
    pub accuracy: serde_json::Value,
    pub insight: String,
    pub created_at: DateTime<Utc>,
}

/// Audit record for one workflow attempt. One row per attempt, not per
/// event - retries produce additional rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub event_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    /// Step names completed, in execution order.
    pub steps: Vec<String>,
    pub success: bool,
}

/// Audit record for a failed workflow attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub event_id: String,
    pub started_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub error: String,
    pub steps_completed: Vec<String>,
    pub failed_step: String,
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(home: f64, away: f64) -> EventOutcome {
        EventOutcome {
            id: "evt-1".into(),
            home_entity: "lakers".into(),
            away_entity: "celtics".into(),
            home_score: Some(home),
            away_score: Some(away),
            event_date: Utc::now(),
            status: EventStatus::Final,
            final_stats: serde_json::json!({}),
            reconciled: false,
            reconciled_at: None,
        }
    }

    #[test]
    fn test_outcome_extractors() {
        let o = outcome(110.0, 98.0);
        assert_eq!(o.winner(), Some("lakers"));
        assert_eq!(o.margin(), Some(12.0));
        assert_eq!(o.total(), Some(208.0));
        assert_eq!(o.pair_key(), "lakers|celtics");
    }

    #[test]
    fn test_draw_has_no_winner() {
        assert_eq!(outcome(100.0, 100.0).winner(), None);
    }

    #[test]
    fn test_ready_for_reconciliation() {
        let mut o = outcome(110.0, 98.0);
        assert!(o.ready_for_reconciliation());

        o.reconciled = true;
        assert!(!o.ready_for_reconciliation());

        let mut pending = outcome(0.0, 0.0);
        pending.home_score = None;
        assert!(!pending.ready_for_reconciliation());

        let mut live = outcome(50.0, 48.0);
        live.status = EventStatus::Live;
        assert!(!live.ready_for_reconciliation());
    }

    #[test]
    fn test_category_taxonomy() {
        assert_eq!(Category::parse("winner"), Some(Category::Winner));
        assert_eq!(Category::parse("margin"), Some(Category::Margin));
        assert_eq!(Category::parse("possession_time"), None);
        assert_eq!(Category::Margin.scale(), Some(50.0));
        assert_eq!(Category::Winner.scale(), None);
    }

    #[test]
    fn test_pattern_recent_window() {
        let mut stat = PatternStat::new(0.9, Utc::now());
        for i in 0..10 {
            stat.push_recent(i as f64 / 10.0);
        }
        assert_eq!(stat.recent_accuracy.len(), RECENT_WINDOW);
        // Oldest scores dropped first.
        assert_eq!(stat.recent_accuracy, vec![0.5, 0.6, 0.7, 0.8, 0.9]);
    }

    #[test]
    fn test_recent_mean() {
        let mut stat = PatternStat::new(0.4, Utc::now());
        stat.push_recent(0.6);
        assert_eq!(stat.recent_mean(), Some(0.5));
    }

    #[test]
    fn test_category_value_roundtrip() {
        let v = CategoryValue::Numeric(12.5);
        let json = serde_json::to_string(&v).unwrap();
        let back: CategoryValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
