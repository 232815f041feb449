//! The six-step reconciliation workflow
//!
//! Given one completed event id, turns it into durable knowledge
//! updates and an audit record:
//!
//! 0. load outcome + forecasts
//! 1. accuracy analysis per expert per category
//! 2. learning classification (entity vs pairing, decay scheduling)
//! 3. entity knowledge update (weighted evidence + sibling decay)
//! 4. pairing memory update (append, trim to 15 rows)
//! 5. memory decay sweep (time, performance, scheduled factors, prune)
//! 6. completion logging + reconciled flag
//!
//! Steps return typed results and the driver short-circuits on the
//! first error; the partial step list is threaded into the failure
//! record so the audit trail shows exactly how far the run got.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::accuracy::analyze_forecast;
use crate::error::{StepName, WorkflowError};
use crate::knowledge::{apply_evidence, decay_siblings, sweep_record};
use crate::learning::{classify_analyses, InsightClassifier, KeywordClassifier};
use crate::store::Stores;
use crate::types::{
    AccuracyAnalysis, DecayDirective, EntityKnowledgeRecord, EventOutcome, ExpertForecast,
    FailureRecord, LearningItem, LearningScope, PairingMemoryRow, PatternStat, WorkflowRun,
    PAIRING_WINDOW,
};

/// Stateless between invocations; everything durable goes through the
/// store adapters. Cheap to clone for concurrent batch dispatch.
pub struct ReconciliationWorkflow<S> {
    stores: Arc<S>,
    classifier: Arc<dyn InsightClassifier>,
}

impl<S> Clone for ReconciliationWorkflow<S> {
    fn clone(&self) -> Self {
        Self {
            stores: Arc::clone(&self.stores),
            classifier: Arc::clone(&self.classifier),
        }
    }
}

impl<S: Stores> ReconciliationWorkflow<S> {
    pub fn new(stores: Arc<S>) -> Self {
        Self::with_classifier(stores, Arc::new(KeywordClassifier))
    }

    pub fn with_classifier(stores: Arc<S>, classifier: Arc<dyn InsightClassifier>) -> Self {
        Self { stores, classifier }
    }

    /// Run the full workflow for one event. On failure a FailureRecord
    /// is persisted before the error is returned; the event's
    /// reconciled flag is only set on full success.
    pub fn run(&self, event_id: &str) -> Result<WorkflowRun, WorkflowError> {
        let started_at = Utc::now();
        let mut completed: Vec<StepName> = Vec::new();
        info!(event_id, "reconciliation run starting");

        match self.execute(event_id, &mut completed) {
            Ok(run) => {
                info!(
                    event_id,
                    duration_ms = run.duration_ms,
                    "reconciliation run complete"
                );
                Ok(run)
            }
            Err(err) => {
                warn!(
                    event_id,
                    failed_step = %err.failed_step(),
                    error = %err,
                    "reconciliation run failed"
                );
                self.log_failure(event_id, started_at, &completed, &err);
                Err(err)
            }
        }
    }

    /// Standalone step-5 sweep over every knowledge record, without an
    /// event. Used by the operator CLI and safe to re-run at any time.
    pub fn decay_sweep(&self, directives: &[DecayDirective]) -> anyhow::Result<usize> {
        let now = Utc::now();
        let mut pruned = 0;
        for mut record in self.stores.list_knowledge()? {
            pruned += sweep_record(&mut record, directives, now);
            record.updated_at = now;
            self.stores.save_knowledge(&record)?;
        }
        Ok(pruned)
    }

    fn execute(
        &self,
        event_id: &str,
        completed: &mut Vec<StepName>,
    ) -> Result<WorkflowRun, WorkflowError> {
        let started_at = Utc::now();

        // Step 0: load. Missing data fails before anything mutates.
        let outcome = self
            .stores
            .get_event(event_id)
            .map_err(|e| persistence(StepName::Load, e))?
            .ok_or_else(|| WorkflowError::DataMissing {
                event_id: event_id.to_string(),
                what: "event outcome".into(),
            })?;

        let forecasts = self
            .stores
            .forecasts_for(event_id)
            .map_err(|e| persistence(StepName::Load, e))?;
        if forecasts.is_empty() {
            return Err(WorkflowError::DataMissing {
                event_id: event_id.to_string(),
                what: "expert forecasts".into(),
            });
        }
        completed.push(StepName::Load);

        // Step 1: accuracy analysis.
        let mut analyses: Vec<AccuracyAnalysis> = Vec::new();
        for forecast in &forecasts {
            let batch = analyze_forecast(&outcome, forecast)
                .map_err(|e| step(StepName::AccuracyAnalysis, e))?;
            analyses.extend(batch);
        }
        completed.push(StepName::AccuracyAnalysis);

        // Step 2: learning classification.
        let learning = classify_analyses(&outcome, &analyses, self.classifier.as_ref());
        debug!(
            event_id,
            items = learning.items.len(),
            decays = learning.decays.len(),
            "classified learning"
        );
        completed.push(StepName::LearningClassification);

        // Step 3: entity knowledge update.
        self.update_entity_knowledge(&learning.items)
            .map_err(|e| persistence(StepName::EntityKnowledgeUpdate, e))?;
        completed.push(StepName::EntityKnowledgeUpdate);

        // Step 4: pairing memory update. From here on a failure leaves
        // step-3 mutations in place; there is no rollback. Accepted:
        // the retry re-derives the same items and decay stays
        // idempotent, so a re-run converges rather than corrupts.
        self.update_pairing_memory(&outcome, &forecasts, &analyses, &learning.items)
            .map_err(|e| persistence(StepName::PairingMemoryUpdate, e))?;
        completed.push(StepName::PairingMemoryUpdate);

        // Step 5: global decay sweep, applying this run's directives.
        let pruned = self
            .decay_sweep(&learning.decays)
            .map_err(|e| persistence(StepName::MemoryDecay, e))?;
        if pruned > 0 {
            debug!(event_id, pruned, "pruned low-confidence patterns");
        }
        completed.push(StepName::MemoryDecay);

        // Step 6: completion logging + reconciled flag.
        completed.push(StepName::CompletionLogging);
        let finished_at = Utc::now();
        let run = WorkflowRun {
            id: Uuid::new_v4().to_string(),
            event_id: event_id.to_string(),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
            steps: completed.iter().map(|s| s.as_str().to_string()).collect(),
            success: true,
        };
        self.stores
            .insert_run(&run)
            .map_err(|e| persistence(StepName::CompletionLogging, e))?;
        self.stores
            .mark_reconciled(event_id, finished_at)
            .map_err(|e| persistence(StepName::CompletionLogging, e))?;

        Ok(run)
    }

    /// Step 3. Items are grouped per (entity, expert) so one record is
    /// loaded, updated, sibling-decayed, and saved exactly once per run.
    fn update_entity_knowledge(&self, items: &[LearningItem]) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut grouped: HashMap<(String, String), Vec<&LearningItem>> = HashMap::new();
        for item in items {
            if let LearningScope::Entity { entity_id } = &item.scope {
                grouped
                    .entry((entity_id.clone(), item.expert_id.clone()))
                    .or_default()
                    .push(item);
            }
        }

        for ((entity_id, expert_id), group) in grouped {
            let mut record = self
                .stores
                .load_knowledge(&entity_id, &expert_id)?
                .unwrap_or_else(|| EntityKnowledgeRecord::new(&entity_id, &expert_id, now));

            let mut validated: HashSet<String> = HashSet::new();
            for item in group {
                match record.patterns.get_mut(&item.pattern_key) {
                    Some(stat) => apply_evidence(stat, item.validation, now),
                    None => {
                        record
                            .patterns
                            .insert(item.pattern_key.clone(), PatternStat::new(item.validation, now));
                    }
                }
                validated.insert(item.pattern_key.clone());
            }

            // Untouched patterns age even while a sibling is updated.
            decay_siblings(&mut record, &validated, now);
            record.updated_at = now;
            self.stores.save_knowledge(&record)?;
        }

        Ok(())
    }

    /// Step 4. Append one row per pairing-scoped item, then trim the
    /// key back to the 15 most recent rows by event date.
    fn update_pairing_memory(
        &self,
        outcome: &EventOutcome,
        forecasts: &[ExpertForecast],
        analyses: &[AccuracyAnalysis],
        items: &[LearningItem],
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let outcome_snapshot = serde_json::json!({
            "home_score": outcome.home_score,
            "away_score": outcome.away_score,
            "winner": outcome.winner(),
        });

        for item in items {
            let pair_key = match &item.scope {
                LearningScope::Pairing { pair_key } => pair_key,
                LearningScope::Entity { .. } => continue,
            };

            let forecast_snapshot = forecasts
                .iter()
                .find(|f| f.expert_id == item.expert_id)
                .map(|f| serde_json::to_value(&f.predictions))
                .transpose()?
                .unwrap_or(serde_json::Value::Null);

            let accuracy: HashMap<&str, f64> = analyses
                .iter()
                .filter(|a| a.expert_id == item.expert_id)
                .map(|a| (a.category.as_str(), a.score))
                .collect();

            let row = PairingMemoryRow {
                id: None,
                pair_key: pair_key.clone(),
                expert_id: item.expert_id.clone(),
                event_date: outcome.event_date,
                forecast: forecast_snapshot,
                outcome: outcome_snapshot.clone(),
                accuracy: serde_json::to_value(&accuracy)?,
                insight: item.pattern_key.clone(),
                created_at: now,
            };
            self.stores.insert_row(&row)?;

            // Trim oldest-by-date beyond the window.
            let rows = self.stores.rows_for(pair_key, &item.expert_id)?;
            for stale in rows.iter().skip(PAIRING_WINDOW) {
                if let Some(id) = stale.id {
                    self.stores.delete_row(id)?;
                }
            }
        }

        Ok(())
    }

    fn log_failure(
        &self,
        event_id: &str,
        started_at: chrono::DateTime<Utc>,
        completed: &[StepName],
        err: &WorkflowError,
    ) {
        let retry_count = self
            .stores
            .failure_count(event_id)
            .map(|c| c + 1)
            .unwrap_or(1);

        let record = FailureRecord {
            event_id: event_id.to_string(),
            started_at,
            failed_at: Utc::now(),
            error: err.to_string(),
            steps_completed: completed.iter().map(|s| s.as_str().to_string()).collect(),
            failed_step: err.failed_step().as_str().to_string(),
            retry_count,
        };

        if let Err(log_err) = self.stores.insert_failure(&record) {
            error!(event_id, error = %log_err, "failed to persist failure record");
        }
    }
}

fn step(name: StepName, source: anyhow::Error) -> WorkflowError {
    WorkflowError::Step { step: name, source }
}

fn persistence(name: StepName, source: anyhow::Error) -> WorkflowError {
    WorkflowError::Persistence { step: name, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::store::{
        EntityKnowledgeStore, OutcomeStore, PairingMemoryStore, RunLogStore, SqliteStores,
    };
    use crate::types::{CategoryValue, EventStatus};
    use chrono::Duration;
    use tempfile::tempdir;

    fn setup() -> (ReconciliationWorkflow<SqliteStores>, Arc<SqliteStores>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let conn = init_db(&dir.path().join("test.db")).unwrap();
        let stores = Arc::new(SqliteStores::new(conn));
        (ReconciliationWorkflow::new(Arc::clone(&stores)), stores, dir)
    }

    fn seed_event(stores: &SqliteStores, id: &str) {
        stores
            .insert_event(&EventOutcome {
                id: id.to_string(),
                home_entity: "lakers".into(),
                away_entity: "celtics".into(),
                home_score: Some(110.0),
                away_score: Some(98.0),
                event_date: Utc::now() - Duration::hours(3),
                status: EventStatus::Final,
                final_stats: serde_json::json!({}),
                reconciled: false,
                reconciled_at: None,
            })
            .unwrap();
    }

    fn seed_forecast(stores: &SqliteStores, id: &str, event_id: &str, expert: &str, factors: Vec<&str>) {
        let mut predictions = HashMap::new();
        predictions.insert(
            "winner".to_string(),
            CategoryValue::Categorical("lakers".into()),
        );
        predictions.insert("margin".to_string(), CategoryValue::Numeric(10.0));
        let mut confidence = HashMap::new();
        confidence.insert("winner".to_string(), 0.85);
        confidence.insert("margin".to_string(), 0.7);
        stores
            .insert_forecast(&ExpertForecast {
                id: id.to_string(),
                expert_id: expert.to_string(),
                event_id: event_id.to_string(),
                predictions,
                confidence,
                reasoning_factors: factors.into_iter().map(String::from).collect(),
            })
            .unwrap();
    }

    #[test]
    fn test_successful_run_completes_all_steps() {
        let (workflow, stores, _dir) = setup();
        seed_event(&stores, "evt-1");
        seed_forecast(&stores, "f-1", "evt-1", "expert-a", vec!["home-field advantage"]);

        let run = workflow.run("evt-1").unwrap();
        assert!(run.success);
        assert_eq!(
            run.steps,
            vec![
                "load",
                "accuracy_analysis",
                "learning_classification",
                "entity_knowledge_update",
                "pairing_memory_update",
                "memory_decay",
                "completion_logging",
            ]
        );

        // Event is reconciled and out of the discovery set
        let event = stores.get_event("evt-1").unwrap().unwrap();
        assert!(event.reconciled);
        assert!(event.reconciled_at.is_some());
        assert!(stores.list_completed_unreconciled().unwrap().is_empty());

        // Winner + margin both accurate: entity knowledge created for
        // the winning entity
        let record = stores.load_knowledge("lakers", "expert-a").unwrap().unwrap();
        assert!(!record.patterns.is_empty());
        for stat in record.patterns.values() {
            assert_eq!(stat.sample_size, 1);
            assert!(stat.confidence > 0.8);
        }
    }

    #[test]
    fn test_missing_event_fails_before_step_one() {
        let (workflow, stores, _dir) = setup();

        let err = workflow.run("ghost").unwrap_err();
        assert!(matches!(err, WorkflowError::DataMissing { .. }));
        assert_eq!(err.failed_step(), StepName::Load);

        // Failure path recorded with an empty step list
        assert_eq!(stores.failure_count("ghost").unwrap(), 1);
    }

    #[test]
    fn test_missing_forecasts_fail_immediately() {
        let (workflow, stores, _dir) = setup();
        seed_event(&stores, "evt-1");

        let err = workflow.run("evt-1").unwrap_err();
        assert!(err.to_string().contains("expert forecasts"));

        // Event stays unreconciled so the monitor can retry
        assert!(!stores.get_event("evt-1").unwrap().unwrap().reconciled);
        assert_eq!(stores.failure_count("evt-1").unwrap(), 1);
    }

    #[test]
    fn test_failure_retry_count_increments() {
        let (workflow, stores, _dir) = setup();
        seed_event(&stores, "evt-1");

        for expected in 1..=3 {
            workflow.run("evt-1").unwrap_err();
            assert_eq!(stores.failure_count("evt-1").unwrap(), expected);
        }
    }

    #[test]
    fn test_unknown_category_aborts_in_step_one() {
        let (workflow, stores, _dir) = setup();
        seed_event(&stores, "evt-1");

        let mut predictions = HashMap::new();
        predictions.insert("vibes".to_string(), CategoryValue::Numeric(7.0));
        stores
            .insert_forecast(&ExpertForecast {
                id: "f-1".into(),
                expert_id: "expert-a".into(),
                event_id: "evt-1".into(),
                predictions,
                confidence: HashMap::new(),
                reasoning_factors: vec![],
            })
            .unwrap();

        let err = workflow.run("evt-1").unwrap_err();
        assert_eq!(err.failed_step(), StepName::AccuracyAnalysis);
        assert!(!stores.get_event("evt-1").unwrap().unwrap().reconciled);
    }

    #[test]
    fn test_repeat_evidence_updates_existing_pattern() {
        let (workflow, stores, _dir) = setup();

        for i in 0..2 {
            let id = format!("evt-{}", i);
            seed_event(&stores, &id);
            seed_forecast(&stores, &format!("f-{}", i), &id, "expert-a", vec!["home-field advantage"]);
            workflow.run(&id).unwrap();
        }

        let record = stores.load_knowledge("lakers", "expert-a").unwrap().unwrap();
        for stat in record.patterns.values() {
            assert_eq!(stat.sample_size, 2);
            assert_eq!(stat.recent_accuracy.len(), 2);
        }
    }

    #[test]
    fn test_pairing_memory_appended_and_trimmed() {
        let (workflow, stores, _dir) = setup();

        // Pre-fill the key with 15 old rows
        let base = Utc::now() - Duration::days(100);
        for i in 0..15 {
            stores
                .insert_row(&PairingMemoryRow {
                    id: None,
                    pair_key: "lakers|celtics".into(),
                    expert_id: "expert-a".into(),
                    event_date: base + Duration::days(i),
                    forecast: serde_json::json!({}),
                    outcome: serde_json::json!({}),
                    accuracy: serde_json::json!({}),
                    insight: format!("old-{}", i),
                    created_at: base,
                })
                .unwrap();
        }

        seed_event(&stores, "evt-1");
        seed_forecast(&stores, "f-1", "evt-1", "expert-a", vec!["head-to-head record"]);
        workflow.run("evt-1").unwrap();

        let rows = stores.rows_for("lakers|celtics", "expert-a").unwrap();
        assert_eq!(rows.len(), PAIRING_WINDOW);
        // Newest row is this event's, the oldest prefill row is gone
        assert!(rows[0].insight.contains("head-to-head"));
        assert!(!rows.iter().any(|r| r.insight == "old-0"));
        assert!(rows.iter().any(|r| r.insight == "old-14"));
    }

    #[test]
    fn test_run_records_are_per_attempt() {
        let (workflow, stores, _dir) = setup();
        seed_event(&stores, "evt-1");
        seed_forecast(&stores, "f-1", "evt-1", "expert-a", vec![]);

        workflow.run("evt-1").unwrap();
        let stats = stores.window_stats(Utc::now() - Duration::hours(1)).unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 0);
        assert!(stats.avg_duration_ms >= 0.0);
    }

    #[test]
    fn test_standalone_decay_sweep_prunes() {
        let (workflow, stores, _dir) = setup();
        let long_ago = Utc::now() - Duration::days(400);

        let mut record = EntityKnowledgeRecord::new("lakers", "expert-a", long_ago);
        record.patterns.insert(
            "fading pattern".into(),
            PatternStat {
                confidence: 0.25,
                sample_size: 3,
                created_at: long_ago,
                last_validated_at: long_ago,
                recent_accuracy: vec![0.3, 0.2],
            },
        );
        stores.save_knowledge(&record).unwrap();

        // 400 days: 0.25 * 0.95^(400/30) * 0.9 (cold streak) < 0.20
        let pruned = workflow.decay_sweep(&[]).unwrap();
        assert_eq!(pruned, 1);
        let record = stores.load_knowledge("lakers", "expert-a").unwrap().unwrap();
        assert!(record.patterns.is_empty());
    }
}
