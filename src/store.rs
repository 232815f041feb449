//! Store adapters: the narrow interfaces the workflow and monitor consume
//!
//! The core never talks to SQL directly - it goes through five small
//! traits (outcomes, forecasts, entity knowledge, pairing memory, run
//! logs) so the persistence backend stays swappable. `SqliteStores`
//! implements all five over one shared connection.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::{
    EntityKnowledgeRecord, EventOutcome, EventStatus, ExpertForecast, FailureRecord,
    PairingMemoryRow, PatternStat, WorkflowRun,
};

/// Event-outcome reads plus the single reconciled-flag write.
pub trait OutcomeStore: Send + Sync {
    fn list_completed_unreconciled(&self) -> Result<Vec<EventOutcome>>;
    fn get_event(&self, event_id: &str) -> Result<Option<EventOutcome>>;
    fn mark_reconciled(&self, event_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Read-only forecast access.
pub trait ForecastStore: Send + Sync {
    fn forecasts_for(&self, event_id: &str) -> Result<Vec<ExpertForecast>>;
}

/// Per-(entity, expert) knowledge records, whole-record read-modify-write.
pub trait EntityKnowledgeStore: Send + Sync {
    fn load_knowledge(&self, entity_id: &str, expert_id: &str)
        -> Result<Option<EntityKnowledgeRecord>>;
    fn save_knowledge(&self, record: &EntityKnowledgeRecord) -> Result<()>;
    /// Every record, for the global decay sweep.
    fn list_knowledge(&self) -> Result<Vec<EntityKnowledgeRecord>>;
}

/// Append-then-trim pairing memory rows.
pub trait PairingMemoryStore: Send + Sync {
    fn insert_row(&self, row: &PairingMemoryRow) -> Result<i64>;
    /// Rows for one (pair, expert) key, newest event date first.
    fn rows_for(&self, pair_key: &str, expert_id: &str) -> Result<Vec<PairingMemoryRow>>;
    fn delete_row(&self, row_id: i64) -> Result<()>;
}

/// Rolling statistics over the last-24h audit window.
#[derive(Debug, Clone, Default)]
pub struct RunWindowStats {
    pub processed: i64,
    pub failed: i64,
    pub avg_duration_ms: f64,
}

/// Workflow audit trail.
pub trait RunLogStore: Send + Sync {
    fn insert_run(&self, run: &WorkflowRun) -> Result<()>;
    fn insert_failure(&self, failure: &FailureRecord) -> Result<()>;
    /// How many failure records exist for an event.
    fn failure_count(&self, event_id: &str) -> Result<u32>;
    fn window_stats(&self, since: DateTime<Utc>) -> Result<RunWindowStats>;
}

/// Everything the workflow and monitor need, in one bound.
pub trait Stores:
    OutcomeStore + ForecastStore + EntityKnowledgeStore + PairingMemoryStore + RunLogStore
{
}

impl<T> Stores for T where
    T: OutcomeStore + ForecastStore + EntityKnowledgeStore + PairingMemoryStore + RunLogStore
{
}

/// All five stores over one shared SQLite connection.
///
/// rusqlite connections are Send but not Sync, so the connection sits
/// behind a Mutex; every store call holds the lock for exactly one
/// statement batch.
pub struct SqliteStores {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStores {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    /// Seed an event row (ingestion normally does this; used by the CLI
    /// demo path and tests).
    pub fn insert_event(&self, event: &EventOutcome) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO events (id, home_entity, away_entity, home_score, away_score,
                                event_date, status, final_stats, reconciled, reconciled_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                event.id,
                event.home_entity,
                event.away_entity,
                event.home_score,
                event.away_score,
                event.event_date.to_rfc3339(),
                event.status.as_str(),
                event.final_stats.to_string(),
                event.reconciled as i32,
                event.reconciled_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Seed a forecast row.
    pub fn insert_forecast(&self, forecast: &ExpertForecast) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO forecasts (id, expert_id, event_id, predictions, confidence, reasoning_factors)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                forecast.id,
                forecast.expert_id,
                forecast.event_id,
                serde_json::to_string(&forecast.predictions)?,
                serde_json::to_string(&forecast.confidence)?,
                serde_json::to_string(&forecast.reasoning_factors)?,
            ],
        )?;
        Ok(())
    }

    /// High-level learning summary for the operator CLI.
    pub fn summary(&self) -> Result<LearningSummary> {
        let conn = self.conn()?;

        let total_runs: i64 =
            conn.query_row("SELECT COUNT(*) FROM workflow_runs", [], |row| row.get(0))?;
        let successful_runs: i64 = conn.query_row(
            "SELECT COUNT(*) FROM workflow_runs WHERE success = 1",
            [],
            |row| row.get(0),
        )?;
        let total_failures: i64 = conn.query_row(
            "SELECT COUNT(*) FROM workflow_failures",
            [],
            |row| row.get(0),
        )?;
        let events_reconciled: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE reconciled = 1",
            [],
            |row| row.get(0),
        )?;
        let experts_tracked: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT expert_id) FROM entity_knowledge",
            [],
            |row| row.get(0),
        )?;

        let mut patterns_tracked: usize = 0;
        let mut stmt = conn.prepare("SELECT patterns FROM entity_knowledge")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            let patterns: HashMap<String, PatternStat> = serde_json::from_str(&raw)?;
            patterns_tracked += patterns.len();
        }

        Ok(LearningSummary {
            total_runs,
            successful_runs,
            success_rate: if total_runs > 0 {
                successful_runs as f64 / total_runs as f64
            } else {
                0.0
            },
            total_failures,
            events_reconciled,
            experts_tracked,
            patterns_tracked,
        })
    }
}

/// Operator-facing learning summary.
#[derive(Debug, Clone)]
pub struct LearningSummary {
    pub total_runs: i64,
    pub successful_runs: i64,
    pub success_rate: f64,
    pub total_failures: i64,
    pub events_reconciled: i64,
    pub experts_tracked: i64,
    pub patterns_tracked: usize,
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("bad timestamp in database: {}", s))
}

type RawEvent = (
    String,
    String,
    String,
    Option<f64>,
    Option<f64>,
    String,
    String,
    Option<String>,
    i64,
    Option<String>,
);

fn event_from_raw(raw: RawEvent) -> Result<EventOutcome> {
    let (id, home, away, hs, aws, date, status, stats, reconciled, reconciled_at) = raw;
    Ok(EventOutcome {
        id,
        home_entity: home,
        away_entity: away,
        home_score: hs,
        away_score: aws,
        event_date: parse_ts(&date)?,
        status: EventStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown event status: {}", status))?,
        final_stats: match stats {
            Some(s) => serde_json::from_str(&s)?,
            None => serde_json::Value::Null,
        },
        reconciled: reconciled != 0,
        reconciled_at: reconciled_at.as_deref().map(parse_ts).transpose()?,
    })
}

const EVENT_COLUMNS: &str = "id, home_entity, away_entity, home_score, away_score, \
                             event_date, status, final_stats, reconciled, reconciled_at";

fn raw_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

impl OutcomeStore for SqliteStores {
    fn list_completed_unreconciled(&self) -> Result<Vec<EventOutcome>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM events
             WHERE status = 'final'
               AND home_score IS NOT NULL
               AND away_score IS NOT NULL
               AND reconciled = 0
             ORDER BY event_date",
            EVENT_COLUMNS
        ))?;

        let raw: Vec<RawEvent> = stmt
            .query_map([], raw_event_row)?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter().map(event_from_raw).collect()
    }

    fn get_event(&self, event_id: &str) -> Result<Option<EventOutcome>> {
        let conn = self.conn()?;
        let raw: Option<RawEvent> = conn
            .query_row(
                &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
                [event_id],
                raw_event_row,
            )
            .optional()?;

        raw.map(event_from_raw).transpose()
    }

    fn mark_reconciled(&self, event_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        // Idempotent: a forced re-run keeps the original timestamp.
        let updated = conn.execute(
            "UPDATE events
             SET reconciled = 1, reconciled_at = COALESCE(reconciled_at, ?2)
             WHERE id = ?1",
            params![event_id, at.to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(anyhow!("cannot mark unknown event {} reconciled", event_id));
        }
        Ok(())
    }
}

impl ForecastStore for SqliteStores {
    fn forecasts_for(&self, event_id: &str) -> Result<Vec<ExpertForecast>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, expert_id, event_id, predictions, confidence, reasoning_factors
             FROM forecasts WHERE event_id = ?1 ORDER BY expert_id",
        )?;

        let raw: Vec<(String, String, String, String, String, Option<String>)> = stmt
            .query_map([event_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(id, expert_id, event_id, predictions, confidence, factors)| {
                Ok(ExpertForecast {
                    id,
                    expert_id,
                    event_id,
                    predictions: serde_json::from_str(&predictions)
                        .context("malformed forecast predictions")?,
                    confidence: serde_json::from_str(&confidence)
                        .context("malformed forecast confidence")?,
                    reasoning_factors: match factors {
                        Some(f) => serde_json::from_str(&f)
                            .context("malformed reasoning factors")?,
                        None => Vec::new(),
                    },
                })
            })
            .collect()
    }
}

impl EntityKnowledgeStore for SqliteStores {
    fn load_knowledge(
        &self,
        entity_id: &str,
        expert_id: &str,
    ) -> Result<Option<EntityKnowledgeRecord>> {
        let conn = self.conn()?;
        let raw: Option<(String, String)> = conn
            .query_row(
                "SELECT patterns, updated_at FROM entity_knowledge
                 WHERE entity_id = ?1 AND expert_id = ?2",
                params![entity_id, expert_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        raw.map(|(patterns, updated_at)| {
            Ok(EntityKnowledgeRecord {
                entity_id: entity_id.to_string(),
                expert_id: expert_id.to_string(),
                patterns: serde_json::from_str(&patterns)
                    .context("malformed knowledge patterns")?,
                updated_at: parse_ts(&updated_at)?,
            })
        })
        .transpose()
    }

    fn save_knowledge(&self, record: &EntityKnowledgeRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO entity_knowledge (entity_id, expert_id, patterns, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(entity_id, expert_id) DO UPDATE SET
                patterns = excluded.patterns,
                updated_at = excluded.updated_at
            "#,
            params![
                record.entity_id,
                record.expert_id,
                serde_json::to_string(&record.patterns)?,
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn list_knowledge(&self) -> Result<Vec<EntityKnowledgeRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT entity_id, expert_id, patterns, updated_at FROM entity_knowledge",
        )?;

        let raw: Vec<(String, String, String, String)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(entity_id, expert_id, patterns, updated_at)| {
                Ok(EntityKnowledgeRecord {
                    entity_id,
                    expert_id,
                    patterns: serde_json::from_str(&patterns)
                        .context("malformed knowledge patterns")?,
                    updated_at: parse_ts(&updated_at)?,
                })
            })
            .collect()
    }
}

impl PairingMemoryStore for SqliteStores {
    fn insert_row(&self, row: &PairingMemoryRow) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO pairing_memory (pair_key, expert_id, event_date, forecast,
                                        outcome, accuracy, insight, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                row.pair_key,
                row.expert_id,
                row.event_date.to_rfc3339(),
                row.forecast.to_string(),
                row.outcome.to_string(),
                row.accuracy.to_string(),
                row.insight,
                row.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn rows_for(&self, pair_key: &str, expert_id: &str) -> Result<Vec<PairingMemoryRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_date, forecast, outcome, accuracy, insight, created_at
             FROM pairing_memory
             WHERE pair_key = ?1 AND expert_id = ?2
             ORDER BY event_date DESC",
        )?;

        let raw: Vec<(i64, String, String, String, String, Option<String>, String)> = stmt
            .query_map(params![pair_key, expert_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(id, event_date, forecast, outcome, accuracy, insight, created_at)| {
                Ok(PairingMemoryRow {
                    id: Some(id),
                    pair_key: pair_key.to_string(),
                    expert_id: expert_id.to_string(),
                    event_date: parse_ts(&event_date)?,
                    forecast: serde_json::from_str(&forecast)?,
                    outcome: serde_json::from_str(&outcome)?,
                    accuracy: serde_json::from_str(&accuracy)?,
                    insight: insight.unwrap_or_default(),
                    created_at: parse_ts(&created_at)?,
                })
            })
            .collect()
    }

    fn delete_row(&self, row_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM pairing_memory WHERE id = ?1", [row_id])?;
        Ok(())
    }
}

impl RunLogStore for SqliteStores {
    fn insert_run(&self, run: &WorkflowRun) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO workflow_runs (id, event_id, started_at, finished_at,
                                       duration_ms, steps, success)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                run.id,
                run.event_id,
                run.started_at.to_rfc3339(),
                run.finished_at.to_rfc3339(),
                run.duration_ms,
                serde_json::to_string(&run.steps)?,
                run.success as i32,
            ],
        )?;
        Ok(())
    }

    fn insert_failure(&self, failure: &FailureRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO workflow_failures (event_id, started_at, failed_at, error,
                                           steps_completed, failed_step, retry_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                failure.event_id,
                failure.started_at.to_rfc3339(),
                failure.failed_at.to_rfc3339(),
                failure.error,
                serde_json::to_string(&failure.steps_completed)?,
                failure.failed_step,
                failure.retry_count,
            ],
        )?;
        Ok(())
    }

    fn failure_count(&self, event_id: &str) -> Result<u32> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM workflow_failures WHERE event_id = ?1",
            [event_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    fn window_stats(&self, since: DateTime<Utc>) -> Result<RunWindowStats> {
        let conn = self.conn()?;
        let since = since.to_rfc3339();

        let (processed, avg_duration_ms): (i64, f64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(AVG(duration_ms), 0.0)
             FROM workflow_runs WHERE success = 1 AND finished_at >= ?1",
            [&since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let failed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM workflow_failures WHERE failed_at >= ?1",
            [&since],
            |row| row.get(0),
        )?;

        Ok(RunWindowStats {
            processed,
            failed,
            avg_duration_ms,
        })
    }
}
