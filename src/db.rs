//! Database layer for reckon's knowledge storage
//!
//! Uses a single SQLite file - no network dependencies, works offline,
//! trivially snapshotted. Dynamic payloads (forecast maps, pattern maps,
//! step lists) are persisted as JSON in TEXT columns; everything the
//! monitor filters on is a plain column with an index.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;

/// Initialize the database with schema
pub fn init_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database at {:?}", path))?;

    conn.execute_batch(SCHEMA)?;

    Ok(conn)
}

const SCHEMA: &str = r#"
-- Events: outcomes ingested by an external feed
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    home_entity TEXT NOT NULL,
    away_entity TEXT NOT NULL,
    home_score REAL,                -- NULL until final
    away_score REAL,
    event_date TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'scheduled',
    final_stats TEXT,               -- JSON payload from the feed
    reconciled INTEGER NOT NULL DEFAULT 0,
    reconciled_at TEXT,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

-- Discovery query filters on these
CREATE INDEX IF NOT EXISTS idx_events_discovery ON events(status, reconciled);

-- Forecasts: one row per expert per event, read-only input
CREATE TABLE IF NOT EXISTS forecasts (
    id TEXT PRIMARY KEY,
    expert_id TEXT NOT NULL,
    event_id TEXT NOT NULL REFERENCES events(id),
    predictions TEXT NOT NULL,      -- JSON category -> tagged value
    confidence TEXT NOT NULL,       -- JSON category -> 0..1
    reasoning_factors TEXT,         -- JSON array of labels
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_forecasts_event ON forecasts(event_id);

-- Entity knowledge: one row per (entity, expert), patterns as JSON
CREATE TABLE IF NOT EXISTS entity_knowledge (
    entity_id TEXT NOT NULL,
    expert_id TEXT NOT NULL,
    patterns TEXT NOT NULL,         -- JSON pattern_key -> stat
    updated_at TEXT NOT NULL,
    PRIMARY KEY (entity_id, expert_id)
);

-- Pairing memory: append-then-trim rows per (pair, expert)
CREATE TABLE IF NOT EXISTS pairing_memory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pair_key TEXT NOT NULL,
    expert_id TEXT NOT NULL,
    event_date TEXT NOT NULL,
    forecast TEXT NOT NULL,         -- forecast snapshot JSON
    outcome TEXT NOT NULL,          -- outcome snapshot JSON
    accuracy TEXT NOT NULL,         -- category -> score JSON
    insight TEXT,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_pairing_key ON pairing_memory(pair_key, expert_id, event_date);

-- Workflow runs: one row per attempt (audit trail)
CREATE TABLE IF NOT EXISTS workflow_runs (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    steps TEXT NOT NULL,            -- JSON array of step names
    success INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_event ON workflow_runs(event_id);
CREATE INDEX IF NOT EXISTS idx_runs_finished ON workflow_runs(finished_at);

-- Workflow failures: what broke, where, and how many times
CREATE TABLE IF NOT EXISTS workflow_failures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    error TEXT NOT NULL,
    steps_completed TEXT NOT NULL,  -- JSON array of step names
    failed_step TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_failures_event ON workflow_failures(event_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_db() {
        let dir = tempdir().unwrap();
        let conn = init_db(&dir.path().join("test.db")).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"events".to_string()));
        assert!(tables.contains(&"forecasts".to_string()));
        assert!(tables.contains(&"entity_knowledge".to_string()));
        assert!(tables.contains(&"pairing_memory".to_string()));
        assert!(tables.contains(&"workflow_runs".to_string()));
        assert!(tables.contains(&"workflow_failures".to_string()));
    }

    #[test]
    fn test_init_db_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        init_db(&path).unwrap();
        // Re-opening runs the schema batch again without error
        init_db(&path).unwrap();
    }
}
