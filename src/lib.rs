//! reckon - Forecast Reconciliation Engine
//!
//! A self-improving loop for a fleet of forecasting experts: every
//! completed real-world event is reconciled against each expert's
//! prior forecast exactly once, and the result becomes durable,
//! decaying, bounded knowledge - with no human in the loop.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use reckon::{init_db, CompletionMonitor, MonitorConfig, SqliteStores};
//! use std::sync::Arc;
//!
//! let conn = init_db(&db_path)?;
//! let stores = Arc::new(SqliteStores::new(conn));
//!
//! // Run the unattended loop
//! let monitor = CompletionMonitor::new(stores, MonitorConfig::default());
//! monitor.run().await;
//!
//! // Or reconcile one event by hand
//! let result = monitor.force_process("evt-2024-11-02-lal-bos");
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  CompletionMonitor                                   │
//! │  poll → filter → batch → dispatch → retry/park       │
//! └───────────────────────┬──────────────────────────────┘
//!                         │ per event
//!                         ▼
//! ┌──────────────────────────────────────────────────────┐
//! │  ReconciliationWorkflow (six steps, short-circuit)   │
//! │  load → accuracy → classify → knowledge → pairing    │
//! │       → decay → completion logging                   │
//! └───────────────────────┬──────────────────────────────┘
//!                         │ narrow adapters
//!                         ▼
//! ┌──────────────────────────────────────────────────────┐
//! │  SqliteStores: events / forecasts / knowledge /      │
//! │  pairing memory / run + failure audit log            │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod accuracy;
pub mod db;
pub mod error;
pub mod knowledge;
pub mod learning;
pub mod monitor;
pub mod store;
pub mod types;
pub mod workflow;

// Core entry points
pub use db::init_db;
pub use monitor::{CompletionMonitor, ForceResult, MonitorConfig, MonitorStatus};
pub use workflow::ReconciliationWorkflow;

// Stores
pub use store::{
    EntityKnowledgeStore, ForecastStore, LearningSummary, OutcomeStore, PairingMemoryStore,
    RunLogStore, RunWindowStats, SqliteStores, Stores,
};

// Data model
pub use error::{StepName, WorkflowError};
pub use learning::{InsightClassifier, KeywordClassifier, PatternScope};
pub use types::*;
