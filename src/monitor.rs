//! Completion monitor: discovery, batching, retry parking
//!
//! A single long-lived poll loop discovers completed-but-unreconciled
//! events, splits them into bounded batches, and dispatches each batch
//! member concurrently through the workflow. The in-flight set is the
//! only duplicate-dispatch guard and is purely in-process; running two
//! monitor instances against one database needs a claim-lease scheme
//! in the outcome store instead.
//!
//! An event that keeps failing is parked after `retry_ceiling`
//! consecutive failures: no more automatic attempts until an operator
//! forces it. One permanently broken input must not eat poll cycles
//! forever.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::store::{RunWindowStats, Stores};
use crate::workflow::ReconciliationWorkflow;

/// Monitor tunables.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sleep between discovery polls.
    pub poll_interval: Duration,
    /// Rate-limit delay between batches within one poll.
    pub batch_delay: Duration,
    /// Maximum events dispatched concurrently.
    pub batch_size: usize,
    /// Consecutive failures before an event is parked.
    pub retry_ceiling: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_delay: Duration::from_secs(2),
            batch_size: 5,
            retry_ceiling: 3,
        }
    }
}

/// In-process dispatch bookkeeping: which events are being worked on
/// right now, and how often each has failed. Owned state passed by
/// reference into every monitor operation, never a global.
#[derive(Debug, Default)]
pub struct SchedulerState {
    in_flight: HashSet<String>,
    failures: HashMap<String, u32>,
}

impl SchedulerState {
    /// Claim an event for dispatch. Returns false if already in flight.
    fn try_claim(&mut self, event_id: &str) -> bool {
        self.in_flight.insert(event_id.to_string())
    }

    fn release(&mut self, event_id: &str) {
        self.in_flight.remove(event_id);
    }

    fn record_failure(&mut self, event_id: &str) -> u32 {
        let count = self.failures.entry(event_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn clear(&mut self, event_id: &str) {
        self.in_flight.remove(event_id);
        self.failures.remove(event_id);
    }

    /// Reset the failure counter without touching the in-flight claim.
    fn clear_failures(&mut self, event_id: &str) {
        self.failures.remove(event_id);
    }

    fn eligible(&self, event_id: &str, retry_ceiling: u32) -> bool {
        !self.in_flight.contains(event_id)
            && self.failures.get(event_id).copied().unwrap_or(0) < retry_ceiling
    }

    fn parked(&self, retry_ceiling: u32) -> Vec<String> {
        let mut ids: Vec<String> = self
            .failures
            .iter()
            .filter(|(_, count)| **count >= retry_ceiling)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Result of an operator-forced run.
#[derive(Debug, Clone)]
pub struct ForceResult {
    pub success: bool,
    pub message: String,
}

/// Operator-facing snapshot of the monitor.
#[derive(Debug, Clone)]
pub struct MonitorStatus {
    pub running: bool,
    pub in_flight: usize,
    pub failed_counts: HashMap<String, u32>,
    pub parked: Vec<String>,
    pub last_24h: RunWindowStats,
}

pub struct CompletionMonitor<S> {
    workflow: ReconciliationWorkflow<S>,
    stores: Arc<S>,
    config: MonitorConfig,
    state: Arc<Mutex<SchedulerState>>,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl<S> Clone for CompletionMonitor<S> {
    fn clone(&self) -> Self {
        Self {
            workflow: self.workflow.clone(),
            stores: Arc::clone(&self.stores),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            running: Arc::clone(&self.running),
            stop: Arc::clone(&self.stop),
        }
    }
}

impl<S: Stores + 'static> CompletionMonitor<S> {
    pub fn new(stores: Arc<S>, config: MonitorConfig) -> Self {
        Self {
            workflow: ReconciliationWorkflow::new(Arc::clone(&stores)),
            stores,
            config,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            running: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        // Recover the state even if a dispatch task panicked while
        // holding the lock.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Signal the loop to exit. Checked only between poll iterations;
    /// a batch already dispatched runs to completion.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// The unbounded poll loop.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            retry_ceiling = self.config.retry_ceiling,
            "completion monitor started"
        );

        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            match self.poll_once().await {
                Ok(0) => {}
                Ok(dispatched) => debug!(dispatched, "poll iteration dispatched events"),
                Err(err) => error!(error = %err, "discovery poll failed"),
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        self.running.store(false, Ordering::SeqCst);
        info!("completion monitor stopped");
    }

    /// One discovery + dispatch cycle. Returns how many events were
    /// dispatched.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let candidates = self.stores.list_completed_unreconciled()?;
        let eligible: Vec<String> = {
            let state = self.state();
            candidates
                .into_iter()
                .filter(|e| state.eligible(&e.id, self.config.retry_ceiling))
                .map(|e| e.id)
                .collect()
        };

        if eligible.is_empty() {
            return Ok(0);
        }
        info!(count = eligible.len(), "discovered completed events");

        let batches: Vec<Vec<String>> = eligible
            .chunks(self.config.batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
        let total_batches = batches.len();

        let mut dispatched = 0;
        for (i, batch) in batches.into_iter().enumerate() {
            dispatched += self.dispatch_batch(batch).await;
            if i + 1 < total_batches {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        Ok(dispatched)
    }

    /// Dispatch every batch member concurrently, bounded to the batch
    /// size in flight at once, and wait for all of them.
    async fn dispatch_batch(&self, batch: Vec<String>) -> usize {
        let mut handles = Vec::with_capacity(batch.len());

        for event_id in batch {
            if !self.state().try_claim(&event_id) {
                continue;
            }
            let workflow = self.workflow.clone();
            let id = event_id.clone();
            let handle = tokio::task::spawn_blocking(move || workflow.run(&id));
            handles.push((event_id, handle));
        }

        let mut dispatched = 0;
        for (event_id, handle) in handles {
            dispatched += 1;
            match handle.await {
                Ok(Ok(_run)) => {
                    // The event's own reconciled flag keeps it out of
                    // future discovery; just drop the claim.
                    self.state().release(&event_id);
                }
                Ok(Err(err)) => {
                    let count = self.record_failure_and_release(&event_id);
                    warn!(event_id = %event_id, failures = count, error = %err, "workflow failed");
                }
                Err(join_err) => {
                    let count = self.record_failure_and_release(&event_id);
                    error!(event_id = %event_id, failures = count, error = %join_err, "workflow task panicked");
                }
            }
        }
        dispatched
    }

    fn record_failure_and_release(&self, event_id: &str) -> u32 {
        let mut state = self.state();
        let count = state.record_failure(event_id);
        state.release(event_id);
        if count >= self.config.retry_ceiling {
            warn!(
                event_id,
                failures = count,
                "event parked; use force-process to retry"
            );
        }
        count
    }

    /// Operator recovery: clear the failure counter (un-parking the
    /// event) and run the workflow once synchronously. An event a
    /// dispatch task is still working on is refused, not run twice.
    pub fn force_process(&self, event_id: &str) -> ForceResult {
        {
            let mut state = self.state();
            state.clear_failures(event_id);
            if !state.try_claim(event_id) {
                return ForceResult {
                    success: false,
                    message: format!("event {} is already in flight", event_id),
                };
            }
        }

        let result = self.workflow.run(event_id);
        match result {
            Ok(run) => {
                self.state().release(event_id);
                ForceResult {
                    success: true,
                    message: format!(
                        "event {} reconciled in {} ms",
                        event_id, run.duration_ms
                    ),
                }
            }
            Err(err) => {
                self.record_failure_and_release(event_id);
                ForceResult {
                    success: false,
                    message: format!("event {} failed: {}", event_id, err),
                }
            }
        }
    }

    /// Reschedule every failed-but-not-parked event by clearing its
    /// bookkeeping so the next poll picks it up. Returns how many were
    /// scheduled.
    pub fn retry_failed_events(&self) -> usize {
        let mut state = self.state();
        let retryable: Vec<String> = state
            .failures
            .iter()
            .filter(|(_, count)| **count < self.config.retry_ceiling)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &retryable {
            state.clear(id);
        }
        if !retryable.is_empty() {
            info!(count = retryable.len(), "rescheduled failed events");
        }
        retryable.len()
    }

    pub fn status(&self) -> MonitorStatus {
        let (in_flight, failed_counts, parked) = {
            let state = self.state();
            (
                state.in_flight.len(),
                state.failures.clone(),
                state.parked(self.config.retry_ceiling),
            )
        };

        let last_24h = self
            .stores
            .window_stats(Utc::now() - chrono::Duration::hours(24))
            .unwrap_or_default();

        MonitorStatus {
            running: self.running.load(Ordering::SeqCst),
            in_flight,
            failed_counts,
            parked,
            last_24h,
        }
    }
}
