//! reckon operator CLI
//!
//! Forecast reconciliation engine - runs the completion monitor as a
//! background worker, or drives one-shot operator recovery commands
//! against the same database.
//!
//! Run with: cargo run -- --monitor

use anyhow::Result;
use reckon::{
    db, CompletionMonitor, MonitorConfig, ReconciliationWorkflow, SqliteStores,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--monitor" => {
                return run_monitor(&args[2..]).await;
            }
            "--force" => {
                let event_id = args.get(2).map(|s| s.as_str()).unwrap_or("");
                if event_id.is_empty() {
                    println!("Usage: reckon --force <event-id>");
                    return Ok(());
                }
                return run_force(event_id);
            }
            "--retry-failed" => {
                return run_retry_failed();
            }
            "--status" => {
                return run_status();
            }
            "--stats" => {
                return run_stats();
            }
            "--decay-sweep" => {
                return run_decay_sweep();
            }
            "--seed-demo" => {
                return run_seed_demo();
            }
            _ => {}
        }
    }

    print_usage();
    Ok(())
}

fn print_usage() {
    println!("reckon - forecast reconciliation engine\n");
    println!("USAGE:");
    println!("  reckon --monitor [--poll=SECS] [--batch=N] [--delay=SECS] [--retries=N]");
    println!("  reckon --force <event-id>     run the workflow once for one event");
    println!("  reckon --retry-failed         reschedule failed (not parked) events");
    println!("  reckon --status               monitor bookkeeping + last-24h stats");
    println!("  reckon --stats                learning summary across all experts");
    println!("  reckon --decay-sweep          run the memory decay sweep standalone");
    println!("  reckon --seed-demo            insert a demo event and forecasts");
    println!();
    println!("Database path: $RECKON_DB or the platform data dir.");
}

fn db_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("RECKON_DB") {
        return Ok(PathBuf::from(path));
    }
    let dir = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("no data directory available; set RECKON_DB"))?
        .join("reckon");
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join("reckon.db"))
}

fn open_stores() -> Result<Arc<SqliteStores>> {
    let conn = db::init_db(&db_path()?)?;
    Ok(Arc::new(SqliteStores::new(conn)))
}

fn parse_flag(args: &[String], prefix: &str) -> Option<u64> {
    args.iter()
        .find(|a| a.starts_with(prefix))
        .and_then(|a| a.strip_prefix(prefix).and_then(|v| v.parse().ok()))
}

async fn run_monitor(args: &[String]) -> Result<()> {
    let mut config = MonitorConfig::default();
    if let Some(secs) = parse_flag(args, "--poll=") {
        config.poll_interval = Duration::from_secs(secs);
    }
    if let Some(n) = parse_flag(args, "--batch=") {
        config.batch_size = n as usize;
    }
    if let Some(secs) = parse_flag(args, "--delay=") {
        config.batch_delay = Duration::from_secs(secs);
    }
    if let Some(n) = parse_flag(args, "--retries=") {
        config.retry_ceiling = n as u32;
    }

    let stores = open_stores()?;
    let monitor = CompletionMonitor::new(stores, config);

    // Ctrl-C requests a stop; the loop exits at the next iteration
    // boundary, letting any dispatched batch finish.
    let stopper = monitor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nStop requested; finishing current batch...");
            stopper.stop();
        }
    });

    monitor.run().await;
    Ok(())
}

fn run_force(event_id: &str) -> Result<()> {
    let stores = open_stores()?;
    let monitor = CompletionMonitor::new(stores, MonitorConfig::default());

    let result = monitor.force_process(event_id);
    println!(
        "{} {}",
        if result.success { "✅" } else { "❌" },
        result.message
    );
    Ok(())
}

fn run_retry_failed() -> Result<()> {
    let stores = open_stores()?;
    let monitor = CompletionMonitor::new(stores, MonitorConfig::default());

    let attempted = monitor.retry_failed_events();
    println!("Rescheduled {} failed events for the next poll.", attempted);
    Ok(())
}

fn run_status() -> Result<()> {
    let stores = open_stores()?;
    let monitor = CompletionMonitor::new(stores, MonitorConfig::default());
    let status = monitor.status();

    println!("\n┌─────────────────────────────────────────────┐");
    println!("│ 🔄 RECONCILIATION MONITOR STATUS            │");
    println!("└─────────────────────────────────────────────┘\n");

    println!("Running: {}", status.running);
    println!("In flight: {}", status.in_flight);
    println!();
    println!("LAST 24H:");
    println!("   Processed: {}", status.last_24h.processed);
    println!("   Failed attempts: {}", status.last_24h.failed);
    println!(
        "   Avg workflow duration: {:.0} ms",
        status.last_24h.avg_duration_ms
    );

    if !status.failed_counts.is_empty() {
        println!("\nFAILING EVENTS:");
        for (id, count) in &status.failed_counts {
            println!("   {} ({} failures)", id, count);
        }
    }
    if !status.parked.is_empty() {
        println!("\n⚠️  PARKED (need --force):");
        for id in &status.parked {
            println!("   {}", id);
        }
    }

    Ok(())
}

fn run_stats() -> Result<()> {
    let stores = open_stores()?;
    let summary = stores.summary()?;

    println!("\n┌─────────────────────────────────────────────┐");
    println!("│ 📈 LEARNING SUMMARY                         │");
    println!("└─────────────────────────────────────────────┘\n");

    if summary.total_runs == 0 {
        println!("No workflow runs recorded yet.");
        println!("Start the monitor (reckon --monitor) or force an event.");
        return Ok(());
    }

    println!("WORKFLOW:");
    println!("   Runs: {}", summary.total_runs);
    println!(
        "   Successful: {} ({:.1}%)",
        summary.successful_runs,
        summary.success_rate * 100.0
    );
    println!("   Failed attempts: {}", summary.total_failures);
    println!("   Events reconciled: {}", summary.events_reconciled);
    println!();
    println!("KNOWLEDGE:");
    println!("   Experts tracked: {}", summary.experts_tracked);
    println!("   Patterns tracked: {}", summary.patterns_tracked);

    Ok(())
}

fn run_decay_sweep() -> Result<()> {
    let stores = open_stores()?;
    let workflow = ReconciliationWorkflow::new(stores);

    let pruned = workflow.decay_sweep(&[])?;
    println!("Decay sweep complete; pruned {} patterns.", pruned);
    Ok(())
}

fn run_seed_demo() -> Result<()> {
    use chrono::Utc;
    use reckon::{CategoryValue, EventOutcome, EventStatus, ExpertForecast};
    use std::collections::HashMap;

    let stores = open_stores()?;
    let event_id = format!("demo-{}", Utc::now().timestamp());

    stores.insert_event(&EventOutcome {
        id: event_id.clone(),
        home_entity: "lakers".into(),
        away_entity: "celtics".into(),
        home_score: Some(112.0),
        away_score: Some(104.0),
        event_date: Utc::now(),
        status: EventStatus::Final,
        final_stats: serde_json::json!({"attendance": 18997}),
        reconciled: false,
        reconciled_at: None,
    })?;

    let mut predictions = HashMap::new();
    predictions.insert(
        "winner".to_string(),
        CategoryValue::Categorical("lakers".into()),
    );
    predictions.insert("margin".to_string(), CategoryValue::Numeric(6.0));
    predictions.insert("total".to_string(), CategoryValue::Numeric(220.0));

    let mut confidence = HashMap::new();
    confidence.insert("winner".to_string(), 0.75);
    confidence.insert("margin".to_string(), 0.6);
    confidence.insert("total".to_string(), 0.55);

    stores.insert_forecast(&ExpertForecast {
        id: format!("{}-f1", event_id),
        expert_id: "demo-expert".into(),
        event_id: event_id.clone(),
        predictions,
        confidence,
        reasoning_factors: vec![
            "home-field advantage".into(),
            "head-to-head record".into(),
        ],
    })?;

    println!("Seeded demo event '{}' with one forecast.", event_id);
    println!("Reconcile it with: reckon --force {}", event_id);
    Ok(())
}
