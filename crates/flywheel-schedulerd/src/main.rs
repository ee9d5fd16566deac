use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rusqlite::Connection;
use tracing::{info, warn};

use flywheel_core::config::FlywheelConfig;
use flywheel_scheduler::{db, JobRegistry, NewTask, SchedulerEngine, TaskStore};

mod jobs;

/// Standalone task-queue scheduler daemon.
#[derive(Debug, Parser)]
#[command(name = "flywheel-schedulerd", about = "Durable task-queue scheduler daemon")]
struct Args {
    /// Path to flywheel.toml (defaults to ~/.flywheel/flywheel.toml).
    #[arg(long)]
    config: Option<String>,

    /// Run a single poll-dispatch cycle and exit instead of looping.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flywheel_scheduler=info,flywheel_schedulerd=info".into()),
        )
        .init();

    let args = Args::parse();

    // config resolution: --config flag > FLYWHEEL_CONFIG env > default path
    let config_path = args.config.or_else(|| std::env::var("FLYWHEEL_CONFIG").ok());
    let config = FlywheelConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        FlywheelConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let conn =
        Connection::open(db_path).with_context(|| format!("open database at {db_path}"))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    db::init_db(&conn)?;

    let store = TaskStore::new(conn);
    let registry = Arc::new(JobRegistry::new());
    jobs::register_builtin(&registry);
    info!(jobs = ?registry.names(), "registered jobs");

    seed_heartbeat(&store)?;

    let engine = SchedulerEngine::new(store, registry, config.scheduler.clone());

    if args.once {
        let dispatched = engine.run_pending().await;
        info!(dispatched, "single cycle complete");
        return Ok(());
    }

    engine.start();
    info!("scheduler running — press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    engine.stop().await;
    Ok(())
}

/// Queue the first heartbeat run unless one is already queued or running.
fn seed_heartbeat(store: &TaskStore) -> anyhow::Result<()> {
    if store.has_active(jobs::HEARTBEAT_JOB)? {
        info!("heartbeat task already queued");
        return Ok(());
    }
    let first_run = chrono::Utc::now() + chrono::Duration::minutes(jobs::HEARTBEAT_INTERVAL_MINUTES);
    let task = store.enqueue(NewTask::new("periodic heartbeat", jobs::HEARTBEAT_JOB, first_run))?;
    info!(task_id = task.id, first_run = %first_run, "heartbeat task queued");
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
}
