//! taskrelay daemon: the ingestion poller and the reminder/summary scheduler,
//! running as two independently-clocked loops over the same store.

use std::sync::Arc;

use taskrelay::config::load_config;
use taskrelay::db::TaskDb;
use taskrelay::error::PipelineError;
use taskrelay::state::AppState;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("taskrelay failed to start: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), PipelineError> {
    let config = load_config()?;

    // Open once at startup so schema problems surface before any loop runs.
    let db = TaskDb::open()?;
    let connections = db
        .get_active_connections()
        .map_err(PipelineError::Storage)?;
    log::info!(
        "taskrelay starting: {} active connection(s)",
        connections.len()
    );
    drop(db);

    let state = Arc::new(AppState::new(config));

    // Both loops run on this task: SQLite handles are opened per tick and
    // never cross a thread boundary.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
        _ = taskrelay::poller::run_poller(Arc::clone(&state)) => {
            log::error!("Poller loop exited unexpectedly");
        }
        _ = taskrelay::scheduler::run_scheduler(Arc::clone(&state)) => {
            log::error!("Scheduler loop exited unexpectedly");
        }
    }

    Ok(())
}
