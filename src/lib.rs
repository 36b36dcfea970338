//! FormProbe -- scheduler and runner for automated browser form tests.
//!
//! This crate provides the schedule lifecycle (cron derivation, timer rule
//! linkage, run accounting), the WebDriver-backed run executor, run-record
//! storage with screenshot evidence, analytics aggregation, and the JSON API
//! the dashboard consumes.

pub mod analysis;
pub mod api;
pub mod config;
pub mod evidence;
pub mod runner;
pub mod schedule;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use config::Config;

/// Wire up shared application state from a config and an open pool.
pub fn build_state(cfg: &Config, pool: storage::Pool) -> Result<api::state::AppState> {
    let shots = evidence::ScreenshotStore::new(
        cfg.screenshot_dir.clone(),
        cfg.url_signing_key.as_deref(),
        cfg.signed_url_ttl_secs,
    )?;
    let runs = runner::RunStore::new(pool.clone());
    let runner = runner::TestRunner::new(
        runs.clone(),
        shots.clone(),
        cfg.webdriver_url.clone(),
        Duration::from_secs(cfg.run_deadline_secs),
    );
    let rules = Arc::new(schedule::timer::LocalTimerRules::new(pool.clone()));
    let schedules = schedule::ScheduleManager::new(pool, rules, cfg.completed_counts_as);

    Ok(api::state::AppState {
        schedules,
        runs,
        runner,
        shots,
    })
}

/// Start the daemon: API server plus the schedule sweep loop.
pub async fn serve(cfg: Config) -> Result<()> {
    tracing::info!(db_path = %cfg.db_path, "initializing database");
    let pool = storage::open_pool(&cfg.db_path)?;

    let state = build_state(&cfg, pool)?;

    let sweep_manager = state.schedules.clone();
    let sweep_runner = state.runner.clone();
    let interval = Duration::from_secs(cfg.sweep_interval_secs);
    tokio::spawn(async move {
        schedule::sweep::run_sweep_loop(sweep_manager, sweep_runner, interval).await;
    });

    let addr: std::net::SocketAddr = cfg.bind.parse()?;
    let app = api::router(state, cfg.dev_errors);

    tracing::info!(%addr, "formprobe listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
