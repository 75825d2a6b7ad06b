mod calendar;
mod config;
mod db;
mod error;
mod hardware;
mod moisture;
mod scheduler;
mod state;
mod watering;
mod web;

use anyhow::Result;
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use scheduler::{AutoMode, StopHandle};
use state::SystemState;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed crops + sensors) ──────────────────────────
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;
    let offset = cfg.clock_offset()?;

    let sensors = db.load_sensors().await?;
    if sensors.is_empty() {
        warn!("no sensors configured in the database");
    }
    let unassigned = sensors.iter().filter(|s| s.crop.is_none()).count();
    info!(
        crops = db.load_crops().await?.len(),
        sensors = sensors.len(),
        unassigned,
        "db ready"
    );

    // ── Shared state (ephemeral, for the status endpoint) ───────────
    let shared = SystemState::shared();
    shared
        .write()
        .await
        .record_system("controller started".to_string());

    // ── Background loops ────────────────────────────────────────────
    let probe = hardware::select(cfg.hardware.probe, cfg.hardware.simulation_seed);
    let auto = AutoMode::new(db.clone(), shared.clone(), cfg.auto_interval());
    if cfg.controller.auto_mode_on_start {
        auto.set_enabled(true).await;
    }

    let stop = StopHandle::new();
    let schedule_loop = scheduler::spawn_schedule_loop(
        db.clone(),
        shared.clone(),
        cfg.schedule_interval(),
        offset,
        stop.clone(),
    );

    // ── Web server ──────────────────────────────────────────────────
    let app = AppState {
        db,
        probe,
        shared,
        auto: auto.clone(),
    };
    let served = web::serve(app, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    })
    .await;

    // ── Shutdown ────────────────────────────────────────────────────
    auto.set_enabled(false).await;
    stop.stop();
    if let Err(e) = schedule_loop.await {
        warn!("schedule loop ended abnormally: {e}");
    }
    info!("controller stopped");

    served
}
