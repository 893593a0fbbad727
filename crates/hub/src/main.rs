mod analytics;
mod backup;
mod config;
mod db;
mod poller;
mod remote;
mod state;
mod sync;
mod web;

use anyhow::Result;
use std::{env, sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;

use backup::BackupDb;
use db::Db;
use remote::ThingSpeak;
use state::DeviceStateCache;
use sync::SyncEngine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url =
        env::var("PRIMARY_DB_URL").unwrap_or_else(|_| "sqlite:aquaponics.db?mode=rwc".to_string());
    let backup_url = env::var("BACKUP_DB_URL")
        .unwrap_or_else(|_| "sqlite:aquaponics_backup.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Stores ──────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    let backup_db = BackupDb::connect(&backup_url).await?;
    backup_db.migrate().await?;

    // ── Config file (remote channel + cadences + setpoint seed) ─────
    let cfg = config::load_or_default(&config_path)?;
    config::apply(&cfg, &db).await?;

    let remote = ThingSpeak::new(
        &cfg.remote.base_url,
        &cfg.remote.channel_id,
        &cfg.remote.read_api_key,
        &cfg.remote.write_api_key,
    );

    let cache = DeviceStateCache::new();
    let engine = Arc::new(SyncEngine::new(db.clone(), backup_db));

    tracing::info!(
        channel = %cfg.remote.channel_id,
        poll_secs = cfg.intervals.poll_secs,
        sync_secs = cfg.intervals.sync_secs,
        "hub starting"
    );

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        db: db.clone(),
        engine: Arc::clone(&engine),
        cache: cache.clone(),
        remote: remote.clone(),
    };
    tokio::spawn(async move {
        web::serve(web_state).await;
    });

    // ── Background loops ────────────────────────────────────────────
    tokio::spawn(poller::run_poll_loop(
        db.clone(),
        remote.clone(),
        Duration::from_secs(cfg.intervals.poll_secs),
    ));
    tokio::spawn(poller::run_sync_loop(
        Arc::clone(&engine),
        Duration::from_secs(cfg.intervals.sync_secs),
    ));
    tokio::spawn(state::run_consistency_loop(cache, remote));

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    engine.close().await;
    db.close().await;

    Ok(())
}
