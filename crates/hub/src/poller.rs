//! Background loops: feed polling, periodic backup sync, and bulk
//! history import. Loops log failures and keep running; nothing here
//! can take the process down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::db::Db;
use crate::remote::ThingSpeak;
use crate::sync::SyncEngine;

/// Poll the channel on a fixed cadence and store every reading,
/// fallbacks included, so the stored series has no holes.
pub async fn run_poll_loop(db: Db, remote: ThingSpeak, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        let fetched = remote.fetch_latest().await;
        let live = fetched.is_live();
        let reading = fetched.into_reading();

        match db.save_reading(&reading).await {
            Ok(outcome) => {
                if outcome.duplicate {
                    tracing::debug!(id = outcome.reading.id, "poll produced a duplicate reading");
                } else {
                    tracing::info!(
                        id = outcome.reading.id,
                        temperature = reading.temperature,
                        level = reading.level,
                        live,
                        "reading stored"
                    );
                }
            }
            Err(err) => tracing::error!(error = %err, "failed to store polled reading"),
        }
    }
}

/// Replicate to the backup store on a fixed cadence.
pub async fn run_sync_loop(engine: Arc<SyncEngine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        if let Err(err) = engine.sync().await {
            tracing::error!(error = %err, "backup sync failed");
        }
    }
}

/// Pull `days` of channel history into the primary store. Duplicate
/// suppression makes this safe to repeat; returns the number of rows
/// actually inserted.
pub async fn import_from_remote(db: &Db, remote: &ThingSpeak, days: u32) -> Result<u32> {
    let end = time::OffsetDateTime::now_utc();
    let start = end - time::Duration::days(i64::from(days));
    let readings = remote.fetch_range(start, end).await;
    let total = readings.len();
    let mut imported = 0u32;

    for reading in &readings {
        if !db.save_reading(reading).await?.duplicate {
            imported += 1;
        }
    }

    tracing::info!(days, fetched = total, imported, "history import finished");
    Ok(imported)
}

// ===========================================================================
// Tests
// ===========================================================================
