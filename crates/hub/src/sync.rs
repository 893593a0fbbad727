//! Replication from the primary store to the backup store.
//!
//! The cursor is implicit: MAX(id) in the backup readings table. Every
//! run copies the primary rows past that id in one transaction, along
//! with their derived columns, critical alerts, and the daily rollups
//! for the affected days. A failed run rolls back completely and the
//! next run retries the same rows.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{Sqlite, Transaction};
use time::{Date, OffsetDateTime};

use crate::analytics;
use crate::backup::{day_bounds, day_key, BackupDb, DailyStat, SyncRecord};
use crate::db::{Db, Reading};

/// Upper bound on rows copied per run. A busy feed catches up over
/// successive runs instead of holding one giant transaction.
const SYNC_BATCH_SIZE: i64 = 1000;

const DISPLAY_TIME: &[time::format_description::BorrowedFormatItem<'static>] =
    time::macros::format_description!("[day]/[month]/[year] [hour]:[minute]:[second]");

pub struct SyncEngine {
    db: Db,
    backup: BackupDb,
    syncing: AtomicBool,
}

/// Summary for the backup status endpoint. Built best-effort: a broken
/// backup store yields zeroed fields, never an error.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub last_id: i64,
    pub last_backup: String,
    pub total_records: i64,
    pub pending_records: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    pub total_readings: i64,
    pub total_alerts: i64,
    pub critical_alerts: i64,
    pub daily_stats: Vec<DailyStat>,
    pub sync_history: Vec<SyncRecord>,
}

/// Clears the in-progress flag when a run ends, including on early
/// return through `?`.
struct SyncGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new(db: Db, backup: BackupDb) -> Self {
        Self {
            db,
            backup,
            syncing: AtomicBool::new(false),
        }
    }

    /// Copy all primary readings the backup store has not seen yet.
    /// Returns the number of rows copied; returns Ok(0) without doing
    /// anything when another run is already in progress.
    pub async fn sync(&self) -> Result<u32> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("backup sync already in progress, skipping");
            return Ok(0);
        }
        let _guard = SyncGuard { flag: &self.syncing };

        match self.copy_new_readings().await {
            Ok(count) => {
                if count > 0 {
                    let now = OffsetDateTime::now_utc();
                    if let Err(err) = self
                        .backup
                        .stamp_last_sync(&day_key(now), now.unix_timestamp())
                        .await
                    {
                        tracing::warn!(error = %err, "failed to stamp last sync timestamp");
                    }
                }
                if let Err(err) = self.backup.record_sync(true, count as i64, None).await {
                    tracing::warn!(error = %err, "failed to record sync history");
                }
                tracing::info!(count, "backup sync complete");
                Ok(count)
            }
            Err(err) => {
                let message = format!("{err:#}");
                if let Err(record_err) = self.backup.record_sync(false, 0, Some(&message)).await {
                    tracing::warn!(error = %record_err, "failed to record sync failure");
                }
                Err(err)
            }
        }
    }

    async fn copy_new_readings(&self) -> Result<u32> {
        let cursor = self.backup.max_reading_id().await?;
        let rows = self.db.readings_after(cursor, SYNC_BATCH_SIZE).await?;
        if rows.is_empty() {
            tracing::debug!(cursor, "backup store is up to date");
            return Ok(0);
        }

        // Trend seeds carry across batch boundaries.
        let mut prev_valid_temperature = self.backup.last_valid_temperature().await?;
        let mut prev_level = self.backup.last_level().await?;

        let mut tx = self
            .backup
            .pool()
            .begin()
            .await
            .context("failed to open backup transaction")?;

        let mut days: BTreeSet<Date> = BTreeSet::new();

        for r in &rows {
            let derived = analytics::derive(r, prev_valid_temperature, prev_level);

            sqlx::query(
                r#"
                INSERT INTO readings
                    (id, temperature, level, pump_status, heater_status, timestamp,
                     temperature_trend, level_trend, is_temp_critical, is_level_critical,
                     data_source, data_quality)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(r.id)
            .bind(r.temperature)
            .bind(r.level)
            .bind(r.pump_status)
            .bind(r.heater_status)
            .bind(r.timestamp)
            .bind(derived.temperature_trend)
            .bind(derived.level_trend)
            .bind(derived.is_temp_critical)
            .bind(derived.is_level_critical)
            .bind(analytics::DATA_SOURCE)
            .bind(derived.data_quality)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to copy reading {}", r.id))?;

            if derived.is_temp_critical {
                insert_alert(
                    &mut tx,
                    "temperature",
                    &format!("Water temperature out of safe range: {:.1}°C", r.temperature),
                    r,
                )
                .await?;
            }
            if derived.is_level_critical {
                insert_alert(
                    &mut tx,
                    "water_level",
                    &format!("Water level out of safe range: {:.1}%", r.level),
                    r,
                )
                .await?;
            }

            if !analytics::is_sensor_fault(r.temperature) {
                prev_valid_temperature = Some(r.temperature);
            }
            prev_level = Some(r.level);

            let day = OffsetDateTime::from_unix_timestamp(r.timestamp)
                .with_context(|| format!("reading {} has invalid timestamp", r.id))?
                .date();
            days.insert(day);
        }

        for day in days {
            rollup_day(&mut tx, day).await?;
        }

        tx.commit()
            .await
            .context("failed to commit backup batch")?;

        Ok(rows.len() as u32)
    }

    /// Rows waiting to be replicated.
    pub async fn pending_sync(&self) -> Result<i64> {
        let cursor = self.backup.max_reading_id().await?;
        self.db.count_readings_after(cursor).await
    }

    pub async fn last_backup_info(&self) -> BackupInfo {
        let last_id = self.backup.max_reading_id().await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to read backup cursor");
            0
        });
        let total_records = self.backup.total_readings().await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to read backup totals");
            0
        });
        let pending_records = self.pending_sync().await.unwrap_or(0);

        BackupInfo {
            last_id,
            last_backup: OffsetDateTime::now_utc()
                .format(&DISPLAY_TIME)
                .unwrap_or_default(),
            total_records,
            pending_records,
        }
    }

    pub async fn backup_stats(&self) -> BackupStats {
        let total_readings = self.backup.total_readings().await.unwrap_or(0);
        let (total_alerts, critical_alerts) = self.backup.alert_counts().await.unwrap_or((0, 0));
        let daily_stats = self.backup.daily_stats(7).await.unwrap_or_default();
        let sync_history = self.backup.sync_history(10).await.unwrap_or_default();

        BackupStats {
            total_readings,
            total_alerts,
            critical_alerts,
            daily_stats,
            sync_history,
        }
    }

    pub async fn close(&self) {
        self.backup.close().await;
    }
}

async fn insert_alert(
    tx: &mut Transaction<'_, Sqlite>,
    kind: &str,
    message: &str,
    reading: &Reading,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO alerts (type, severity, message, reading_id, created_at)
        VALUES (?, 'critical', ?, ?, ?)
        "#,
    )
    .bind(kind)
    .bind(message)
    .bind(reading.id)
    .bind(reading.timestamp)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to insert {kind} alert for reading {}", reading.id))?;
    Ok(())
}

/// Build the rollup for one calendar day from the rows now in the
/// transaction. Generated once: a day that already has stats keeps
/// them, so intraday numbers go stale until the next day's run. Fault
/// temperatures are excluded from the temperature aggregates but still
/// counted as readings. Active times assume the 5-minute feed cadence.
async fn rollup_day(tx: &mut Transaction<'_, Sqlite>, day: Date) -> Result<()> {
    let key = day_key(day.midnight().assume_utc());
    let (start, end) = day_bounds(day.midnight().assume_utc());

    // A sync-timestamp placeholder row (reading_count 0) does not
    // count as generated.
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT reading_count FROM daily_stats WHERE date = ?")
            .bind(&key)
            .fetch_optional(&mut **tx)
            .await
            .with_context(|| format!("failed to check daily stats for {key}"))?;
    if existing.unwrap_or(0) > 0 {
        return Ok(());
    }

    #[allow(clippy::type_complexity)]
    let (count, t_min, t_max, t_avg, l_min, l_max, l_avg, pump_on, heater_on): (
        i64,
        Option<f64>,
        Option<f64>,
        Option<f64>,
        Option<f64>,
        Option<f64>,
        Option<f64>,
        Option<i64>,
        Option<i64>,
    ) = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               MIN(CASE WHEN temperature > -100.0 THEN temperature END),
               MAX(CASE WHEN temperature > -100.0 THEN temperature END),
               AVG(CASE WHEN temperature > -100.0 THEN temperature END),
               MIN(level), MAX(level), AVG(level),
               SUM(pump_status), SUM(heater_status)
        FROM readings
        WHERE timestamp >= ? AND timestamp < ?
        "#,
    )
    .bind(start)
    .bind(end)
    .fetch_one(&mut **tx)
    .await
    .with_context(|| format!("failed to aggregate day {key}"))?;

    sqlx::query(
        r#"
        INSERT INTO daily_stats
            (date, min_temperature, max_temperature, avg_temperature,
             min_level, max_level, avg_level,
             pump_active_time, heater_active_time, reading_count, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(date) DO UPDATE SET
            min_temperature = excluded.min_temperature,
            max_temperature = excluded.max_temperature,
            avg_temperature = excluded.avg_temperature,
            min_level = excluded.min_level,
            max_level = excluded.max_level,
            avg_level = excluded.avg_level,
            pump_active_time = excluded.pump_active_time,
            heater_active_time = excluded.heater_active_time,
            reading_count = excluded.reading_count
        "#,
    )
    .bind(&key)
    .bind(t_min.unwrap_or(0.0))
    .bind(t_max.unwrap_or(0.0))
    .bind(t_avg.unwrap_or(0.0))
    .bind(l_min.unwrap_or(0.0))
    .bind(l_max.unwrap_or(0.0))
    .bind(l_avg.unwrap_or(0.0))
    .bind(pump_on.unwrap_or(0) * 5)
    .bind(heater_on.unwrap_or(0) * 5)
    .bind(count)
    .bind(OffsetDateTime::now_utc().unix_timestamp())
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to upsert daily stats for {key}"))?;

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
