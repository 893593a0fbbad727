//! Backup store access. Holds an id-prefix mirror of the primary
//! readings table plus the analytics tables (alerts, daily_stats) and
//! sync bookkeeping. All batch writes go through a transaction owned
//! by the sync engine; this module provides the connection, the
//! versioned migrations, and the read-side queries.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct BackupDb {
    pool: Pool<Sqlite>,
}

/// A replicated reading with its derived columns.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BackupReading {
    pub id: i64,
    pub temperature: f64,
    pub level: f64,
    pub pump_status: bool,
    pub heater_status: bool,
    pub timestamp: i64,
    pub temperature_trend: f64,
    pub level_trend: f64,
    pub is_temp_critical: bool,
    pub is_level_critical: bool,
    pub data_source: String,
    pub data_quality: f64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: String,
    pub message: String,
    pub reading_id: i64,
    pub created_at: i64,
    pub is_acknowledged: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DailyStat {
    pub date: String,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub avg_temperature: f64,
    pub min_level: f64,
    pub max_level: f64,
    pub avg_level: f64,
    pub pump_active_time: i64,
    pub heater_active_time: i64,
    pub reading_count: i64,
    pub last_sync_timestamp: Option<i64>,
}

/// One completed or failed replication run.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub success: bool,
    pub timestamp: i64,
    pub record_count: i64,
    pub error: Option<String>,
}

/// UTC calendar-day key, e.g. "2026-08-30".
pub fn day_key(at: OffsetDateTime) -> String {
    format!("{:04}-{:02}-{:02}", at.year(), at.month() as u8, at.day())
}

/// Unix-second bounds [start, end) of the calendar day containing `at`.
pub fn day_bounds(at: OffsetDateTime) -> (i64, i64) {
    let start = at.date().midnight().assume_utc().unix_timestamp();
    (start, start + 86_400)
}

impl BackupDb {
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database exists per-connection, so the pool
        // must not open a second one.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to backup db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs the backup-store migrations from ./migrations/backup, in
    /// version order.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/backup")
            .run(&self.pool)
            .await
            .context("failed to run backup migrations")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ----------------------------
    // Sync cursor + trend seeds
    // ----------------------------

    /// The replication cursor: highest reading id already present, or
    /// 0 for an empty store. Derived, never stored separately, so a
    /// rolled-back batch cannot desync it.
    pub async fn max_reading_id(&self) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM readings")
            .fetch_one(&self.pool)
            .await
            .context("max_reading_id failed")?;
        Ok(max.unwrap_or(0))
    }

    /// Temperature of the most recent non-fault reading, used to seed
    /// trend computation for the next batch.
    pub async fn last_valid_temperature(&self) -> Result<Option<f64>> {
        sqlx::query_scalar(
            "SELECT temperature FROM readings WHERE temperature > -100.0 ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("last_valid_temperature failed")
    }

    pub async fn last_level(&self) -> Result<Option<f64>> {
        sqlx::query_scalar("SELECT level FROM readings ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("last_level failed")
    }

    // ----------------------------
    // Read-side summaries
    // ----------------------------

    pub async fn total_readings(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM readings")
            .fetch_one(&self.pool)
            .await
            .context("total_readings failed")
    }

    pub async fn readings(&self) -> Result<Vec<BackupReading>> {
        sqlx::query_as(
            r#"
            SELECT id, temperature, level, pump_status, heater_status, timestamp,
                   temperature_trend, level_trend, is_temp_critical, is_level_critical,
                   data_source, data_quality
            FROM readings
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("readings failed")
    }

    pub async fn alerts(&self) -> Result<Vec<Alert>> {
        sqlx::query_as(
            r#"
            SELECT id, type, severity, message, reading_id, created_at, is_acknowledged
            FROM alerts
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("alerts failed")
    }

    /// (total, critical) alert counts.
    pub async fn alert_counts(&self) -> Result<(i64, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alerts")
            .fetch_one(&self.pool)
            .await
            .context("alert count failed")?;
        let critical: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM alerts WHERE severity = 'critical'")
                .fetch_one(&self.pool)
                .await
                .context("critical alert count failed")?;
        Ok((total, critical))
    }

    /// Most recent daily rollups, newest first.
    pub async fn daily_stats(&self, limit: i64) -> Result<Vec<DailyStat>> {
        sqlx::query_as(
            r#"
            SELECT date, min_temperature, max_temperature, avg_temperature,
                   min_level, max_level, avg_level,
                   pump_active_time, heater_active_time, reading_count,
                   last_sync_timestamp
            FROM daily_stats
            ORDER BY date DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("daily_stats failed")
    }

    pub async fn daily_stat_for(&self, date: &str) -> Result<Option<DailyStat>> {
        sqlx::query_as(
            r#"
            SELECT date, min_temperature, max_temperature, avg_temperature,
                   min_level, max_level, avg_level,
                   pump_active_time, heater_active_time, reading_count,
                   last_sync_timestamp
            FROM daily_stats
            WHERE date = ?
            "#,
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .context("daily_stat_for failed")
    }

    // ----------------------------
    // Sync bookkeeping
    // ----------------------------

    /// Stamp the replication timestamp on today's rollup row, creating
    /// a placeholder row when the day has no stats yet.
    pub async fn stamp_last_sync(&self, date: &str, at: i64) -> Result<()> {
        let updated = sqlx::query("UPDATE daily_stats SET last_sync_timestamp = ? WHERE date = ?")
            .bind(at)
            .bind(date)
            .execute(&self.pool)
            .await
            .context("stamp_last_sync failed")?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO daily_stats (date, last_sync_timestamp, created_at) VALUES (?, ?, ?)",
            )
            .bind(date)
            .bind(at)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("stamp_last_sync insert failed")?;
        }
        Ok(())
    }

    pub async fn record_sync(&self, success: bool, record_count: i64, error: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_history (success, timestamp, record_count, error) VALUES (?, ?, ?, ?)",
        )
        .bind(success)
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .bind(record_count)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("record_sync failed")?;
        Ok(())
    }

    pub async fn sync_history(&self, limit: i64) -> Result<Vec<SyncRecord>> {
        sqlx::query_as(
            r#"
            SELECT success, timestamp, record_count, error
            FROM sync_history
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("sync_history failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
