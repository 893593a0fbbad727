use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

/// Readings arriving within this window of an existing row are
/// candidate re-deliveries.
const DUPLICATE_WINDOW_SECS: i64 = 5;

/// Sensor-value tolerance for duplicate detection.
const DUPLICATE_TOLERANCE: f64 = 0.1;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub id: i64,
    pub temperature: f64,
    pub level: f64,
    pub pump_status: bool,
    pub heater_status: bool,
    pub timestamp: i64,
}

/// A reading as it arrives from the remote feed, before the primary
/// store has assigned it an id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReading {
    pub temperature: f64,
    pub level: f64,
    pub pump_status: bool,
    pub heater_status: bool,
    pub timestamp: i64,
}

/// Result of `save_reading`: the stored row, plus whether the input
/// was suppressed as a re-delivery of that row.
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub reading: Reading,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Setpoints {
    pub temp_min: f64,
    pub temp_max: f64,
    pub level_min: f64,
    pub level_max: f64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetpointsUpdate {
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
    pub level_min: Option<f64>,
    pub level_max: Option<f64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub system_name: String,
    pub update_interval: i64,
    pub data_retention: i64,
    pub email_alerts: bool,
    pub push_alerts: bool,
    pub alert_email: Option<String>,
    pub temp_critical_min: f64,
    pub temp_warning_min: f64,
    pub temp_warning_max: f64,
    pub temp_critical_max: f64,
    pub level_critical_min: f64,
    pub level_warning_min: f64,
    pub level_warning_max: f64,
    pub level_critical_max: f64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub system_name: Option<String>,
    pub update_interval: Option<i64>,
    pub data_retention: Option<i64>,
    pub email_alerts: Option<bool>,
    pub push_alerts: Option<bool>,
    pub alert_email: Option<String>,
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl Db {
    /// db_url examples:
    /// - "sqlite:aquaponics.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
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
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs the primary-store migrations from ./migrations/primary.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/primary")
            .run(&self.pool)
            .await
            .context("failed to run primary migrations")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ----------------------------
    // Readings
    // ----------------------------

    /// Insert a reading, suppressing near-identical re-deliveries: a
    /// reading within 5 seconds of an existing row with the same
    /// actuator states and sensor values within 0.1 returns the
    /// existing row instead of inserting a new one.
    pub async fn save_reading(&self, r: &NewReading) -> Result<SaveOutcome> {
        let min_ts = r.timestamp - DUPLICATE_WINDOW_SECS;
        let max_ts = r.timestamp + DUPLICATE_WINDOW_SECS;

        let nearby: Vec<Reading> = sqlx::query_as(
            r#"
            SELECT id, temperature, level, pump_status, heater_status, timestamp
            FROM readings
            WHERE timestamp BETWEEN ? AND ?
            ORDER BY id DESC
            LIMIT 10
            "#,
        )
        .bind(min_ts)
        .bind(max_ts)
        .fetch_all(&self.pool)
        .await
        .context("duplicate lookup failed")?;

        if let Some(existing) = nearby.into_iter().find(|e| {
            e.pump_status == r.pump_status
                && e.heater_status == r.heater_status
                && (e.temperature - r.temperature).abs() < DUPLICATE_TOLERANCE
                && (e.level - r.level).abs() < DUPLICATE_TOLERANCE
        }) {
            tracing::debug!(id = existing.id, "similar recent reading, skipping insert");
            return Ok(SaveOutcome {
                reading: existing,
                duplicate: true,
            });
        }

        let result = sqlx::query(
            r#"
            INSERT INTO readings (temperature, level, pump_status, heater_status, timestamp)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.temperature)
        .bind(r.level)
        .bind(r.pump_status)
        .bind(r.heater_status)
        .bind(r.timestamp)
        .execute(&self.pool)
        .await
        .context("save_reading failed")?;

        Ok(SaveOutcome {
            reading: Reading {
                id: result.last_insert_rowid(),
                temperature: r.temperature,
                level: r.level,
                pump_status: r.pump_status,
                heater_status: r.heater_status,
                timestamp: r.timestamp,
            },
            duplicate: false,
        })
    }

    /// Newest readings first.
    pub async fn latest_readings(&self, limit: i64) -> Result<Vec<Reading>> {
        sqlx::query_as(
            r#"
            SELECT id, temperature, level, pump_status, heater_status, timestamp
            FROM readings
            ORDER BY timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("latest_readings failed")
    }

    pub async fn latest_reading(&self) -> Result<Option<Reading>> {
        sqlx::query_as(
            r#"
            SELECT id, temperature, level, pump_status, heater_status, timestamp
            FROM readings
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("latest_reading failed")
    }

    /// Rows strictly after `id`, ascending. The backup sync reads its
    /// batches through this.
    pub async fn readings_after(&self, id: i64, limit: i64) -> Result<Vec<Reading>> {
        sqlx::query_as(
            r#"
            SELECT id, temperature, level, pump_status, heater_status, timestamp
            FROM readings
            WHERE id > ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("readings_after failed")
    }

    /// How many rows exist past `id`. Drives the pending-sync count
    /// without materializing the rows.
    pub async fn count_readings_after(&self, id: i64) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM readings WHERE id > ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .context("count_readings_after failed")
    }

    pub async fn readings_by_range(
        &self,
        start_ts: i64,
        end_ts: i64,
        max_results: i64,
    ) -> Result<Vec<Reading>> {
        sqlx::query_as(
            r#"
            SELECT id, temperature, level, pump_status, heater_status, timestamp
            FROM readings
            WHERE timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC
            LIMIT ?
            "#,
        )
        .bind(start_ts)
        .bind(end_ts)
        .bind(max_results)
        .fetch_all(&self.pool)
        .await
        .context("readings_by_range failed")
    }

    // ----------------------------
    // Setpoints
    // ----------------------------

    pub async fn get_setpoints(&self) -> Result<Setpoints> {
        sqlx::query_as(
            r#"
            SELECT temp_min, temp_max, level_min, level_max, updated_at
            FROM setpoints
            WHERE id = 1
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("get_setpoints failed")
    }

    pub async fn update_setpoints(&self, update: &SetpointsUpdate) -> Result<Setpoints> {
        let current = self.get_setpoints().await?;
        let now = now_unix();

        sqlx::query(
            r#"
            UPDATE setpoints
            SET temp_min = ?, temp_max = ?, level_min = ?, level_max = ?, updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(update.temp_min.unwrap_or(current.temp_min))
        .bind(update.temp_max.unwrap_or(current.temp_max))
        .bind(update.level_min.unwrap_or(current.level_min))
        .bind(update.level_max.unwrap_or(current.level_max))
        .bind(now)
        .execute(&self.pool)
        .await
        .context("update_setpoints failed")?;

        self.get_setpoints().await
    }

    // ----------------------------
    // Settings
    // ----------------------------

    pub async fn get_settings(&self) -> Result<Settings> {
        sqlx::query_as(
            r#"
            SELECT system_name, update_interval, data_retention,
                   email_alerts, push_alerts, alert_email,
                   temp_critical_min, temp_warning_min, temp_warning_max, temp_critical_max,
                   level_critical_min, level_warning_min, level_warning_max, level_critical_max,
                   updated_at
            FROM settings
            WHERE id = 1
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("get_settings failed")
    }

    pub async fn update_settings(&self, update: &SettingsUpdate) -> Result<Settings> {
        let current = self.get_settings().await?;
        let now = now_unix();

        // An empty string clears the address; an absent field keeps it.
        let alert_email = match update.alert_email.as_deref() {
            Some("") => None,
            Some(value) => Some(value.to_string()),
            None => current.alert_email.clone(),
        };

        sqlx::query(
            r#"
            UPDATE settings
            SET system_name = ?, update_interval = ?, data_retention = ?,
                email_alerts = ?, push_alerts = ?, alert_email = ?, updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(update.system_name.as_ref().unwrap_or(&current.system_name))
        .bind(update.update_interval.unwrap_or(current.update_interval))
        .bind(update.data_retention.unwrap_or(current.data_retention))
        .bind(update.email_alerts.unwrap_or(current.email_alerts))
        .bind(update.push_alerts.unwrap_or(current.push_alerts))
        .bind(alert_email)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("update_settings failed")?;

        self.get_settings().await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
