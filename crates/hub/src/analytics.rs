//! Derived-field computation for the backup replication path: trends
//! against the previously stored reading, fixed-threshold critical
//! detection, and sentinel-aware statistics.
//!
//! The critical thresholds here are deliberately NOT the user-editable
//! setpoints: setpoints drive chart reference lines only, while
//! alerting uses these fixed bounds.

use serde::Serialize;

use crate::db::Reading;

/// A DS18B20-style probe reports this value when the sensor is faulty
/// or disconnected. Anything at or below the cutoff is treated as a
/// fault, never as a real water temperature.
pub const SENSOR_FAULT_TEMPERATURE: f64 = -127.0;
const SENSOR_FAULT_CUTOFF: f64 = -100.0;

/// Fixed alerting bounds, independent of the setpoints table.
pub const TEMP_CRITICAL_MIN: f64 = 18.0;
pub const TEMP_CRITICAL_MAX: f64 = 30.0;
pub const LEVEL_CRITICAL_MIN: f64 = 50.0;
pub const LEVEL_CRITICAL_MAX: f64 = 90.0;

/// Tag stored on every replicated row.
pub const DATA_SOURCE: &str = "thingspeak";

/// Fields computed for a reading at the moment it is copied into the
/// backup store. Never recomputed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    pub temperature_trend: f64,
    pub level_trend: f64,
    pub is_temp_critical: bool,
    pub is_level_critical: bool,
    pub data_quality: f64,
}

/// Aggregate statistics over a set of readings, for the history API.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadingStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

impl ReadingStats {
    pub fn zero() -> Self {
        Self {
            avg: 0.0,
            min: 0.0,
            max: 0.0,
            std_dev: 0.0,
        }
    }
}

pub fn is_sensor_fault(temperature: f64) -> bool {
    temperature <= SENSOR_FAULT_CUTOFF
}

pub fn is_temp_critical(temperature: f64) -> bool {
    // A faulty probe is a fault, not a cold tank.
    if is_sensor_fault(temperature) {
        return false;
    }
    temperature < TEMP_CRITICAL_MIN || temperature > TEMP_CRITICAL_MAX
}

pub fn is_level_critical(level: f64) -> bool {
    level < LEVEL_CRITICAL_MIN || level > LEVEL_CRITICAL_MAX
}

/// Compute the derived columns for `reading`.
///
/// `prev_valid_temperature` is the temperature of the most recently
/// stored non-fault reading, `prev_level` the level of the most
/// recently stored reading of any kind. Both are `None` when the
/// backup store is empty, which yields zero trends for the first row.
pub fn derive(
    reading: &Reading,
    prev_valid_temperature: Option<f64>,
    prev_level: Option<f64>,
) -> Derived {
    let faulty = is_sensor_fault(reading.temperature);

    let temperature_trend = if faulty {
        0.0
    } else {
        prev_valid_temperature
            .map(|p| reading.temperature - p)
            .unwrap_or(0.0)
    };

    let level_trend = prev_level.map(|p| reading.level - p).unwrap_or(0.0);

    Derived {
        temperature_trend,
        level_trend,
        is_temp_critical: is_temp_critical(reading.temperature),
        is_level_critical: is_level_critical(reading.level),
        data_quality: if faulty { 0.0 } else { 1.0 },
    }
}

/// Temperature statistics with fault readings excluded.
pub fn temperature_stats(readings: &[Reading]) -> ReadingStats {
    let values: Vec<f64> = readings
        .iter()
        .map(|r| r.temperature)
        .filter(|t| !is_sensor_fault(*t))
        .collect();
    stats_of(&values)
}

pub fn level_stats(readings: &[Reading]) -> ReadingStats {
    let values: Vec<f64> = readings.iter().map(|r| r.level).collect();
    stats_of(&values)
}

fn stats_of(values: &[f64]) -> ReadingStats {
    if values.is_empty() {
        return ReadingStats::zero();
    }

    let n = values.len() as f64;
    let avg = values.iter().sum::<f64>() / n;
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / n;

    ReadingStats {
        avg,
        min,
        max,
        std_dev: variance.sqrt(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
