//! In-memory actuator state.
//!
//! Control requests update this cache immediately and push to the
//! channel in the background, so the UI reflects a toggle without
//! waiting on the remote round trip. A periodic reconciliation pass
//! adopts the channel's view when the two drift apart, but only from
//! live fetches: fallback readings carry synthetic actuator states and
//! must never overwrite what the user asked for.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::db::now_unix;
use crate::remote::ThingSpeak;

const RECONCILE_STARTUP_DELAY: Duration = Duration::from_secs(10);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub pump_status: bool,
    pub heater_status: bool,
    pub last_update: i64,
}

#[derive(Clone)]
pub struct DeviceStateCache {
    inner: Arc<RwLock<DeviceStatus>>,
}

impl DeviceStateCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(DeviceStatus {
                pump_status: false,
                heater_status: false,
                last_update: now_unix(),
            })),
        }
    }

    pub async fn snapshot(&self) -> DeviceStatus {
        *self.inner.read().await
    }

    pub async fn set_pump(&self, on: bool) -> DeviceStatus {
        let mut state = self.inner.write().await;
        state.pump_status = on;
        state.last_update = now_unix();
        *state
    }

    pub async fn set_heater(&self, on: bool) -> DeviceStatus {
        let mut state = self.inner.write().await;
        state.heater_status = on;
        state.last_update = now_unix();
        *state
    }

    /// Adopt the channel's actuator states. Returns true when the
    /// cache actually changed.
    pub async fn apply_remote(&self, pump: bool, heater: bool) -> bool {
        let mut state = self.inner.write().await;
        if state.pump_status == pump && state.heater_status == heater {
            return false;
        }
        state.pump_status = pump;
        state.heater_status = heater;
        state.last_update = now_unix();
        true
    }
}

impl Default for DeviceStateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically reconcile the cache against the channel. Runs until
/// the process exits; fetch failures surface as fallback readings and
/// are skipped.
pub async fn run_consistency_loop(cache: DeviceStateCache, remote: ThingSpeak) {
    tokio::time::sleep(RECONCILE_STARTUP_DELAY).await;
    let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);

    loop {
        ticker.tick().await;

        let fetched = remote.fetch_latest().await;
        if !fetched.is_live() {
            tracing::debug!("skipping reconciliation, channel unreachable");
            continue;
        }

        let reading = fetched.into_reading();
        if cache
            .apply_remote(reading.pump_status, reading.heater_status)
            .await
        {
            tracing::info!(
                pump = reading.pump_status,
                heater = reading.heater_status,
                "device state reconciled from channel"
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
