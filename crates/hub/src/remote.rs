//! ThingSpeak channel adapter.
//!
//! Field layout on the channel: field1 water temperature (°C), field2
//! water level (%), field3 pump state, field4 heater state. The feed
//! is tolerant of everything ThingSpeak actually returns: null fields,
//! empty strings, comma decimal separators, and booleans encoded as
//! "0"/"1", "true"/"false", or bare numbers.
//!
//! Read paths never surface an error to callers. A fetch that fails
//! after retries yields a tagged fallback reading so the polling loop
//! keeps a continuous series; only the caller decides whether a
//! fallback is worth acting on.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::db::{now_unix, NewReading};

pub const PUMP_FIELD: u8 = 3;
pub const HEATER_FIELD: u8 = 4;

const LATEST_TIMEOUT: Duration = Duration::from_secs(2);
const RANGE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_millis(1500);
const LATEST_RETRIES: u32 = 3;

const RANGE_TIME: &[time::format_description::BorrowedFormatItem<'static>] =
    time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Values used when the channel is unreachable.
const FALLBACK_TEMPERATURE: f64 = 25.0;
const FALLBACK_LEVEL: f64 = 75.0;

#[derive(Clone)]
pub struct ThingSpeak {
    client: reqwest::Client,
    base_url: String,
    channel_id: String,
    read_key: String,
    write_key: String,
}

#[derive(Debug, Deserialize)]
struct FeedsResponse {
    #[serde(default)]
    feeds: Vec<FeedEntry>,
}

#[derive(Debug, Deserialize)]
struct FeedEntry {
    created_at: Option<String>,
    field1: Option<Value>,
    field2: Option<Value>,
    field3: Option<Value>,
    field4: Option<Value>,
}

/// A reading from the channel, tagged by provenance. `Fallback`
/// readings are synthetic defaults produced when the channel could not
/// be reached; they are good enough to store, but must never drive
/// cache reconciliation.
#[derive(Debug, Clone)]
pub enum Fetched {
    Live(NewReading),
    Fallback(NewReading),
}

impl Fetched {
    pub fn into_reading(self) -> NewReading {
        match self {
            Fetched::Live(r) | Fetched::Fallback(r) => r,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Fetched::Live(_))
    }
}

/// Lenient numeric parse: null, missing, empty, and unparseable values
/// all become 0.0. Comma decimal separators are accepted.
fn parse_field_number(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => {
            let s = s.trim().replace(',', ".");
            s.parse().unwrap_or(0.0)
        }
        _ => 0.0,
    }
}

/// Lenient boolean parse: "1"/"true" and non-zero numbers are true,
/// everything else is false.
fn parse_field_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
        Some(Value::String(s)) => {
            let s = s.trim();
            s == "1" || s.eq_ignore_ascii_case("true")
        }
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

fn entry_to_reading(entry: &FeedEntry, timestamp: i64) -> NewReading {
    NewReading {
        temperature: parse_field_number(entry.field1.as_ref()),
        level: parse_field_number(entry.field2.as_ref()),
        pump_status: parse_field_bool(entry.field3.as_ref()),
        heater_status: parse_field_bool(entry.field4.as_ref()),
        timestamp,
    }
}

fn entry_timestamp(entry: &FeedEntry) -> Option<i64> {
    let raw = entry.created_at.as_deref()?;
    OffsetDateTime::parse(raw, &Rfc3339)
        .map(|t| t.unix_timestamp())
        .ok()
}

impl ThingSpeak {
    pub fn new(base_url: &str, channel_id: &str, read_key: &str, write_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            channel_id: channel_id.to_string(),
            read_key: read_key.to_string(),
            write_key: write_key.to_string(),
        }
    }

    fn feeds_url(&self) -> String {
        format!("{}/channels/{}/feeds.json", self.base_url, self.channel_id)
    }

    /// Latest reading from the channel. Retries transient failures
    /// with a short linear backoff, then falls back to defaults so the
    /// caller always gets a reading.
    pub async fn fetch_latest(&self) -> Fetched {
        for attempt in 1..=LATEST_RETRIES {
            match self.try_fetch_latest().await {
                Ok(Some(reading)) => return Fetched::Live(reading),
                Ok(None) => {
                    tracing::warn!("channel feed is empty, using fallback reading");
                    break;
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "feed fetch failed");
                    if attempt < LATEST_RETRIES {
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    }
                }
            }
        }

        Fetched::Fallback(NewReading {
            temperature: FALLBACK_TEMPERATURE,
            level: FALLBACK_LEVEL,
            pump_status: false,
            heater_status: false,
            timestamp: now_unix(),
        })
    }

    async fn try_fetch_latest(&self) -> Result<Option<NewReading>> {
        let response = self
            .client
            .get(self.feeds_url())
            .query(&[("results", "2"), ("api_key", self.read_key.as_str())])
            .timeout(LATEST_TIMEOUT)
            .send()
            .await
            .context("feed request failed")?
            .error_for_status()
            .context("feed request rejected")?;

        let body: FeedsResponse = response.json().await.context("malformed feed response")?;

        // Prefer the newest entry that actually carries a temperature;
        // ThingSpeak pads partial updates with nulls.
        let entry = body
            .feeds
            .iter()
            .rev()
            .find(|e| e.field1.as_ref().is_some_and(|v| !v.is_null()))
            .or_else(|| body.feeds.last());

        Ok(entry.map(|e| entry_to_reading(e, now_unix())))
    }

    /// Feed entries between `start` and `end`, oldest first, with the
    /// channel's own timestamps. Single attempt; failures yield an
    /// empty list.
    pub async fn fetch_range(&self, start: OffsetDateTime, end: OffsetDateTime) -> Vec<NewReading> {
        match self.try_fetch_range(start, end).await {
            Ok(readings) => readings,
            Err(err) => {
                tracing::warn!(error = %err, "range fetch failed");
                Vec::new()
            }
        }
    }

    async fn try_fetch_range(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<NewReading>> {
        let response = self
            .client
            .get(self.feeds_url())
            .query(&[
                ("start", start.format(&RANGE_TIME).context("bad range start")?),
                ("end", end.format(&RANGE_TIME).context("bad range end")?),
                ("api_key", self.read_key.clone()),
            ])
            .timeout(RANGE_TIMEOUT)
            .send()
            .await
            .context("range request failed")?
            .error_for_status()
            .context("range request rejected")?;

        let body: FeedsResponse = response.json().await.context("malformed range response")?;

        Ok(body
            .feeds
            .iter()
            .filter_map(|e| entry_timestamp(e).map(|ts| entry_to_reading(e, ts)))
            .collect())
    }

    /// Push one field value to the channel. ThingSpeak answers with
    /// the new entry id, or "0" when the update was not accepted.
    /// Returns whether the write was acknowledged.
    pub async fn write_field(&self, field: u8, value: &str) -> bool {
        match self.try_write_field(field, value).await {
            Ok(acked) => {
                if !acked {
                    tracing::warn!(field, value, "channel rejected field write");
                }
                acked
            }
            Err(err) => {
                tracing::warn!(field, value, error = %err, "field write failed");
                false
            }
        }
    }

    async fn try_write_field(&self, field: u8, value: &str) -> Result<bool> {
        let field_param = format!("field{field}");
        let response = self
            .client
            .get(format!("{}/update", self.base_url))
            .query(&[
                ("api_key", self.write_key.as_str()),
                (field_param.as_str(), value),
            ])
            .timeout(WRITE_TIMEOUT)
            .send()
            .await
            .context("update request failed")?
            .error_for_status()
            .context("update request rejected")?;

        let body = response.text().await.context("unreadable update response")?;
        Ok(body.trim() != "0")
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(raw: Value) -> Option<Value> {
        Some(raw)
    }

    // -- field parsing ------------------------------------------------------

    #[test]
    fn numbers_parse_from_strings_and_numbers() {
        assert_eq!(parse_field_number(v(json!("24.5")).as_ref()), 24.5);
        assert_eq!(parse_field_number(v(json!(24.5)).as_ref()), 24.5);
        assert_eq!(parse_field_number(v(json!(" 24.5 ")).as_ref()), 24.5);
    }

    #[test]
    fn comma_decimal_separator_is_accepted() {
        assert_eq!(parse_field_number(v(json!("24,5")).as_ref()), 24.5);
    }

    #[test]
    fn missing_and_garbage_numbers_become_zero() {
        assert_eq!(parse_field_number(None), 0.0);
        assert_eq!(parse_field_number(v(json!(null)).as_ref()), 0.0);
        assert_eq!(parse_field_number(v(json!("")).as_ref()), 0.0);
        assert_eq!(parse_field_number(v(json!("n/a")).as_ref()), 0.0);
    }

    #[test]
    fn bools_parse_from_all_encodings() {
        assert!(parse_field_bool(v(json!("1")).as_ref()));
        assert!(parse_field_bool(v(json!("true")).as_ref()));
        assert!(parse_field_bool(v(json!("TRUE")).as_ref()));
        assert!(parse_field_bool(v(json!(1)).as_ref()));
        assert!(parse_field_bool(v(json!(2.0)).as_ref()));
        assert!(parse_field_bool(v(json!(true)).as_ref()));

        assert!(!parse_field_bool(v(json!("0")).as_ref()));
        assert!(!parse_field_bool(v(json!("false")).as_ref()));
        assert!(!parse_field_bool(v(json!(0)).as_ref()));
        assert!(!parse_field_bool(v(json!(null)).as_ref()));
        assert!(!parse_field_bool(None));
        assert!(!parse_field_bool(v(json!("maybe")).as_ref()));
    }

    // -- feed deserialization -----------------------------------------------

    #[test]
    fn feed_response_deserializes_thingspeak_shape() {
        let raw = json!({
            "channel": {"id": 123, "name": "tank"},
            "feeds": [
                {
                    "created_at": "2026-08-30T12:00:00Z",
                    "entry_id": 1001,
                    "field1": "24,5",
                    "field2": "71.2",
                    "field3": "1",
                    "field4": null
                },
                {
                    "created_at": "2026-08-30T12:05:00Z",
                    "entry_id": 1002,
                    "field1": null,
                    "field2": "70.9",
                    "field3": "0",
                    "field4": "0"
                }
            ]
        });

        let parsed: FeedsResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.feeds.len(), 2);

        let reading = entry_to_reading(&parsed.feeds[0], 1000);
        assert_eq!(reading.temperature, 24.5);
        assert_eq!(reading.level, 71.2);
        assert!(reading.pump_status);
        assert!(!reading.heater_status);
        assert_eq!(reading.timestamp, 1000);
    }

    #[test]
    fn entry_timestamp_parses_rfc3339() {
        let entry = FeedEntry {
            created_at: Some("2026-08-30T12:00:00Z".to_string()),
            field1: None,
            field2: None,
            field3: None,
            field4: None,
        };
        assert_eq!(entry_timestamp(&entry), Some(1_788_091_200));

        let bad = FeedEntry {
            created_at: Some("yesterday".to_string()),
            field1: None,
            field2: None,
            field3: None,
            field4: None,
        };
        assert_eq!(entry_timestamp(&bad), None);
    }

    #[test]
    fn fetched_tags_provenance() {
        let live = Fetched::Live(NewReading {
            temperature: 24.0,
            level: 70.0,
            pump_status: false,
            heater_status: false,
            timestamp: 0,
        });
        assert!(live.is_live());

        let fallback = Fetched::Fallback(NewReading {
            temperature: FALLBACK_TEMPERATURE,
            level: FALLBACK_LEVEL,
            pump_status: false,
            heater_status: false,
            timestamp: 0,
        });
        assert!(!fallback.is_live());
        assert_eq!(fallback.into_reading().temperature, 25.0);
    }

    // -- unreachable endpoint -----------------------------------------------

    #[tokio::test]
    async fn write_to_unreachable_host_returns_false() {
        let ts = ThingSpeak::new("http://127.0.0.1:1", "123", "rk", "wk");
        assert!(!ts.write_field(PUMP_FIELD, "1").await);
    }

    #[tokio::test]
    async fn range_from_unreachable_host_is_empty() {
        let ts = ThingSpeak::new("http://127.0.0.1:1", "123", "rk", "wk");
        let end = OffsetDateTime::now_utc();
        let start = end - Duration::from_secs(7 * 86_400);
        assert!(ts.fetch_range(start, end).await.is_empty());
    }
}
