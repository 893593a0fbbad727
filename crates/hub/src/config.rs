//! TOML config file loading, validation, and database seeding for the
//! remote channel and the loop cadences.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::db::{Db, SetpointsUpdate};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteEntry,
    #[serde(default)]
    pub intervals: IntervalsEntry,
    pub setpoints: Option<SetpointsEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RemoteEntry {
    pub base_url: String,
    pub channel_id: String,
    /// Empty for public channels.
    pub read_api_key: String,
    pub write_api_key: String,
}

impl Default for RemoteEntry {
    fn default() -> Self {
        Self {
            base_url: "https://api.thingspeak.com".to_string(),
            channel_id: "0".to_string(),
            read_api_key: String::new(),
            write_api_key: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IntervalsEntry {
    pub poll_secs: u64,
    pub sync_secs: u64,
}

impl Default for IntervalsEntry {
    fn default() -> Self {
        Self {
            poll_secs: 300,
            sync_secs: 1800,
        }
    }
}

/// Optional setpoint seed, applied on startup over whatever the
/// database currently holds.
#[derive(Debug, Deserialize)]
pub struct SetpointsEntry {
    pub temp_min: f64,
    pub temp_max: f64,
    pub level_min: f64,
    pub level_max: f64,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_remote(&mut errors);
        self.validate_intervals(&mut errors);
        self.validate_setpoints(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_remote(&self, errors: &mut Vec<String>) {
        let r = &self.remote;

        if r.base_url.trim().is_empty() {
            errors.push("remote: base_url is empty".to_string());
        } else if !r.base_url.starts_with("http://") && !r.base_url.starts_with("https://") {
            errors.push(format!(
                "remote: base_url '{}' must start with http:// or https://",
                r.base_url
            ));
        }

        if r.channel_id.trim().is_empty() {
            errors.push("remote: channel_id is empty".to_string());
        } else if !r.channel_id.chars().all(|c| c.is_ascii_digit()) {
            errors.push(format!(
                "remote: channel_id '{}' must be numeric",
                r.channel_id
            ));
        }
    }

    fn validate_intervals(&self, errors: &mut Vec<String>) {
        if self.intervals.poll_secs == 0 {
            errors.push("intervals: poll_secs must be positive".to_string());
        }
        if self.intervals.sync_secs == 0 {
            errors.push("intervals: sync_secs must be positive".to_string());
        }
    }

    fn validate_setpoints(&self, errors: &mut Vec<String>) {
        let Some(sp) = &self.setpoints else {
            return;
        };

        if sp.temp_min >= sp.temp_max {
            errors.push(format!(
                "setpoints: temp_min ({}) must be less than temp_max ({})",
                sp.temp_min, sp.temp_max
            ));
        }
        if sp.level_min >= sp.level_max {
            errors.push(format!(
                "setpoints: level_min ({}) must be less than level_max ({})",
                sp.level_min, sp.level_max
            ));
        }
        for (name, value) in [("level_min", sp.level_min), ("level_max", sp.level_max)] {
            if !(0.0..=100.0).contains(&value) {
                errors.push(format!(
                    "setpoints: {name} {value} out of range [0.0, 100.0]"
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like `load`, but a missing file yields the defaults.
pub fn load_or_default(path: &str) -> Result<Config> {
    if std::path::Path::new(path).exists() {
        load(path)
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Ok(Config::default())
    }
}

/// Seed the setpoints table from the config, when a seed is present.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    if let Some(sp) = &config.setpoints {
        db.update_setpoints(&SetpointsUpdate {
            temp_min: Some(sp.temp_min),
            temp_max: Some(sp.temp_max),
            level_min: Some(sp.level_min),
            level_max: Some(sp.level_max),
        })
        .await
        .context("failed to seed setpoints from config")?;

        tracing::info!(
            temp_min = sp.temp_min,
            temp_max = sp.temp_max,
            level_min = sp.level_min,
            level_max = sp.level_max,
            "setpoints seeded from config"
        );
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            remote: RemoteEntry {
                base_url: "https://api.thingspeak.com".into(),
                channel_id: "123456".into(),
                read_api_key: "RKEY".into(),
                write_api_key: "WKEY".into(),
            },
            intervals: IntervalsEntry::default(),
            setpoints: None,
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[remote]
base_url = "https://api.thingspeak.com"
channel_id = "123456"
read_api_key = "RKEY"
write_api_key = "WKEY"

[intervals]
poll_secs = 60
sync_secs = 600

[setpoints]
temp_min = 22.0
temp_max = 28.0
level_min = 65.0
level_max = 85.0
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.remote.channel_id, "123456");
        assert_eq!(config.intervals.poll_secs, 60);
        assert_eq!(config.setpoints.unwrap().temp_min, 22.0);
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.remote.base_url, "https://api.thingspeak.com");
        assert_eq!(config.intervals.poll_secs, 300);
        assert_eq!(config.intervals.sync_secs, 1800);
        assert!(config.setpoints.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn read_key_may_be_empty_for_public_channels() {
        let mut cfg = valid_config();
        cfg.remote.read_api_key = "".into();
        cfg.validate().unwrap();
    }

    // -- Validation failures ----------------------------------------------

    #[test]
    fn empty_channel_id_rejected() {
        let mut cfg = valid_config();
        cfg.remote.channel_id = "".into();
        assert_validation_err(&cfg, "channel_id is empty");
    }

    #[test]
    fn non_numeric_channel_id_rejected() {
        let mut cfg = valid_config();
        cfg.remote.channel_id = "tank-one".into();
        assert_validation_err(&cfg, "must be numeric");
    }

    #[test]
    fn bad_base_url_rejected() {
        let mut cfg = valid_config();
        cfg.remote.base_url = "ftp://api.thingspeak.com".into();
        assert_validation_err(&cfg, "must start with http");
    }

    #[test]
    fn zero_intervals_rejected() {
        let mut cfg = valid_config();
        cfg.intervals.poll_secs = 0;
        cfg.intervals.sync_secs = 0;
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("poll_secs"), "missing poll_secs in: {msg}");
        assert!(msg.contains("sync_secs"), "missing sync_secs in: {msg}");
    }

    #[test]
    fn inverted_setpoints_rejected() {
        let mut cfg = valid_config();
        cfg.setpoints = Some(SetpointsEntry {
            temp_min: 30.0,
            temp_max: 20.0,
            level_min: 60.0,
            level_max: 90.0,
        });
        assert_validation_err(&cfg, "temp_min (30) must be less than temp_max (20)");
    }

    #[test]
    fn out_of_range_levels_rejected() {
        let mut cfg = valid_config();
        cfg.setpoints = Some(SetpointsEntry {
            temp_min: 20.0,
            temp_max: 30.0,
            level_min: -5.0,
            level_max: 110.0,
        });
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("level_min -5"), "missing level_min in: {msg}");
        assert!(msg.contains("level_max 110"), "missing level_max in: {msg}");
    }

    // -- DB integration ---------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_setpoints() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let mut config = valid_config();
        config.setpoints = Some(SetpointsEntry {
            temp_min: 22.0,
            temp_max: 28.0,
            level_min: 65.0,
            level_max: 85.0,
        });
        config.validate().unwrap();

        apply(&config, &db).await.unwrap();

        let sp = db.get_setpoints().await.unwrap();
        assert_eq!(sp.temp_min, 22.0);
        assert_eq!(sp.level_max, 85.0);
    }

    #[tokio::test]
    async fn apply_without_seed_is_a_noop() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        apply(&valid_config(), &db).await.unwrap();

        let sp = db.get_setpoints().await.unwrap();
        assert_eq!(sp.temp_min, 20.0);
    }
}
