//! YAML configuration shared by the cache and the processes embedding it.
//!
//! Every section and field is optional, a missing file section falls back to its defaults:
//!
//! ```yaml
//! cache:
//!   ttl: 5m
//! logging:
//!   level: info
//!   format: auto
//! metrics:
//!   statsd: 127.0.0.1:8125
//!   custom_tags:
//!     app: admin
//! sentry_dsn: https://key@sentry.example.com/1
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::Deserialize;
use tracing::level_filters::LevelFilter;

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` on an interactive terminal, `simplified` otherwise.
    Auto,
    /// Multi-line, colored output.
    Pretty,
    /// One compact line per event, without colors.
    Simplified,
    /// One JSON object per event.
    Json,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum level for our own crates. `RUST_LOG` takes precedence when set.
    #[serde(with = "level_filter")]
    pub level: LevelFilter,
    pub format: LogFormat,
    /// Sets `RUST_BACKTRACE=1` on startup.
    pub enable_backtraces: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// `host:port` of the statsd server. Metrics are disabled when unset.
    pub statsd: Option<String>,
    /// Prepended to every metric name.
    pub prefix: String,
    /// Tags sent along with every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: "gamestats".to_owned(),
            custom_tags: Default::default(),
        }
    }
}

/// Configuration of the stats cache itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a cached entry stays fresh.
    ///
    /// Stale entries are re-fetched by the next load. Defaults to 5 minutes.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    /// Internal errors are reported here when set.
    pub sentry_dsn: Option<Dsn>,
}

impl Config {
    /// Reads the YAML file at `path`. Without a path, the defaults are used.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("invalid config file {}", path.display()))
    }

    fn from_yaml(yaml: &str) -> Result<Self> {
        // an empty document would silently turn into the defaults
        anyhow::ensure!(!yaml.trim().is_empty(), "config file is empty");
        Ok(serde_yaml::from_str(yaml)?)
    }
}

mod level_filter {
    use serde::de::{Deserialize, Deserializer, Error};
    use tracing::level_filters::LevelFilter;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LevelFilter, D::Error> {
        let level = String::deserialize(deserializer)?;
        level.parse().map_err(|_| {
            D::Error::unknown_variant(&level, &["off", "error", "warn", "info", "debug", "trace"])
        })
    }
}
