// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration Module
//!
//! The configuration is built once at startup and moved into
//! [`crate::agent::Agent`], which passes each component the settings it
//! needs when it is constructed. Nothing in the pipeline reads process-wide
//! state.
//!
//! ## Configuration Priority
//!
//! Sources are applied in the following order (later sources override earlier):
//!
//! 1. **Defaults** - see [`crate::constants`]
//! 2. **YAML file** - usually `config.yaml`
//! 3. **Environment variables** - `LOGSHIP_*`, nested keys separated by `__`
//!    (`LOGSHIP_AGENT__BATCH_SIZE=50`)
//!
//! ## Example
//!
//! ```yaml
//! backend_url: http://ingest.internal:8080/api/logs
//! log_files:
//!   - path: /var/log/nginx/access.log
//!     type: nginx
//! agent:
//!   batch_size: 10
//!   flush_interval: 5s
//!   max_retries: 3
//!   buffer_size: 1000
//! metadata:
//!   hostname: web-1
//!   tags: [prod]
//! ```
//!
//! ## Edge Cases
//!
//! - Zero counts or durations fall back to their defaults.
//! - Durations accept seconds (`5`, `2.5`) or suffixed strings (`"250ms"`,
//!   `"5s"`, `"1m"`, `"1h"`). Unparseable durations are logged and replaced
//!   by the default.
//! - A trailing `/` on `backend_url` is removed so endpoint joins stay clean.

pub mod log_level;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::error;

use crate::constants;
use crate::config::log_level::LogLevel;

/// Fatal configuration problems. The agent refuses to start on any of these.
#[derive(Debug, Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One file to tail.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogFileConfig {
    pub path: PathBuf,
    #[serde(alias = "type")]
    pub source_type: String,
}

/// Pipeline tuning block.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentTuning {
    pub batch_size: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub flush_interval: Duration,
    pub max_retries: u32,
    /// Informational; the transport computes its own quadratic backoff.
    #[serde(deserialize_with = "deserialize_duration")]
    pub retry_delay: Duration,
    pub buffer_size: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,
    /// Re-send overflow records before tailing starts.
    pub replay_overflow: bool,
    /// Lines read from the start of each file before live tailing. 0 disables.
    pub backfill_lines: usize,
}

impl Default for AgentTuning {
    fn default() -> Self {
        AgentTuning {
            batch_size: constants::DEFAULT_BATCH_SIZE,
            flush_interval: constants::DEFAULT_FLUSH_INTERVAL,
            max_retries: constants::DEFAULT_MAX_RETRIES,
            retry_delay: constants::DEFAULT_RETRY_DELAY,
            buffer_size: constants::DEFAULT_BUFFER_SIZE,
            request_timeout: constants::DEFAULT_REQUEST_TIMEOUT,
            replay_overflow: false,
            backfill_lines: 0,
        }
    }
}

/// Overrides applied on top of the collected [`crate::host::SystemInfo`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetadataOverrides {
    pub hostname: Option<String>,
    pub os_family: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend_url: String,
    pub log_files: Vec<LogFileConfig>,
    pub agent: AgentTuning,
    pub metadata: MetadataOverrides,
    pub overflow_path: PathBuf,
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend_url: String::new(),
            log_files: Vec::new(),
            agent: AgentTuning::default(),
            metadata: MetadataOverrides::default(),
            overflow_path: PathBuf::from(constants::DEFAULT_OVERFLOW_PATH),
            log_level: LogLevel::default(),
        }
    }
}

impl Config {
    /// Loads defaults, then `path`, then `LOGSHIP_*` environment variables.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if let Err(source) = std::fs::metadata(path) {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }

        let figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("LOGSHIP_").split("__"));

        let mut config: Config = figment
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Replaces zero values with their defaults.
    fn apply_defaults(&mut self) {
        let defaults = AgentTuning::default();
        let agent = &mut self.agent;
        if agent.batch_size == 0 {
            agent.batch_size = defaults.batch_size;
        }
        if agent.flush_interval.is_zero() {
            agent.flush_interval = defaults.flush_interval;
        }
        if agent.max_retries == 0 {
            agent.max_retries = defaults.max_retries;
        }
        if agent.retry_delay.is_zero() {
            agent.retry_delay = defaults.retry_delay;
        }
        if agent.buffer_size == 0 {
            agent.buffer_size = defaults.buffer_size;
        }
        if agent.request_timeout.is_zero() {
            agent.request_timeout = defaults.request_timeout;
        }
        if self.overflow_path.as_os_str().is_empty() {
            self.overflow_path = PathBuf::from(constants::DEFAULT_OVERFLOW_PATH);
        }
        let trimmed = self.backend_url.trim().trim_end_matches('/');
        self.backend_url = trimmed.to_string();
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backend_url.is_empty() {
            return Err(ConfigError::Invalid("backend_url is required".to_string()));
        }
        if self.log_files.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one entry in log_files is required".to_string(),
            ));
        }
        if let Some(entry) = self
            .log_files
            .iter()
            .find(|f| f.path.as_os_str().is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "log file entry with source type '{}' has an empty path",
                entry.source_type
            )));
        }
        Ok(())
    }
}

/// Deserializes a duration from seconds or a suffixed string.
///
/// Invalid or negative values yield `Duration::ZERO`, which
/// [`Config::load`] later replaces with the field's default.
pub fn deserialize_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Duration, D::Error> {
    struct DurationVisitor;
    impl serde::de::Visitor<'_> for DurationVisitor {
        type Value = Duration;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a duration in seconds or a string such as \"5s\"")
        }
        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Duration::from_secs(v))
        }
        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            match u64::try_from(v) {
                Ok(v) => self.visit_u64(v),
                Err(_) => {
                    error!("AGENT | Negative durations are not allowed, using default");
                    Ok(Duration::ZERO)
                }
            }
        }
        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
            if v.is_finite() && v >= 0f64 {
                Ok(Duration::from_secs_f64(v))
            } else {
                error!("AGENT | Invalid duration {v}, using default");
                Ok(Duration::ZERO)
            }
        }
        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(parse_duration(v).unwrap_or_else(|| {
                error!("AGENT | Failed to parse duration '{v}', using default");
                Duration::ZERO
            }))
        }
    }
    deserializer.deserialize_any(DurationVisitor)
}

/// Parses `"250ms"`, `"5s"`, `"1.5m"`, `"2h"` or a bare number of seconds.
#[must_use]
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0f64 {
        return None;
    }
    let seconds = match unit.trim() {
        "ms" => value / 1000f64,
        "" | "s" => value,
        "m" => value * 60f64,
        "h" => value * 3600f64,
        _ => return None,
    };
    Some(Duration::from_secs_f64(seconds))
}
