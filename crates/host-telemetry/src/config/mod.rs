// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! The config file is YAML and lists inputs and outputs as `{type, ...}`
//! entries:
//!
//! ```yaml
//! version: 1
//! inputs:
//!   - type: clash
//!     host: 127.0.0.1:9090
//!     token: secret
//!   - type: tailscale
//!   - type: ping
//!     hosts: [1.1.1.1]
//! outputs:
//!   - type: loki
//!     host: logs-prod.grafana.net
//!     user_id: 123456
//!     api_key: glc_xxx
//!     labels:
//!       app: edge
//! ```
//!
//! Top-level scalars can be overridden with `HOST_TELEMETRY_*` environment
//! variables (`HOST_TELEMETRY_LOG_LEVEL=debug`).

pub mod entries;
pub mod log_level;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Deserializer};

pub use entries::{
    BufferConfig, ClashInput, FileOutput, InputConfig, LokiOutput, OutputConfig, PingInput,
    TailscaleInput,
};
use log_level::LogLevel;

pub const ENV_PREFIX: &str = "HOST_TELEMETRY_";
const ENV_KEYS: [&str; 5] = [
    "log_level",
    "queue_capacity",
    "report_interval",
    "shutdown_timeout",
    "hostname",
];
const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    MissingFile(PathBuf),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("unsupported config version {0}, expected {SUPPORTED_VERSION}")]
    UnsupportedVersion(u32),
    #[error("no inputs configured")]
    NoInputs,
    #[error("no outputs configured")]
    NoOutputs,
    #[error("invalid {entry}: {reason}")]
    Invalid { entry: String, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(
        default = "default_report_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub report_interval: Duration,
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub self_logs: SelfLogsConfig,
}

/// Watchdog restart policy for dead source tasks.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RestartConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(
        default = "default_restart_base_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub base_delay: Duration,
    #[serde(
        default = "default_restart_max_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub max_delay: Duration,
    #[serde(
        default = "default_stable_after",
        deserialize_with = "deserialize_duration"
    )]
    pub stable_after: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        RestartConfig {
            max_restarts: default_max_restarts(),
            base_delay: default_restart_base_delay(),
            max_delay: default_restart_max_delay(),
            stable_after: default_stable_after(),
        }
    }
}

/// Forwarding of the agent's own log events to the sinks.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SelfLogsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_self_logs_level")]
    pub level: LogLevel,
}

impl Default for SelfLogsConfig {
    fn default() -> Self {
        SelfLogsConfig {
            enabled: false,
            level: default_self_logs_level(),
        }
    }
}

impl Config {
    /// Loads the YAML file at `path`, applies env overrides and validates.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }
        let figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).only(&ENV_KEYS));
        Config::from_figment(&figment)
    }

    pub fn from_figment(figment: &Figment) -> Result<Config, ConfigError> {
        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != SUPPORTED_VERSION {
            return Err(ConfigError::UnsupportedVersion(self.version));
        }
        if self.inputs.is_empty() {
            return Err(ConfigError::NoInputs);
        }
        if self.outputs.is_empty() {
            return Err(ConfigError::NoOutputs);
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be greater than zero"));
        }
        if self.report_interval.is_zero() {
            return Err(invalid("report_interval", "must be greater than zero"));
        }
        for input in &self.inputs {
            input.validate()?;
        }
        for output in &self.outputs {
            output.validate()?;
        }
        Ok(())
    }
}

pub(crate) fn invalid(entry: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        entry: entry.into(),
        reason: reason.into(),
    }
}

fn default_version() -> u32 {
    SUPPORTED_VERSION
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_report_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_base_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_restart_max_delay() -> Duration {
    Duration::from_secs(600)
}

fn default_stable_after() -> Duration {
    Duration::from_secs(300)
}

fn default_self_logs_level() -> LogLevel {
    LogLevel::Warn
}

/// Parses `"250ms"`, `"5s"`, `"2m"`, `"1h"` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{raw}'"))?;
    let seconds = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit '{other}' in '{raw}'")),
    };
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration '{raw}': {e}"))
}

/// Accepts whole or fractional seconds as a number, or a suffixed string.
pub fn deserialize_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Duration, D::Error> {
    struct DurationVisitor;
    impl serde::de::Visitor<'_> for DurationVisitor {
        type Value = Duration;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a duration in seconds or a string like \"5s\"")
        }
        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Duration::from_secs(v))
        }
        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("negative durations are not allowed"))
        }
        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Duration::try_from_secs_f64(v).map_err(E::custom)
        }
        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            parse_duration(v).map_err(E::custom)
        }
    }
    deserializer.deserialize_any(DurationVisitor)
}

/// Accepts a string or a number and yields a string, for ids that YAML
/// reads as integers.
pub fn deserialize_string_or_int<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<String, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or an integer, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::clash::Feed;
    use serial_test::serial;

    const MINIMAL: &str = r#"
version: 1
inputs:
  - type: clash
    host: 127.0.0.1:9090
    token: secret
outputs:
  - type: loki
    host: logs.example.com
    user_id: 123456
    api_key: key
"#;

    #[test]
    #[serial]
    fn test_load_minimal_config_with_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("config.yaml", MINIMAL)?;
            let config = Config::load(Path::new("config.yaml")).expect("config should load");

            assert_eq!(config.version, 1);
            assert_eq!(config.log_level, LogLevel::Info);
            assert_eq!(config.queue_capacity, 1024);
            assert_eq!(config.report_interval, Duration::from_secs(60));
            assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
            assert_eq!(config.restart, RestartConfig::default());
            assert!(!config.self_logs.enabled);

            let InputConfig::Clash(clash) = &config.inputs[0] else {
                panic!("expected clash input");
            };
            assert_eq!(clash.host, "127.0.0.1:9090");
            assert_eq!(clash.token.as_deref(), Some("secret"));
            assert_eq!(clash.feeds, vec![Feed::Traffic, Feed::Tracing]);

            let OutputConfig::Loki(loki) = &config.outputs[0] else {
                panic!("expected loki output");
            };
            assert_eq!(loki.user_id, "123456");
            assert_eq!(loki.buffer.capacity, 40);
            assert_eq!(loki.buffer.flush_timeout, Duration::from_secs(5));
            assert!(loki.verify);
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_env_overrides_top_level_scalars() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("config.yaml", MINIMAL)?;
            jail.set_env("HOST_TELEMETRY_LOG_LEVEL", "debug");
            jail.set_env("HOST_TELEMETRY_REPORT_INTERVAL", "15s");
            jail.set_env("HOST_TELEMETRY_HOSTNAME", "edge-7");
            let config = Config::load(Path::new("config.yaml")).expect("config should load");

            assert_eq!(config.log_level, LogLevel::Debug);
            assert_eq!(config.report_interval, Duration::from_secs(15));
            assert_eq!(config.hostname.as_deref(), Some("edge-7"));
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_unknown_input_type_is_fatal() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "config.yaml",
                r#"
inputs:
  - type: carrier_pigeon
outputs:
  - type: file
    filename: out.log
"#,
            )?;
            let err = Config::load(Path::new("config.yaml")).expect_err("should fail");
            assert!(matches!(err, ConfigError::Parse(_)), "{err:?}");
            assert!(err.to_string().contains("carrier_pigeon"), "{err}");
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_missing_required_parameter_is_fatal() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "config.yaml",
                r#"
inputs:
  - type: clash
    token: secret
outputs:
  - type: file
    filename: out.log
"#,
            )?;
            let err = Config::load(Path::new("config.yaml")).expect_err("should fail");
            assert!(err.to_string().contains("host"), "{err}");
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_empty_outputs_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "config.yaml",
                r#"
inputs:
  - type: tailscale
outputs: []
"#,
            )?;
            let err = Config::load(Path::new("config.yaml")).expect_err("should fail");
            assert!(matches!(err, ConfigError::NoOutputs));
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_unsupported_version_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("config.yaml", &MINIMAL.replace("version: 1", "version: 2"))?;
            let err = Config::load(Path::new("config.yaml")).expect_err("should fail");
            assert!(matches!(err, ConfigError::UnsupportedVersion(2)));
            Ok(())
        });
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/host-telemetry.yaml"))
            .expect_err("should fail");
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("5s"), Ok(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("7"), Ok(Duration::from_secs(7)));
        assert!(parse_duration("5 fortnights").is_err());
        assert!(parse_duration("abc").is_err());
    }
}
