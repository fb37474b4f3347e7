// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Input and output entries of the config file.
//!
//! Each entry is `{type: <name>, ...}`. Parameters may be written inline or
//! nested under `parameters:`; both forms are merged before the entry is
//! decoded into its variant.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{deserialize_duration, deserialize_string_or_int, invalid, ConfigError};
use crate::record::Labels;
use crate::source::clash::Feed;
use crate::source::websocket::ReconnectPolicy;

pub const DEFAULT_TAILSCALE_API: &str = "https://api.tailscale.com/api/v2";

#[derive(Deserialize)]
struct RawEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    parameters: Option<Map<String, Value>>,
    #[serde(flatten)]
    inline: Map<String, Value>,
}

impl RawEntry {
    fn into_value(self) -> Value {
        let mut map = self.inline;
        if let Some(parameters) = self.parameters {
            map.extend(parameters);
        }
        map.insert("type".to_string(), Value::String(self.kind));
        Value::Object(map)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawEntry")]
pub enum InputConfig {
    Clash(ClashInput),
    Tailscale(TailscaleInput),
    Ping(PingInput),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedInput {
    Clash(ClashInput),
    Tailscale(TailscaleInput),
    Ping(PingInput),
}

impl TryFrom<RawEntry> for InputConfig {
    type Error = String;

    fn try_from(raw: RawEntry) -> Result<Self, Self::Error> {
        let kind = raw.kind.clone();
        let tagged: TaggedInput = serde_json::from_value(raw.into_value())
            .map_err(|e| format!("input '{kind}': {e}"))?;
        Ok(match tagged {
            TaggedInput::Clash(c) => InputConfig::Clash(c),
            TaggedInput::Tailscale(t) => InputConfig::Tailscale(t),
            TaggedInput::Ping(p) => InputConfig::Ping(p),
        })
    }
}

impl InputConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            InputConfig::Clash(c) => {
                if c.host.trim().is_empty() {
                    return Err(invalid("clash input", "host must not be empty"));
                }
                if c.feeds.is_empty() {
                    return Err(invalid(
                        format!("clash input {}", c.host),
                        "feeds must not be empty",
                    ));
                }
            }
            InputConfig::Tailscale(t) => {
                if t.tsnet.is_some() != t.api_key.is_some() {
                    return Err(invalid(
                        "tailscale input",
                        "tsnet and api_key must be set together",
                    ));
                }
                if t.poll_interval.is_zero() {
                    return Err(invalid("tailscale input", "poll_interval must be positive"));
                }
            }
            InputConfig::Ping(p) => {
                if p.targets().is_empty() {
                    return Err(invalid("ping input", "at least one host is required"));
                }
            }
        }
        Ok(())
    }
}

/// Proxy control API whose websocket feeds are followed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClashInput {
    pub host: String,
    #[serde(default, deserialize_with = "deserialize_optional_token")]
    pub token: Option<String>,
    #[serde(default = "default_feeds")]
    pub feeds: Vec<Feed>,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_timeout: Duration,
    #[serde(
        default = "default_read_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub read_timeout: Duration,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

/// Mesh network polled through the CLI, or the REST API when `tsnet` and
/// `api_key` are given.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TailscaleInput {
    #[serde(default)]
    pub tsnet: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_tailscale_api")]
    pub api_base: String,
    #[serde(default = "default_tailscale_cli")]
    pub cli: String,
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub poll_interval: Duration,
    #[serde(
        default = "default_command_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub command_timeout: Duration,
    #[serde(
        default = "default_probe_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub probe_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PingInput {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(
        default = "default_probe_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub interval: Duration,
}

impl PingInput {
    /// `hosts` plus the single `host` shorthand, without duplicates.
    #[must_use]
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for host in self.hosts.iter().chain(self.host.iter()) {
            let host = host.trim();
            if !host.is_empty() && !targets.iter().any(|t| t == host) {
                targets.push(host.to_string());
            }
        }
        targets
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawEntry")]
pub enum OutputConfig {
    Loki(LokiOutput),
    File(FileOutput),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedOutput {
    Loki(LokiOutput),
    File(FileOutput),
}

impl TryFrom<RawEntry> for OutputConfig {
    type Error = String;

    fn try_from(raw: RawEntry) -> Result<Self, Self::Error> {
        let kind = raw.kind.clone();
        let tagged: TaggedOutput = serde_json::from_value(raw.into_value())
            .map_err(|e| format!("output '{kind}': {e}"))?;
        Ok(match tagged {
            TaggedOutput::Loki(l) => OutputConfig::Loki(l),
            TaggedOutput::File(f) => OutputConfig::File(f),
        })
    }
}

impl OutputConfig {
    #[must_use]
    pub fn buffer(&self) -> &BufferConfig {
        match self {
            OutputConfig::Loki(l) => &l.buffer,
            OutputConfig::File(f) => &f.buffer,
        }
    }

    /// Short name used for task identity and queue gauges.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            OutputConfig::Loki(l) => format!("loki:{}", l.host),
            OutputConfig::File(f) => format!("file:{}", f.filename.display()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let buffer = self.buffer();
        if buffer.capacity == 0 {
            return Err(invalid(self.name(), "capacity must be greater than zero"));
        }
        if buffer.buffer_limit < buffer.capacity {
            return Err(invalid(self.name(), "buffer_limit must be at least capacity"));
        }
        if buffer.flush_timeout.is_zero() {
            return Err(invalid(self.name(), "flush_timeout must be positive"));
        }
        if let OutputConfig::Loki(l) = self {
            if l.host.trim().is_empty() {
                return Err(invalid("loki output", "host must not be empty"));
            }
            if l.compression_level > 9 {
                return Err(invalid(self.name(), "compression_level must be 0..=9"));
            }
        }
        Ok(())
    }
}

/// Flush thresholds shared by every output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(
        default = "default_flush_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub flush_timeout: Duration,
    #[serde(default = "default_buffer_limit")]
    pub buffer_limit: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            capacity: default_capacity(),
            flush_timeout: default_flush_timeout(),
            buffer_limit: default_buffer_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LokiOutput {
    pub host: String,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub user_id: String,
    pub api_key: String,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default)]
    pub labels: Labels,
    #[serde(
        default = "default_push_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub push_timeout: Duration,
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    #[serde(flatten)]
    pub buffer: BufferConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileOutput {
    pub filename: PathBuf,
    #[serde(flatten)]
    pub buffer: BufferConfig,
}

fn deserialize_optional_token<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn default_feeds() -> Vec<Feed> {
    vec![Feed::Traffic, Feed::Tracing]
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_tailscale_api() -> String {
    DEFAULT_TAILSCALE_API.to_string()
}

fn default_tailscale_cli() -> String {
    "tailscale".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_capacity() -> usize {
    40
}

fn default_flush_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_buffer_limit() -> usize {
    10_000
}

fn default_push_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_compression_level() -> u32 {
    9
}

fn default_true() -> bool {
    true
}
