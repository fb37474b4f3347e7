// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Proxy control API feeds.
//!
//! Each configured feed of a `clash` input becomes its own [`StreamRunner`]
//! so one feed failing never stalls the others.

use std::fmt;

use reqwest::Url;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::websocket::StreamRunner;
use super::TaskId;
use crate::config::{invalid, ClashInput, ConfigError};

/// Upstream keys of a tracing event's `metadata` object and the flattened
/// field each one becomes.
const METADATA_FIELDS: [(&str, &str); 8] = [
    ("destinationIP", "metadata_dstip"),
    ("destinationPort", "metadata_dstport"),
    ("host", "metadata_host"),
    ("network", "metadata_network"),
    ("sourceIP", "metadata_srcip"),
    ("sourcePort", "metadata_srcport"),
    ("type", "metadata_type"),
    ("dnsMode", "metadata_dnsmode"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feed {
    Traffic,
    Tracing,
    Logs,
    Connections,
}

impl Feed {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Feed::Traffic => "traffic",
            Feed::Tracing => "tracing",
            Feed::Logs => "logs",
            Feed::Connections => "connections",
        }
    }

    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Feed::Traffic => "/traffic",
            Feed::Tracing => "/profile/tracing",
            Feed::Logs => "/logs",
            Feed::Connections => "/connections",
        }
    }

    /// Rewrites an upstream event in place before it becomes a record.
    pub fn apply(self, event: &mut Map<String, Value>, report_node: &str) {
        match self {
            Feed::Traffic => {
                event.remove("source_type");
                event.insert("type".to_string(), Value::from("traffic"));
            }
            Feed::Tracing => flatten_metadata(event),
            Feed::Logs => {
                if let Some(level) = event.remove("type") {
                    event.insert("level".to_string(), level);
                }
                event.insert("type".to_string(), Value::from("logs"));
            }
            Feed::Connections => {
                event.insert("type".to_string(), Value::from("connections"));
            }
        }
        event.insert("reportNode".to_string(), Value::from(report_node));
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tracing events keep their own `type`, and the nested `metadata` object is
/// lifted into top level `metadata_*` fields. Missing keys are skipped.
fn flatten_metadata(event: &mut Map<String, Value>) {
    let Some(Value::Object(metadata)) = event.remove("metadata") else {
        return;
    };
    for (from, to) in METADATA_FIELDS {
        if let Some(value) = metadata.get(from) {
            event.insert(to.to_string(), value.clone());
        }
    }
}

/// Builds the websocket URL of `feed` on the control API at `host`.
pub fn feed_url(host: &str, token: Option<&str>, feed: Feed) -> Result<Url, ConfigError> {
    let host = host.trim().trim_end_matches('/');
    let base = if let Some(rest) = host.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = host.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if host.starts_with("ws://") || host.starts_with("wss://") {
        host.to_string()
    } else {
        format!("ws://{host}")
    };

    let mut url = Url::parse(&format!("{base}{}", feed.path()))
        .map_err(|e| invalid(format!("clash input {host}"), e.to_string()))?;
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

/// Task identity of one feed of one control API.
#[must_use]
pub fn task_id(host: &str, feed: Feed) -> TaskId {
    TaskId::new("clash", &format!("{host}:{feed}"))
}

/// One runner per configured feed of `input`.
pub fn runners(input: &ClashInput, report_node: &str) -> Result<Vec<StreamRunner>, ConfigError> {
    input
        .feeds
        .iter()
        .map(|&feed| {
            let url = feed_url(&input.host, input.token.as_deref(), feed)?;
            let report_node = report_node.to_string();
            let runner = StreamRunner::new(
                task_id(&input.host, feed),
                url.to_string(),
                feed.name(),
                move |event: &mut Map<String, Value>| feed.apply(event, &report_node),
            )
            .with_timeouts(input.connect_timeout, input.read_timeout)
            .with_policy(input.reconnect.clone());
            Ok(runner)
        })
        .collect()
}
