// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record producers.
//!
//! A [`Source`] is either a push-based websocket feed or a polled control
//! loop. Both expose the same `produce` entry point so the supervisor can
//! spawn, cancel and re-spawn them without knowing what they do.

pub mod clash;
pub mod ping;
pub mod tailscale;
pub mod websocket;

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, InputConfig};
use crate::queue::RecordSender;
use ping::{PingProber, PingSource};
use tailscale::TailscalePoller;
use websocket::StreamRunner;

/// Stable identity of a source task, e.g. `clash:127.0.0.1:9090:traffic`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    #[must_use]
    pub fn new(kind: &str, name: &str) -> Self {
        TaskId(format!("{kind}:{name}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a source task returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    /// The work ran out on its own, e.g. a probe process exited.
    Completed,
    /// Unrecoverable failure, e.g. the upstream rejected our credentials.
    Fatal(String),
    /// Cancelled, or the record queue went away.
    Cancelled,
}

#[derive(Debug)]
pub enum Source {
    WebSocket(StreamRunner),
    Polled(PolledSource),
}

pub enum PolledSource {
    Tailscale(TailscalePoller),
    Ping(PingSource),
}

impl fmt::Debug for PolledSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolledSource::Tailscale(p) => f.debug_tuple("Tailscale").field(p.id()).finish(),
            PolledSource::Ping(p) => f.debug_tuple("Ping").field(p.id()).finish(),
        }
    }
}

impl Source {
    #[must_use]
    pub fn id(&self) -> &TaskId {
        match self {
            Source::WebSocket(runner) => runner.id(),
            Source::Polled(PolledSource::Tailscale(poller)) => poller.id(),
            Source::Polled(PolledSource::Ping(ping)) => ping.id(),
        }
    }

    /// Produces records into `tx` until cancelled or the source gives up.
    pub async fn produce(&self, tx: RecordSender, cancel: CancellationToken) -> TaskExit {
        match self {
            Source::WebSocket(runner) => runner.produce(tx, cancel).await,
            Source::Polled(PolledSource::Tailscale(poller)) => poller.produce(tx, cancel).await,
            Source::Polled(PolledSource::Ping(ping)) => ping.produce(tx, cancel).await,
        }
    }
}

/// Builds every source task of the configured inputs.
pub fn build_sources(inputs: &[InputConfig], report_node: &str) -> Result<Vec<Source>, ConfigError> {
    let mut sources = Vec::new();
    for input in inputs {
        match input {
            InputConfig::Clash(clash) => {
                sources.extend(clash::runners(clash, report_node)?.into_iter().map(Source::WebSocket));
            }
            InputConfig::Tailscale(ts) => sources.push(Source::Polled(PolledSource::Tailscale(
                TailscalePoller::from_config(ts, report_node),
            ))),
            InputConfig::Ping(ping) => {
                let prober = Arc::new(PingProber::new(ping.interval));
                for host in ping.targets() {
                    sources.push(Source::Polled(PolledSource::Ping(PingSource::new(
                        &host,
                        report_node,
                        prober.clone(),
                    ))));
                }
            }
        }
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClashInput, PingInput};
    use clash::Feed;
    use std::time::Duration;

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId::new("ping", "10.0.0.1").to_string(), "ping:10.0.0.1");
    }

    #[test]
    fn test_build_sources_one_task_per_feed_and_host() {
        let inputs = vec![
            InputConfig::Clash(ClashInput {
                host: "127.0.0.1:9090".to_string(),
                token: None,
                feeds: vec![Feed::Traffic, Feed::Tracing, Feed::Logs],
                connect_timeout: Duration::from_secs(10),
                read_timeout: Duration::from_secs(300),
                reconnect: websocket::ReconnectPolicy::default(),
            }),
            InputConfig::Ping(PingInput {
                hosts: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
                host: None,
                interval: Duration::from_secs(5),
            }),
        ];
        let sources = build_sources(&inputs, "edge-1").expect("sources");
        let ids: Vec<&str> = sources.iter().map(|s| s.id().as_str()).collect();
        assert_eq!(
            ids,
            [
                "clash:127.0.0.1:9090:traffic",
                "clash:127.0.0.1:9090:tracing",
                "clash:127.0.0.1:9090:logs",
                "ping:10.0.0.1",
                "ping:10.0.0.2",
            ]
        );
    }
}
