// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mesh VPN poller.
//!
//! ```text
//!   every poll_interval:
//!     status   ──> tailscale_status record ──> ensure one probe per peer
//!     netcheck ──> tailscale_netcheck record
//!
//!   probe_<ip>: ping -i <probe_interval> <ip> ──> tailscale_ping records
//! ```
//!
//! Peers come from `tailscale status --json`, or from the REST API when a
//! tailnet and API key are configured. A failed poll is logged and skipped;
//! the next cycle tries again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::ping::{forward_samples, PingProber, Prober};
use super::{TaskExit, TaskId};
use crate::config::TailscaleInput;
use crate::queue::RecordSender;
use crate::record::{labels, now_ns, Record};

/// Devices not seen for longer than this are not probed.
const DEVICE_MAX_AGE_MINUTES: i64 = 120;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} did not finish within {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("{command} exited with {code:?}: {stderr}")]
    ExitStatus {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("failed to decode output: {0}")]
    Decode(String),
    #[error("mesh API request failed: {0}")]
    Http(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip: String,
    pub hostname: String,
}

/// Result of one status query.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshStatus {
    pub self_hostname: String,
    pub peers: Vec<Peer>,
    /// Unmodified status document, shipped as the record line.
    pub raw: Value,
}

#[async_trait]
pub trait MeshStatusProvider: Send + Sync {
    async fn status(&self) -> Result<MeshStatus, PollError>;
    async fn netcheck(&self) -> Result<Value, PollError>;
}

/// Runs the mesh CLI.
pub struct CliStatusProvider {
    cli: String,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CliStatus {
    #[serde(rename = "Self")]
    self_node: CliNode,
    // `null` when the node has no peers
    #[serde(default)]
    peer: Option<HashMap<String, CliNode>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CliNode {
    #[serde(default)]
    host_name: String,
    #[serde(rename = "TailscaleIPs", default)]
    tailscale_ips: Option<Vec<String>>,
}

impl CliStatusProvider {
    #[must_use]
    pub fn new(cli: impl Into<String>, timeout: Duration) -> Self {
        CliStatusProvider {
            cli: cli.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, PollError> {
        let command = format!("{} {}", self.cli, args.join(" "));
        let output = timeout(
            self.timeout,
            Command::new(&self.cli).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| PollError::Timeout {
            command: command.clone(),
            after: self.timeout,
        })?
        .map_err(|source| PollError::Spawn {
            command: command.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(PollError::ExitStatus {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        String::from_utf8(output.stdout).map_err(|e| PollError::Decode(e.to_string()))
    }
}

/// Parses `tailscale status --json` output.
pub fn parse_cli_status(stdout: &str) -> Result<MeshStatus, PollError> {
    let raw: Value = serde_json::from_str(stdout).map_err(|e| PollError::Decode(e.to_string()))?;
    let status: CliStatus =
        serde_json::from_value(raw.clone()).map_err(|e| PollError::Decode(e.to_string()))?;

    let mut peers: Vec<Peer> = status
        .peer
        .unwrap_or_default()
        .into_values()
        .filter_map(|node| {
            let ip = first_ipv4(node.tailscale_ips.as_deref().unwrap_or_default())?;
            Some(Peer {
                ip,
                hostname: node.host_name,
            })
        })
        .collect();
    peers.sort_by(|a, b| a.ip.cmp(&b.ip));

    Ok(MeshStatus {
        self_hostname: status.self_node.host_name,
        peers,
        raw,
    })
}

fn first_ipv4(addresses: &[String]) -> Option<String> {
    addresses
        .iter()
        .find(|a| a.parse::<std::net::Ipv4Addr>().is_ok())
        .cloned()
}

#[async_trait]
impl MeshStatusProvider for CliStatusProvider {
    async fn status(&self) -> Result<MeshStatus, PollError> {
        parse_cli_status(&self.run(&["status", "--json", "--active"]).await?)
    }

    async fn netcheck(&self) -> Result<Value, PollError> {
        let stdout = self.run(&["netcheck", "--format=json-line"]).await?;
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default();
        serde_json::from_str(line).map_err(|e| PollError::Decode(e.to_string()))
    }
}

/// Lists devices through the mesh REST API. Netcheck still goes through the
/// CLI since the API has no equivalent.
pub struct ApiStatusProvider {
    client: reqwest::Client,
    devices_url: String,
    api_key: String,
    self_hostname: String,
    timeout: Duration,
    cli: CliStatusProvider,
}

#[derive(Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<Device>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Device {
    #[serde(default)]
    addresses: Vec<String>,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    last_seen: Option<DateTime<Utc>>,
}

impl ApiStatusProvider {
    #[must_use]
    pub fn new(
        api_base: &str,
        tsnet: &str,
        api_key: &str,
        self_hostname: &str,
        cli: CliStatusProvider,
        timeout: Duration,
    ) -> Self {
        ApiStatusProvider {
            client: reqwest::Client::new(),
            devices_url: format!(
                "{}/tailnet/{}/devices",
                api_base.trim_end_matches('/'),
                tsnet
            ),
            api_key: api_key.to_string(),
            self_hostname: self_hostname.to_string(),
            timeout,
            cli,
        }
    }
}

/// Builds the mesh status from a device list, skipping the local device and
/// devices not seen within the last two hours.
fn status_from_devices(raw: Value, self_hostname: &str, now: DateTime<Utc>) -> Result<MeshStatus, PollError> {
    let list: DeviceList =
        serde_json::from_value(raw.clone()).map_err(|e| PollError::Decode(e.to_string()))?;
    let max_age = chrono::Duration::minutes(DEVICE_MAX_AGE_MINUTES);

    let peers = list
        .devices
        .into_iter()
        .filter(|d| d.hostname != self_hostname)
        .filter(|d| d.last_seen.is_some_and(|seen| now - seen <= max_age))
        .filter_map(|d| {
            Some(Peer {
                ip: first_ipv4(&d.addresses)?,
                hostname: d.hostname,
            })
        })
        .collect();

    Ok(MeshStatus {
        self_hostname: self_hostname.to_string(),
        peers,
        raw,
    })
}

#[async_trait]
impl MeshStatusProvider for ApiStatusProvider {
    async fn status(&self) -> Result<MeshStatus, PollError> {
        let resp = self
            .client
            .get(&self.devices_url)
            .basic_auth(&self.api_key, Some(""))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| PollError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PollError::Http(format!("{status}: {body}")));
        }
        let raw: Value = resp
            .json()
            .await
            .map_err(|e| PollError::Decode(e.to_string()))?;
        status_from_devices(raw, &self.self_hostname, Utc::now())
    }

    async fn netcheck(&self) -> Result<Value, PollError> {
        self.cli.netcheck().await
    }
}

/// Probe tasks keyed by identity. At most one live task per key.
pub struct ProbeRegistry {
    tasks: HashMap<String, JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ProbeRegistry {
    #[must_use]
    pub fn new(parent: &CancellationToken) -> Self {
        ProbeRegistry {
            tasks: HashMap::new(),
            cancel: parent.child_token(),
        }
    }

    /// Spawns the task for `key` unless a live one exists. Finished tasks
    /// are replaced. Returns whether a task was spawned.
    pub fn ensure<F>(&mut self, key: &str, spawn: F) -> bool
    where
        F: FnOnce(CancellationToken) -> JoinHandle<()>,
    {
        if self.tasks.get(key).is_some_and(|h| !h.is_finished()) {
            return false;
        }
        let handle = spawn(self.cancel.child_token());
        self.tasks.insert(key.to_string(), handle);
        true
    }

    #[must_use]
    pub fn live(&self) -> usize {
        self.tasks.values().filter(|h| !h.is_finished()).count()
    }

    /// Tracked handles, finished or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Forgets finished tasks whose key is not in `current`. Running tasks
    /// are kept. Returns how many handles were dropped.
    pub fn prune(&mut self, current: &HashSet<String>) -> usize {
        let before = self.tasks.len();
        self.tasks
            .retain(|key, handle| !handle.is_finished() || current.contains(key));
        before - self.tasks.len()
    }

    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        self.tasks.clear();
    }
}

/// `tailscale` input: periodic status and netcheck, plus a probe per peer.
pub struct TailscalePoller {
    id: TaskId,
    provider: Arc<dyn MeshStatusProvider>,
    prober: Arc<dyn Prober>,
    poll_interval: Duration,
    report_node: String,
}

impl TailscalePoller {
    #[must_use]
    pub fn new(
        id: TaskId,
        provider: Arc<dyn MeshStatusProvider>,
        prober: Arc<dyn Prober>,
        poll_interval: Duration,
        report_node: &str,
    ) -> Self {
        TailscalePoller {
            id,
            provider,
            prober,
            poll_interval,
            report_node: report_node.to_string(),
        }
    }

    /// Poller for a configured input: REST API when `tsnet` and `api_key`
    /// are both set, CLI otherwise.
    #[must_use]
    pub fn from_config(input: &TailscaleInput, report_node: &str) -> Self {
        let cli = CliStatusProvider::new(input.cli.clone(), input.command_timeout);
        let (id, provider): (TaskId, Arc<dyn MeshStatusProvider>) =
            match (&input.tsnet, &input.api_key) {
                (Some(tsnet), Some(api_key)) => (
                    TaskId::new("tailscale", tsnet),
                    Arc::new(ApiStatusProvider::new(
                        &input.api_base,
                        tsnet,
                        api_key,
                        report_node,
                        cli,
                        input.command_timeout,
                    )),
                ),
                _ => (TaskId::new("tailscale", "local"), Arc::new(cli)),
            };
        TailscalePoller::new(
            id,
            provider,
            Arc::new(PingProber::new(input.probe_interval)),
            input.poll_interval,
            report_node,
        )
    }

    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub async fn produce(&self, tx: RecordSender, cancel: CancellationToken) -> TaskExit {
        let mut registry = ProbeRegistry::new(&cancel);
        let mut source = self.report_node.clone();
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                () = cancel.cancelled() => break TaskExit::Cancelled,
                _ = ticker.tick() => {}
            }
            if !self.poll_once(&tx, &mut registry, &mut source).await {
                break TaskExit::Cancelled;
            }
        };
        registry.shutdown();
        exit
    }

    /// One status and netcheck cycle. `source` keeps the last known mesh
    /// hostname across cycles. Returns false once the record queue is closed.
    async fn poll_once(
        &self,
        tx: &RecordSender,
        registry: &mut ProbeRegistry,
        source: &mut String,
    ) -> bool {
        match self.provider.status().await {
            Ok(status) => {
                if !status.self_hostname.is_empty() {
                    source.clone_from(&status.self_hostname);
                }
                let record = Record::new(
                    labels([("type", "tailscale_status"), ("source", source.as_str())]),
                    now_ns(),
                    status.raw.to_string(),
                );
                if tx.send(record).await.is_err() {
                    return false;
                }
                let current: HashSet<String> =
                    status.peers.iter().map(|p| probe_key(&p.ip)).collect();
                let dropped = registry.prune(&current);
                if dropped > 0 {
                    debug!("TAILSCALE | forgot {} finished probes of departed peers", dropped);
                }
                let mut spawned = 0;
                for peer in status.peers {
                    if self.ensure_probe(registry, peer, source, tx) {
                        spawned += 1;
                    }
                }
                if spawned > 0 {
                    info!(
                        "TAILSCALE | started {} probes, {} running",
                        spawned,
                        registry.live()
                    );
                }
            }
            Err(e) => error!("TAILSCALE | status refresh failed: {}", e),
        }

        match self.provider.netcheck().await {
            Ok(report) => {
                let record = Record::new(
                    labels([("type", "tailscale_netcheck"), ("source", source.as_str())]),
                    now_ns(),
                    report.to_string(),
                );
                if tx.send(record).await.is_err() {
                    return false;
                }
            }
            Err(e) => error!("TAILSCALE | netcheck failed: {}", e),
        }
        true
    }

    fn ensure_probe(
        &self,
        registry: &mut ProbeRegistry,
        peer: Peer,
        source: &str,
        tx: &RecordSender,
    ) -> bool {
        let key = probe_key(&peer.ip);
        let prober = Arc::clone(&self.prober);
        let source = source.to_string();
        let tx = tx.clone();
        registry.ensure(&key, move |cancel| {
            tokio::spawn(async move {
                let samples = match prober.probe(&peer.ip) {
                    Ok(samples) => samples,
                    Err(e) => {
                        error!("TAILSCALE | probe to {} failed to start: {}", peer.ip, e);
                        return;
                    }
                };
                let target = if peer.hostname.is_empty() {
                    peer.ip.as_str()
                } else {
                    peer.hostname.as_str()
                };
                let exit =
                    forward_samples(samples, "tailscale_ping", &source, target, &tx, &cancel).await;
                debug!("TAILSCALE | probe to {} stopped: {:?}", peer.ip, exit);
            })
        })
    }
}

fn probe_key(ip: &str) -> String {
    format!("probe_{ip}")
}
