// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! ICMP round trip probes.
//!
//! A probe runs the system `ping` as a long-lived child process and turns
//! every reply line into an RTT sample. The same machinery backs the plain
//! `ping` input and the per-peer probes of the mesh poller.

use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::tailscale::PollError;
use super::{TaskExit, TaskId};
use crate::queue::RecordSender;
use crate::record::{labels, now_ns, Record};

const RTT_PATTERN: &str = r"\d+ bytes from .*?: icmp_seq=\d+ ttl=\d+ time=([\d.]+) ms";
const SAMPLE_QUEUE: usize = 16;

/// Extracts the round trip time in milliseconds from one `ping` output line.
#[must_use]
pub fn parse_rtt(line: &str) -> Option<f64> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(RTT_PATTERN).ok()).as_ref()?;
    pattern.captures(line)?.get(1)?.as_str().parse().ok()
}

/// Starts a probe towards a host and yields RTT samples in milliseconds.
///
/// The channel closes when the probe ends. Dropping the receiver stops it.
pub trait Prober: Send + Sync {
    fn probe(&self, host: &str) -> Result<mpsc::Receiver<f64>, PollError>;
}

pub struct PingProber {
    program: String,
    interval: Duration,
}

impl PingProber {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        PingProber {
            program: "ping".to_string(),
            interval,
        }
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

impl Prober for PingProber {
    fn probe(&self, host: &str) -> Result<mpsc::Receiver<f64>, PollError> {
        let mut child = Command::new(&self.program)
            .arg("-i")
            .arg(self.interval.as_secs_f64().to_string())
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PollError::Spawn {
                command: self.program.clone(),
                source: e,
            })?;
        let stdout = child.stdout.take().ok_or_else(|| PollError::Spawn {
            command: self.program.clone(),
            source: std::io::Error::other("stdout not captured"),
        })?;

        let (tx, rx) = mpsc::channel(SAMPLE_QUEUE);
        let host = host.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(rtt) = parse_rtt(&line) {
                            if tx.send(rtt).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("PING | reading output for {} failed: {}", host, e);
                        break;
                    }
                }
            }
            // kill_on_drop takes the process down with the handle
            drop(child);
        });
        Ok(rx)
    }
}

/// Record of one RTT sample. The line is the RTT as a JSON number.
#[must_use]
pub fn probe_record(kind: &str, source: &str, target: &str, rtt_ms: f64) -> Record {
    let line = serde_json::Number::from_f64(rtt_ms)
        .map_or_else(|| "null".to_string(), |n| n.to_string());
    Record::new(
        labels([("type", kind), ("source", source), ("target", target)]),
        now_ns(),
        line,
    )
}

/// Forwards samples of one probe until it ends or `cancel` fires.
pub(crate) async fn forward_samples(
    mut samples: mpsc::Receiver<f64>,
    kind: &str,
    source: &str,
    target: &str,
    tx: &RecordSender,
    cancel: &CancellationToken,
) -> TaskExit {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return TaskExit::Cancelled,
            sample = samples.recv() => match sample {
                Some(rtt) => {
                    if tx.send(probe_record(kind, source, target, rtt)).await.is_err() {
                        return TaskExit::Cancelled;
                    }
                }
                None => return TaskExit::Completed,
            },
        }
    }
}

/// `ping` input: one continuous probe towards one host.
pub struct PingSource {
    id: TaskId,
    host: String,
    report_node: String,
    prober: Arc<dyn Prober>,
}

impl PingSource {
    #[must_use]
    pub fn new(host: &str, report_node: &str, prober: Arc<dyn Prober>) -> Self {
        PingSource {
            id: TaskId::new("ping", host),
            host: host.to_string(),
            report_node: report_node.to_string(),
            prober,
        }
    }

    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub async fn produce(&self, tx: RecordSender, cancel: CancellationToken) -> TaskExit {
        let samples = match self.prober.probe(&self.host) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("PING | failed to start probe to {}: {}", self.host, e);
                return TaskExit::Fatal(e.to_string());
            }
        };
        let exit =
            forward_samples(samples, "ping", &self.report_node, &self.host, &tx, &cancel).await;
        if matches!(exit, TaskExit::Completed) {
            warn!("PING | probe to {} ended", self.host);
        }
        exit
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::queue::{channel, QueueGauges};

    /// Emits a fixed list of samples for every probed host, then ends.
    pub(crate) struct FixedProber(pub Vec<f64>);

    impl Prober for FixedProber {
        fn probe(&self, _host: &str) -> Result<mpsc::Receiver<f64>, PollError> {
            let (tx, rx) = mpsc::channel(self.0.len().max(1));
            for rtt in &self.0 {
                let _ = tx.try_send(*rtt);
            }
            Ok(rx)
        }
    }

    #[test]
    fn test_parse_rtt() {
        assert_eq!(
            parse_rtt("64 bytes from 100.64.0.2: icmp_seq=3 ttl=64 time=12.4 ms"),
            Some(12.4)
        );
        assert_eq!(
            parse_rtt("64 bytes from host.ts.net (100.64.0.2): icmp_seq=1 ttl=63 time=0.051 ms"),
            Some(0.051)
        );
        assert_eq!(parse_rtt("PING 100.64.0.2 (100.64.0.2) 56(84) bytes of data."), None);
        assert_eq!(parse_rtt("Request timeout for icmp_seq 4"), None);
    }

    #[test]
    fn test_probe_record() {
        let record = probe_record("ping", "edge-1", "10.0.0.1", 12.5);
        assert_eq!(
            record.labels(),
            &labels([("type", "ping"), ("source", "edge-1"), ("target", "10.0.0.1")])
        );
        assert_eq!(record.line(), "12.5");
    }

    #[tokio::test]
    async fn test_ping_source_forwards_samples_then_completes() {
        let (tx, mut rx) = channel("test", 8, &QueueGauges::new());
        let source = PingSource::new("10.0.0.1", "edge-1", Arc::new(FixedProber(vec![1.5, 2.0])));
        assert_eq!(source.id().to_string(), "ping:10.0.0.1");

        let exit = source.produce(tx, CancellationToken::new()).await;
        assert!(matches!(exit, TaskExit::Completed));
        assert_eq!(rx.recv().await.expect("first").line(), "1.5");
        assert_eq!(rx.recv().await.expect("second").line(), "2.0");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let prober = PingProber::new(Duration::from_secs(1)).with_program("/nonexistent/ping");
        assert!(matches!(
            prober.probe("127.0.0.1"),
            Err(PollError::Spawn { .. })
        ));
    }
}
