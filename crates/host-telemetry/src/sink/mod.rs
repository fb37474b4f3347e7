// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching sinks.
//!
//! A [`SinkService`] is the single consumer of one sink queue. It buffers
//! records in a [`SinkBuffer`], and when a flush is due it hands at most
//! `capacity` records to a background task that ships them through a
//! [`Shipper`]. Only one flush runs at a time per sink and accumulation keeps
//! going while it is in flight. Records of a failed push come back with the
//! task result and go back to the head of the buffer, so a detected failure
//! never drops data.

pub mod buffer;
pub mod file;
pub mod loki;

use std::future::pending;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::config::BufferConfig;
use crate::queue::{Gauge, QueueGauges, RecordReceiver};
use crate::record::Record;
pub use buffer::SinkBuffer;

#[derive(Debug, Error)]
pub enum ShipError {
    #[error("failed to build payload: {0}")]
    Payload(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("push rejected with status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShipError {
    /// Credentials were rejected. Retrying will not help until they change.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ShipError::Status { status, .. }
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
        )
    }
}

/// Destination of flushed batches.
#[async_trait]
pub trait Shipper: Send + Sync {
    fn name(&self) -> &str;

    async fn ship(&self, batch: &Batch) -> Result<(), ShipError>;
}

/// Counters shared between a sink and whoever reports on it.
#[derive(Debug, Clone, Default)]
pub struct SinkStats {
    pushed: Arc<AtomicU64>,
    failed_flushes: Arc<AtomicU64>,
    total_pushed: Arc<AtomicU64>,
}

impl SinkStats {
    /// Stats that also add to a process-wide pushed counter.
    #[must_use]
    pub fn with_total(total_pushed: Arc<AtomicU64>) -> Self {
        SinkStats {
            total_pushed,
            ..SinkStats::default()
        }
    }

    fn record_pushed(&self, n: usize) {
        let n = n as u64;
        self.pushed.fetch_add(n, Ordering::Relaxed);
        self.total_pushed.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed_flushes(&self) -> u64 {
        self.failed_flushes.load(Ordering::Relaxed)
    }
}

pub struct SinkConfig {
    pub name: String,
    pub shipper: Arc<dyn Shipper>,
    pub buffer: BufferConfig,
    pub shutdown_timeout: Duration,
    pub stats: SinkStats,
}

/// Cheap handle to a running sink.
#[derive(Clone)]
pub struct SinkHandle {
    name: String,
    stats: SinkStats,
    buffered: Gauge,
    cancel: CancellationToken,
}

impl SinkHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffered.get()
    }

    /// Stops accumulating and starts the final flush.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

enum FlushOutcome {
    Shipped(usize),
    Failed(Vec<Record>, ShipError),
}

pub struct SinkService {
    name: String,
    shipper: Arc<dyn Shipper>,
    buffer: SinkBuffer,
    buffer_limit: usize,
    rx: RecordReceiver,
    stats: SinkStats,
    buffered: Gauge,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
}

impl SinkService {
    #[must_use]
    pub fn new(config: SinkConfig, rx: RecordReceiver, gauges: &QueueGauges) -> (Self, SinkHandle) {
        let buffered = gauges.gauge(format!("{}.buffer", config.name));
        let cancel = CancellationToken::new();
        let handle = SinkHandle {
            name: config.name.clone(),
            stats: config.stats.clone(),
            buffered: buffered.clone(),
            cancel: cancel.clone(),
        };
        let service = SinkService {
            name: config.name,
            shipper: config.shipper,
            buffer: SinkBuffer::new(config.buffer.capacity, config.buffer.flush_timeout),
            buffer_limit: config.buffer.buffer_limit.max(config.buffer.capacity),
            rx,
            stats: config.stats,
            buffered,
            cancel,
            shutdown_timeout: config.shutdown_timeout,
        };
        (service, handle)
    }

    /// Runs until cancelled or until the sink queue closes, then makes one
    /// last flush bounded by the shutdown timeout.
    pub async fn run(mut self) {
        debug!("SINK | {} started", self.name);
        let mut in_flight: Option<JoinHandle<FlushOutcome>> = None;

        loop {
            let deadline = self.buffer.deadline();
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                joined = wait_in_flight(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    self.complete_flush(joined);
                }
                maybe = self.rx.recv(), if self.buffer.len() < self.buffer_limit => {
                    match maybe {
                        Some(record) => self.buffer.push(record),
                        None => {
                            debug!("SINK | {} queue closed", self.name);
                            break;
                        }
                    }
                }
                () = sleep_until(deadline), if in_flight.is_none() => {
                    if self.buffer.is_empty() {
                        self.buffer.mark_flushed(Instant::now());
                    }
                }
            }

            if in_flight.is_none()
                && !self.buffer.is_empty()
                && self.buffer.should_flush(Instant::now())
            {
                in_flight = Some(self.spawn_flush());
            }
            self.buffered.set(self.buffer.len());
        }

        self.shutdown(in_flight).await;
    }

    fn spawn_flush(&mut self) -> JoinHandle<FlushOutcome> {
        let records = self.buffer.drain_batch(Instant::now());
        let shipper = Arc::clone(&self.shipper);
        tokio::spawn(async move {
            let batch = Batch::from_records(&records);
            match ship_caught(shipper.as_ref(), &batch).await {
                Ok(()) => FlushOutcome::Shipped(records.len()),
                Err(e) => FlushOutcome::Failed(records, e),
            }
        })
    }

    fn complete_flush(&mut self, joined: Result<FlushOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(FlushOutcome::Shipped(n)) => {
                self.stats.record_pushed(n);
                debug!("SINK | {} flushed {} records", self.name, n);
            }
            Ok(FlushOutcome::Failed(records, e)) => {
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                if e.is_auth() {
                    error!(
                        "SINK | {} push denied, requeueing {} records: {}",
                        self.name,
                        records.len(),
                        e
                    );
                } else {
                    warn!(
                        "SINK | {} push failed, requeueing {} records: {}",
                        self.name,
                        records.len(),
                        e
                    );
                }
                self.buffer.requeue_front(records, Instant::now());
            }
            // the flush task owns the records, so they are gone with it
            Err(e) => {
                error!("SINK | {} flush task failed, its batch is lost: {}", self.name, e);
            }
        }
    }

    async fn shutdown(&mut self, in_flight: Option<JoinHandle<FlushOutcome>>) {
        let deadline = Instant::now() + self.shutdown_timeout;
        info!(
            "SINK | {} shutting down, {} records buffered",
            self.name,
            self.buffer.len()
        );

        if let Some(mut handle) = in_flight {
            match timeout(deadline.saturating_duration_since(Instant::now()), &mut handle).await {
                Ok(joined) => self.complete_flush(joined),
                Err(_) => {
                    warn!("SINK | {} in-flight flush did not finish before the deadline", self.name);
                    handle.abort();
                }
            }
        }

        while let Ok(record) = self.rx.try_recv() {
            self.buffer.push(record);
        }

        while !self.buffer.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let records = self.buffer.drain_batch(Instant::now());
            let batch = Batch::from_records(&records);
            match timeout(remaining, ship_caught(self.shipper.as_ref(), &batch)).await {
                Ok(Ok(())) => self.stats.record_pushed(records.len()),
                Ok(Err(e)) => {
                    warn!("SINK | {} final flush failed: {}", self.name, e);
                    self.buffer.requeue_front(records, Instant::now());
                    break;
                }
                Err(_) => {
                    warn!("SINK | {} final flush timed out", self.name);
                    self.buffer.requeue_front(records, Instant::now());
                    break;
                }
            }
        }

        self.buffered.set(self.buffer.len());
        if self.buffer.is_empty() {
            info!("SINK | {} stopped, total pushed {}", self.name, self.stats.pushed());
        } else {
            warn!(
                "SINK | {} stopped with {} unsent records",
                self.name,
                self.buffer.len()
            );
        }
    }
}

/// Ships `batch`, turning a panicking shipper into a transport error so the
/// caller keeps its records.
async fn ship_caught(shipper: &dyn Shipper, batch: &Batch) -> Result<(), ShipError> {
    match AssertUnwindSafe(shipper.ship(batch)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ShipError::Transport(format!("shipper panicked: {reason}")))
        }
    }
}

async fn wait_in_flight(
    in_flight: &mut Option<JoinHandle<FlushOutcome>>,
) -> Result<FlushOutcome, tokio::task::JoinError> {
    match in_flight {
        Some(handle) => handle.await,
        None => pending().await,
    }
}
