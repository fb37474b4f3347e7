// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded record channels and the registry of named queue depths.
//!
//! Every queue in the pipeline registers a depth probe here so the watchdog
//! report can list them without owning them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::record::Record;

pub type RecordSender = mpsc::Sender<Record>;
pub type RecordReceiver = mpsc::Receiver<Record>;

/// Name of the shared queue every source writes into.
pub const FAN_IN_QUEUE: &str = "fan_in";

/// Something whose current depth can be sampled.
pub trait Depth: Send + Sync {
    fn depth(&self) -> usize;
}

/// Depth of a bounded channel, held weakly so the gauge never keeps the
/// channel open.
struct ChannelDepth(mpsc::WeakSender<Record>);

impl Depth for ChannelDepth {
    fn depth(&self) -> usize {
        self.0
            .upgrade()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }
}

/// A depth maintained by its owner, e.g. a sink buffer.
#[derive(Debug, Clone, Default)]
pub struct Gauge(Arc<AtomicUsize>);

impl Gauge {
    pub fn set(&self, value: usize) {
        self.0.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

impl Depth for Gauge {
    fn depth(&self) -> usize {
        self.get()
    }
}

/// Registry of named queue depths, cheap to clone.
#[derive(Clone, Default)]
pub struct QueueGauges {
    inner: Arc<Mutex<BTreeMap<String, Arc<dyn Depth>>>>,
}

impl QueueGauges {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, depth: Arc<dyn Depth>) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(name.into(), depth);
        }
    }

    /// Registers and returns a fresh owner-maintained gauge.
    #[must_use]
    pub fn gauge(&self, name: impl Into<String>) -> Gauge {
        let gauge = Gauge::default();
        self.register(name, Arc::new(gauge.clone()));
        gauge
    }

    /// Current depth of every registered queue, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, usize)> {
        self.inner.lock().map_or_else(
            |_| Vec::new(),
            |map| map.iter().map(|(k, v)| (k.clone(), v.depth())).collect(),
        )
    }
}

/// Creates a bounded record channel and registers its depth under `name`.
///
/// Senders block when the channel is full; records are never dropped.
#[must_use]
pub fn channel(
    name: impl Into<String>,
    capacity: usize,
    gauges: &QueueGauges,
) -> (RecordSender, RecordReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    gauges.register(name, Arc::new(ChannelDepth(tx.downgrade())));
    (tx, rx)
}
