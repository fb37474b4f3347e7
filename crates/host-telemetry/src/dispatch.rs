// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single consumer of the fan-in queue. Hands every record to every sink
//! queue, preserving arrival order per sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::queue::{RecordReceiver, RecordSender};
use crate::record::Record;

pub struct Dispatcher {
    rx: RecordReceiver,
    sinks: Vec<(String, RecordSender)>,
    dispatched: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        rx: RecordReceiver,
        sinks: Vec<(String, RecordSender)>,
        dispatched: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) -> Self {
        Dispatcher {
            rx,
            sinks,
            dispatched,
            cancel,
        }
    }

    /// Runs until cancelled or every producer is gone, then forwards what is
    /// already queued. Dropping the dispatcher closes the sink queues, which
    /// starts their final flush.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                maybe = self.rx.recv() => match maybe {
                    Some(record) => self.forward(record).await,
                    None => break,
                },
            }
        }

        self.rx.close();
        let mut drained = 0;
        while let Some(record) = self.rx.recv().await {
            self.forward(record).await;
            drained += 1;
        }
        debug!("DISPATCH | stopped, forwarded {} queued records on the way out", drained);
    }

    async fn forward(&self, record: Record) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let Some(((last_name, last), rest)) = self.sinks.split_last() else {
            return;
        };
        for (name, sink) in rest {
            if sink.send(record.clone()).await.is_err() {
                warn!("DISPATCH | sink {} is gone, record not delivered to it", name);
            }
        }
        if last.send(record).await.is_err() {
            warn!("DISPATCH | sink {} is gone, record not delivered to it", last_name);
        }
    }
}
