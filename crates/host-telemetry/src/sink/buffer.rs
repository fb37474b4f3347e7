// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::record::Record;

/// Unsent records of one sink and the flush policy over them.
///
/// A flush is due when `len() >= capacity` or when `flush_timeout` has passed
/// since the last flush. After a failed push the count trigger is held off
/// until the timeout elapses again, so a full buffer does not hammer a
/// failing endpoint.
#[derive(Debug)]
pub struct SinkBuffer {
    records: VecDeque<Record>,
    capacity: usize,
    flush_timeout: Duration,
    last_flush: Instant,
    retry_after: Option<Instant>,
}

impl SinkBuffer {
    #[must_use]
    pub fn new(capacity: usize, flush_timeout: Duration) -> Self {
        SinkBuffer {
            records: VecDeque::new(),
            capacity: capacity.max(1),
            flush_timeout,
            last_flush: Instant::now(),
            retry_after: None,
        }
    }

    pub fn push(&mut self, record: Record) {
        self.records.push_back(record);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn should_flush(&self, now: Instant) -> bool {
        if self.retry_after.is_some_and(|t| now < t) {
            return false;
        }
        self.records.len() >= self.capacity
            || now.saturating_duration_since(self.last_flush) >= self.flush_timeout
    }

    /// When the time trigger fires next.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.last_flush + self.flush_timeout
    }

    /// Takes the oldest records, at most `capacity` of them. Records pushed
    /// afterwards belong to the next batch.
    pub fn drain_batch(&mut self, now: Instant) -> Vec<Record> {
        let n = self.records.len().min(self.capacity);
        self.mark_flushed(now);
        self.records.drain(..n).collect()
    }

    /// Restarts the time trigger without draining.
    pub fn mark_flushed(&mut self, now: Instant) {
        self.last_flush = now;
        self.retry_after = None;
    }

    /// Puts records from a failed push back at the head, in their original
    /// order, and holds off the next attempt for one flush timeout.
    pub fn requeue_front(&mut self, records: Vec<Record>, now: Instant) {
        for record in records.into_iter().rev() {
            self.records.push_front(record);
        }
        self.last_flush = now;
        self.retry_after = Some(now + self.flush_timeout);
    }
}
