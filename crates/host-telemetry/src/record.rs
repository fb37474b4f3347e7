// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

/// Label set of a record. Ordered so that equal sets compare and hash equal
/// regardless of insertion order.
pub type Labels = BTreeMap<String, String>;

/// Label keys lifted out of a JSON event into the record's label set.
pub const LIFTED_LABELS: [&str; 2] = ["type", "reportNode"];

/// One observed event: a traffic sample, a log line, a probe RTT, a status dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    labels: Labels,
    timestamp_ns: i64,
    line: String,
}

impl Record {
    #[must_use]
    pub fn new(labels: Labels, timestamp_ns: i64, line: String) -> Self {
        Record {
            labels,
            timestamp_ns,
            line,
        }
    }

    /// Builds a record from a transformed JSON event.
    ///
    /// `type` and `reportNode` become labels, the remaining object is the line.
    /// `default_type` is used when the event has no string `type`.
    #[must_use]
    pub fn from_event(mut event: Map<String, Value>, default_type: &str, timestamp_ns: i64) -> Self {
        let mut labels = Labels::new();
        for key in LIFTED_LABELS {
            if let Some(value) = event.remove(key) {
                labels.insert(key.to_string(), label_value(value));
            }
        }
        labels
            .entry("type".to_string())
            .or_insert_with(|| default_type.to_string());
        let line = Value::Object(event).to_string();
        Record::new(labels, timestamp_ns, line)
    }

    #[must_use]
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    #[must_use]
    pub fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }

    #[must_use]
    pub fn line(&self) -> &str {
        &self.line
    }
}

fn label_value(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Current wall clock time in nanoseconds since the unix epoch.
#[must_use]
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Shorthand for building a label set from pairs.
#[must_use]
pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
