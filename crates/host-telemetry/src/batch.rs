// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Grouping of records into label-set streams and the Loki push payload.
//!
//! The push API bills per distinct label set, so records sharing labels are
//! sent as one stream:
//!
//! ```json
//! {"streams":[{"stream":{"type":"traffic"},"values":[["1700000000000000000","{\"up\":1}"]]}]}
//! ```

use std::collections::HashMap;

use serde::Serialize;

use crate::record::{Labels, Record};

/// Records grouped by identical label set.
///
/// Groups keep first-seen order and values keep arrival order. Nothing is
/// re-sorted by timestamp.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Batch {
    groups: Vec<(Labels, Vec<(i64, String)>)>,
    len: usize,
}

impl Batch {
    #[must_use]
    pub fn from_records(records: &[Record]) -> Self {
        let mut index: HashMap<&Labels, usize> = HashMap::new();
        let mut groups: Vec<(Labels, Vec<(i64, String)>)> = Vec::new();
        for record in records {
            let slot = *index.entry(record.labels()).or_insert_with(|| {
                groups.push((record.labels().clone(), Vec::new()));
                groups.len() - 1
            });
            groups[slot]
                .1
                .push((record.timestamp_ns(), record.line().to_string()));
        }
        Batch {
            groups,
            len: records.len(),
        }
    }

    #[must_use]
    pub fn groups(&self) -> &[(Labels, Vec<(i64, String)>)] {
        &self.groups
    }

    /// Number of values across all groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Builds the push payload. `extra_labels` are merged into every stream
    /// and win over record labels with the same key.
    #[must_use]
    pub fn to_push_request(&self, extra_labels: &Labels) -> PushRequest {
        let streams = self
            .groups
            .iter()
            .map(|(labels, values)| {
                let mut stream = labels.clone();
                stream.extend(extra_labels.iter().map(|(k, v)| (k.clone(), v.clone())));
                PushStream {
                    stream,
                    values: values
                        .iter()
                        .map(|(ts, line)| [ts.to_string(), line.clone()])
                        .collect(),
                }
            })
            .collect();
        PushRequest { streams }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct PushRequest {
    pub streams: Vec<PushStream>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct PushStream {
    pub stream: Labels,
    pub values: Vec<[String; 2]>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::labels;
    use proptest::prelude::*;

    fn record(kind: &str, ts: i64) -> Record {
        Record::new(labels([("type", kind)]), ts, format!("line-{ts}"))
    }

    #[test]
    fn test_groups_by_label_set() {
        let records = vec![
            record("traffic", 1),
            record("logs", 2),
            record("traffic", 3),
        ];
        let batch = Batch::from_records(&records);

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.groups().len(), 2);
        let (labels_0, values_0) = &batch.groups()[0];
        assert_eq!(labels_0.get("type").map(String::as_str), Some("traffic"));
        assert_eq!(
            values_0,
            &vec![(1, "line-1".to_string()), (3, "line-3".to_string())]
        );
    }

    #[test]
    fn test_push_request_json_shape() {
        let batch = Batch::from_records(&[Record::new(
            labels([("type", "traffic")]),
            1_700_000_000_000_000_000,
            r#"{"bytesUp":100}"#.to_string(),
        )]);
        let request = batch.to_push_request(&labels([("app", "edge")]));
        let json = serde_json::to_value(&request).expect("serialize");

        assert_eq!(
            json,
            serde_json::json!({
                "streams": [{
                    "stream": {"app": "edge", "type": "traffic"},
                    "values": [["1700000000000000000", "{\"bytesUp\":100}"]]
                }]
            })
        );
    }

    #[test]
    fn test_extra_labels_override_record_labels() {
        let batch = Batch::from_records(&[record("traffic", 1)]);
        let request = batch.to_push_request(&labels([("type", "forced")]));
        assert_eq!(
            request.streams[0].stream.get("type").map(String::as_str),
            Some("forced")
        );
    }

    proptest! {
        #[test]
        fn one_group_per_distinct_label_set(kinds in proptest::collection::vec(0u8..5, 0..64)) {
            let records: Vec<Record> = kinds
                .iter()
                .enumerate()
                .map(|(i, k)| {
                    let kind = format!("k{k}");
                    Record::new(labels([("type", kind.as_str())]), i as i64, String::new())
                })
                .collect();
            let batch = Batch::from_records(&records);

            let mut distinct = kinds.clone();
            distinct.sort_unstable();
            distinct.dedup();
            prop_assert_eq!(batch.groups().len(), distinct.len());
            prop_assert_eq!(batch.len(), records.len());
            let total: usize = batch.groups().iter().map(|(_, v)| v.len()).sum();
            prop_assert_eq!(total, records.len());
        }
    }
}
