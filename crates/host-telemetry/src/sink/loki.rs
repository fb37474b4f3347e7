// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loki push client.
//!
//! ```text
//!   Batch ──> PushRequest (JSON) ──> gzip ──> POST /loki/api/v1/push ──> 204?
//! ```
//!
//! Requests carry HTTP basic auth (`user_id`, `api_key`). Only `204 No
//! Content` counts as accepted; anything else is returned as a
//! [`ShipError::Status`] so the sink requeues the batch.

use std::io::Write;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flate2::{write::GzEncoder, Compression};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::{debug, error};

use super::{ShipError, Shipper};
use crate::batch::Batch;
use crate::config::LokiOutput;
use crate::record::Labels;

pub const PUSH_PATH: &str = "/loki/api/v1/push";

pub struct LokiShipper {
    name: String,
    client: reqwest::Client,
    url: String,
    user_id: String,
    api_key: String,
    labels: Labels,
    compression: Compression,
    timeout: Duration,
}

impl LokiShipper {
    pub fn new(config: &LokiOutput) -> Result<Self, ShipError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(!config.verify)
            .build()
            .map_err(|e| ShipError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(LokiShipper {
            name: format!("loki:{}", config.host),
            client,
            url: format!("{}{PUSH_PATH}", base_url(&config.host)),
            user_id: config.user_id.clone(),
            api_key: config.api_key.clone(),
            labels: config.labels.clone(),
            compression: Compression::new(config.compression_level),
            timeout: config.push_timeout,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Serializes and gzips the push payload for `batch`.
    pub fn encode(&self, batch: &Batch) -> Result<Vec<u8>, ShipError> {
        let json = serde_json::to_vec(&batch.to_push_request(&self.labels))
            .map_err(|e| ShipError::Payload(e.to_string()))?;
        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), self.compression);
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }
}

/// Bare hosts are reached over https, explicit schemes are kept.
fn base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

#[async_trait]
impl Shipper for LokiShipper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ship(&self, batch: &Batch) -> Result<(), ShipError> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = self.encode(batch)?;
        let compressed_len = body.len();
        let start = Instant::now();

        let resp = self
            .client
            .post(&self.url)
            .basic_auth(&self.user_id, Some(&self.api_key))
            .timeout(self.timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ShipError::Transport(format!("push timed out after {:?}", self.timeout))
                } else {
                    ShipError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            debug!(
                "SINK | {} pushed {} records in {} streams ({} bytes gzip) in {} ms",
                self.name,
                batch.len(),
                batch.groups().len(),
                compressed_len,
                start.elapsed().as_millis()
            );
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            error!(
                "SINK | {} rejected credentials for user {}: {}",
                self.name, self.user_id, status
            );
        }
        Err(ShipError::Status { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::record::{labels, Record};
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn config(host: String) -> LokiOutput {
        LokiOutput {
            host,
            user_id: "1234".to_string(),
            api_key: "secret".to_string(),
            verify: true,
            labels: labels([("app", "edge")]),
            push_timeout: Duration::from_secs(2),
            compression_level: 9,
            buffer: BufferConfig::default(),
        }
    }

    fn batch() -> Batch {
        Batch::from_records(&[Record::new(
            labels([("type", "traffic")]),
            1_700_000_000_000_000_000,
            r#"{"bytesUp":100}"#.to_string(),
        )])
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("logs.example.com"), "https://logs.example.com");
        assert_eq!(base_url("http://127.0.0.1:3100/"), "http://127.0.0.1:3100");
    }

    #[test]
    fn test_encode_is_gzipped_json_with_extra_labels() {
        let shipper = LokiShipper::new(&config("logs.example.com".to_string())).expect("shipper");
        let body = shipper.encode(&batch()).expect("encode");

        let mut json = String::new();
        GzDecoder::new(body.as_slice())
            .read_to_string(&mut json)
            .expect("gunzip");
        let value: serde_json::Value = serde_json::from_str(&json).expect("json");
        assert_eq!(value["streams"][0]["stream"]["app"], "edge");
        assert_eq!(value["streams"][0]["stream"]["type"], "traffic");
        assert_eq!(
            value["streams"][0]["values"][0],
            serde_json::json!(["1700000000000000000", "{\"bytesUp\":100}"])
        );
    }

    #[tokio::test]
    async fn test_ship_success_on_204() {
        let mut server = mockito::Server::new_async().await;
        // "1234:secret"
        let mock = server
            .mock("POST", PUSH_PATH)
            .match_header("content-encoding", "gzip")
            .match_header("content-type", "application/json")
            .match_header("authorization", "Basic MTIzNDpzZWNyZXQ=")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let shipper = LokiShipper::new(&config(server.url())).expect("shipper");
        shipper.ship(&batch()).await.expect("ship should succeed");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ship_non_204_is_failure() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", PUSH_PATH)
            .with_status(200)
            .with_body("ok?")
            .expect(1)
            .create_async()
            .await;

        let shipper = LokiShipper::new(&config(server.url())).expect("shipper");
        let err = shipper.ship(&batch()).await.expect_err("200 is not accepted");
        assert!(matches!(err, ShipError::Status { status, .. } if status == StatusCode::OK));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ship_auth_failure_is_flagged() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", PUSH_PATH)
            .with_status(401)
            .with_body("invalid api key")
            .create_async()
            .await;

        let shipper = LokiShipper::new(&config(server.url())).expect("shipper");
        let err = shipper.ship(&batch()).await.expect_err("should fail");
        assert!(err.is_auth());
        assert!(err.to_string().contains("invalid api key"));
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", PUSH_PATH)
            .expect(0)
            .create_async()
            .await;

        let shipper = LokiShipper::new(&config(server.url())).expect("shipper");
        shipper.ship(&Batch::default()).await.expect("noop");
        mock.assert_async().await;
    }
}
