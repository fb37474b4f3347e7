// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers for integration tests: a scriptable websocket feed server and a
//! shipper that records every batch it is given.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use host_telemetry::batch::Batch;
use host_telemetry::sink::{ShipError, Shipper};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{http, Message};
use tokio_tungstenite::{accept_async, accept_hdr_async};

/// How the feed server treats each accepted connection.
#[derive(Clone)]
pub struct FeedScript {
    /// Connections closed before the websocket handshake.
    pub drop_first: usize,
    /// Messages sent right after the handshake.
    pub messages: Vec<String>,
    /// Resend `messages` at this period until the client goes away.
    pub repeat_every: Option<Duration>,
    /// Reject the upgrade with this HTTP status.
    pub reject_with: Option<u16>,
}

impl FeedScript {
    pub fn once(message: &str) -> Self {
        FeedScript {
            drop_first: 0,
            messages: vec![message.to_string()],
            repeat_every: None,
            reject_with: None,
        }
    }
}

pub struct FeedServer {
    pub url: String,
    pub connections: Arc<AtomicUsize>,
}

impl FeedServer {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Starts a websocket server on a random local port. `path` is appended to
/// the returned URL; the server accepts any path.
pub async fn feed_server(script: FeedScript, path: &str) -> FeedServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= script.drop_first {
                drop(socket);
                continue;
            }
            let script = script.clone();
            tokio::spawn(async move {
                if let Some(status) = script.reject_with {
                    let _ = accept_hdr_async(socket, move |_: &Request, _: Response| {
                        let rejection: ErrorResponse = http::Response::builder()
                            .status(status)
                            .body(Some("rejected".to_string()))
                            .expect("rejection response");
                        Err(rejection)
                    })
                    .await;
                    return;
                }
                let Ok(mut ws) = accept_async(socket).await else {
                    return;
                };
                loop {
                    for message in &script.messages {
                        if ws.send(Message::Text(message.clone())).await.is_err() {
                            return;
                        }
                    }
                    match script.repeat_every {
                        Some(period) => sleep(period).await,
                        None => break,
                    }
                }
                sleep(Duration::from_secs(60)).await;
            });
        }
    });

    FeedServer {
        url: format!("ws://{addr}{path}"),
        connections,
    }
}

/// Accepts every batch and keeps a copy.
#[derive(Default)]
pub struct CapturingShipper {
    pub batches: Mutex<Vec<Batch>>,
}

impl CapturingShipper {
    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Shipper for CapturingShipper {
    fn name(&self) -> &str {
        "capture"
    }

    async fn ship(&self, batch: &Batch) -> Result<(), ShipError> {
        self.batches.lock().expect("lock").push(batch.clone());
        Ok(())
    }
}

/// Polls `condition` every 10ms, panicking after `limit`.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    timeout(limit, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
