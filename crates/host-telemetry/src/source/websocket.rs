// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reconnecting websocket feed runner.
//!
//! ```text
//!   Connecting ──ok──> Streaming ──error/close──> Disconnected ──> Backoff ──┐
//!       │                                                                    │
//!       └──transient error──> Disconnected ──> Backoff ──> Connecting <──────┘
//!       └──upgrade rejected──> Failed (runner exits)
//! ```
//!
//! Every message is decoded as a JSON object, passed through the feed's
//! transform and sent to the fan-in queue. Malformed messages are logged and
//! skipped without dropping the connection.

use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{self, protocol::WebSocketConfig, Message as WsMessage},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{TaskExit, TaskId};
use crate::config::deserialize_duration;
use crate::queue::RecordSender;
use crate::record::{now_ns, Record};

const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
const MAX_LOGGED_PAYLOAD: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Streaming,
    Disconnected,
    Failed,
    Backoff,
}

/// Delay between a lost connection and the next attempt.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Constant delay after every failure.
    Fixed {
        #[serde(default = "default_fixed_delay", deserialize_with = "deserialize_duration")]
        delay: Duration,
    },
    /// `initial * factor^(n-1)` after the n-th consecutive failure, capped at
    /// `max`. The count resets once a connection reaches `Streaming`.
    Exponential {
        #[serde(default = "default_initial_delay", deserialize_with = "deserialize_duration")]
        initial: Duration,
        #[serde(default = "default_max_delay", deserialize_with = "deserialize_duration")]
        max: Duration,
        #[serde(default = "default_factor")]
        factor: f64,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Exponential {
            initial: default_initial_delay(),
            max: default_max_delay(),
            factor: default_factor(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retrying after `failures` consecutive failures (>= 1).
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        match self {
            ReconnectPolicy::Fixed { delay } => *delay,
            ReconnectPolicy::Exponential {
                initial,
                max,
                factor,
            } => {
                let exponent = failures.saturating_sub(1).min(64) as i32;
                let secs = initial.as_secs_f64() * factor.max(1.0).powi(exponent);
                Duration::try_from_secs_f64(secs.min(max.as_secs_f64())).unwrap_or(*max)
            }
        }
    }
}

fn default_fixed_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_factor() -> f64 {
    2.0
}

#[derive(Debug, Error)]
pub enum FeedFailure {
    /// Reset, timeout, close, DNS: retried after the backoff delay.
    #[error("{0}")]
    Transient(String),
    /// Upgrade or auth rejected: the runner stops.
    #[error("{0}")]
    Fatal(String),
    /// The fan-in queue is gone, the pipeline is shutting down.
    #[error("record queue closed")]
    QueueClosed,
}

/// Classifies an error raised while establishing the connection.
fn classify_connect_error(err: tungstenite::Error) -> FeedFailure {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            let body = response
                .body()
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            FeedFailure::Fatal(format!("upgrade rejected with status {status}: {}", truncate(&body)))
        }
        tungstenite::Error::Url(e) => FeedFailure::Fatal(format!("invalid feed url: {e}")),
        other => FeedFailure::Transient(other.to_string()),
    }
}

type Transform = Arc<dyn Fn(&mut Map<String, Value>) + Send + Sync>;

/// Follows one websocket endpoint forever.
pub struct StreamRunner {
    id: TaskId,
    url: String,
    default_type: String,
    transform: Transform,
    connect_timeout: Duration,
    read_timeout: Duration,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    received: AtomicU64,
}

impl fmt::Debug for StreamRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRunner")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl StreamRunner {
    #[must_use]
    pub fn new(
        id: TaskId,
        url: String,
        default_type: impl Into<String>,
        transform: impl Fn(&mut Map<String, Value>) + Send + Sync + 'static,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        StreamRunner {
            id,
            url,
            default_type: default_type.into(),
            transform: Arc::new(transform),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5 * 60),
            policy: ReconnectPolicy::default(),
            state,
            received: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Watches the connection state.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Messages turned into records since the runner was created.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Connects, streams and reconnects until cancelled or a fatal failure.
    pub async fn produce(&self, tx: RecordSender, cancel: CancellationToken) -> TaskExit {
        let mut failures: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            let started = Instant::now();
            let mut streamed = false;

            let failure = tokio::select! {
                () = cancel.cancelled() => return TaskExit::Cancelled,
                result = self.session(&tx, &mut streamed) => match result {
                    Err(failure) => failure,
                    Ok(never) => match never {},
                },
            };

            let lasted = started.elapsed().as_secs_f64();
            match failure {
                FeedFailure::Fatal(reason) => {
                    self.set_state(ConnectionState::Failed);
                    error!("WS | {} failed permanently: {}", self.id, reason);
                    return TaskExit::Fatal(reason);
                }
                FeedFailure::QueueClosed => {
                    self.set_state(ConnectionState::Disconnected);
                    debug!("WS | {} stopping, record queue closed", self.id);
                    return TaskExit::Cancelled;
                }
                FeedFailure::Transient(reason) => {
                    self.set_state(ConnectionState::Disconnected);
                    warn!(
                        "WS | {} disconnected, this connection lasted {:.2} seconds: {}",
                        self.id, lasted, reason
                    );
                }
            }

            failures = if streamed { 1 } else { failures.saturating_add(1) };
            let delay = self.policy.delay(failures);
            self.set_state(ConnectionState::Backoff);
            debug!("WS | {} reconnecting in {:?}", self.id, delay);
            tokio::select! {
                () = cancel.cancelled() => return TaskExit::Cancelled,
                () = sleep(delay) => {}
            }
        }
    }

    async fn session(
        &self,
        tx: &RecordSender,
        streamed: &mut bool,
    ) -> Result<Infallible, FeedFailure> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_MESSAGE_SIZE);
        config.max_frame_size = Some(MAX_MESSAGE_SIZE);

        let (mut stream, _) = timeout(
            self.connect_timeout,
            connect_async_with_config(self.url.as_str(), Some(config), false),
        )
        .await
        .map_err(|_| {
            FeedFailure::Transient(format!("connect timed out after {:?}", self.connect_timeout))
        })?
        .map_err(classify_connect_error)?;

        *streamed = true;
        self.set_state(ConnectionState::Streaming);
        info!("WS | {} connected", self.id);

        loop {
            let frame = timeout(self.read_timeout, stream.next()).await.map_err(|_| {
                FeedFailure::Transient(format!(
                    "no message received for {:?}",
                    self.read_timeout
                ))
            })?;
            match frame {
                Some(Ok(WsMessage::Text(text))) => self.handle_text(text.as_str(), tx).await?,
                Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.handle_text(text, tx).await?,
                    Err(_) => warn!("WS | {} skipping non UTF-8 binary message", self.id),
                },
                Some(Ok(WsMessage::Ping(payload))) => {
                    stream
                        .send(WsMessage::Pong(payload))
                        .await
                        .map_err(|e| FeedFailure::Transient(e.to_string()))?;
                }
                Some(Ok(WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame.map_or_else(
                        || "closed by server".to_string(),
                        |f| format!("closed by server: {} {}", f.code, f.reason),
                    );
                    return Err(FeedFailure::Transient(reason));
                }
                Some(Err(e)) => return Err(FeedFailure::Transient(e.to_string())),
                None => return Err(FeedFailure::Transient("stream ended".to_string())),
            }
        }
    }

    async fn handle_text(&self, text: &str, tx: &RecordSender) -> Result<(), FeedFailure> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(mut event)) => {
                (self.transform)(&mut event);
                let record = Record::from_event(event, &self.default_type, now_ns());
                tx.send(record)
                    .await
                    .map_err(|_| FeedFailure::QueueClosed)?;
                self.received.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => warn!(
                "WS | {} skipping message that is not a JSON object: {}",
                self.id,
                truncate(text)
            ),
            Err(e) => warn!(
                "WS | {} skipping malformed message ({}): {}",
                self.id,
                e,
                truncate(text)
            ),
        }
        Ok(())
    }
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(MAX_LOGGED_PAYLOAD) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
