// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{feed_server, wait_until, FeedScript};
use host_telemetry::queue::{channel, QueueGauges};
use host_telemetry::source::websocket::{ConnectionState, ReconnectPolicy, StreamRunner};
use host_telemetry::source::{TaskExit, TaskId};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn runner(name: &str, url: String, delay: Duration) -> Arc<StreamRunner> {
    Arc::new(
        StreamRunner::new(
            TaskId::new("clash", name),
            url,
            "traffic",
            |_: &mut Map<String, Value>| {},
        )
        .with_timeouts(Duration::from_secs(2), Duration::from_secs(30))
        .with_policy(ReconnectPolicy::Fixed { delay }),
    )
}

#[tokio::test]
async fn flaky_feed_recovers_without_stalling_healthy_feed() {
    let flaky = feed_server(
        FeedScript {
            drop_first: 3,
            messages: vec![r#"{"feed":"flaky"}"#.to_string()],
            repeat_every: Some(Duration::from_millis(20)),
            reject_with: None,
        },
        "/traffic",
    )
    .await;
    let healthy = feed_server(
        FeedScript {
            drop_first: 0,
            messages: vec![r#"{"feed":"healthy"}"#.to_string()],
            repeat_every: Some(Duration::from_millis(20)),
            reject_with: None,
        },
        "/logs",
    )
    .await;

    let gauges = QueueGauges::new();
    let (tx, mut rx) = channel("fan_in", 1024, &gauges);
    // keep the queue drained so neither runner is held up by backpressure
    tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let delay = Duration::from_millis(100);
    let flaky_runner = runner("flaky:traffic", flaky.url.clone(), delay);
    let healthy_runner = runner("healthy:logs", healthy.url.clone(), delay);
    let mut flaky_state = flaky_runner.subscribe_state();
    let cancel = CancellationToken::new();

    let started = Instant::now();
    for runner in [&flaky_runner, &healthy_runner] {
        let runner = Arc::clone(runner);
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.produce(tx, cancel).await });
    }

    // the healthy feed streams while the flaky one is still failing
    wait_until(Duration::from_secs(5), || healthy_runner.received() >= 5).await;

    flaky_state
        .wait_for(|state| *state == ConnectionState::Streaming)
        .await
        .expect("flaky feed reaches streaming");
    let elapsed = started.elapsed();
    assert!(elapsed >= 3 * delay, "three fixed delays before the fourth attempt");
    assert!(
        elapsed < 3 * delay + Duration::from_secs(1),
        "reconnected after {elapsed:?}, expected about {:?}",
        3 * delay
    );
    assert_eq!(flaky.connections(), 4);

    wait_until(Duration::from_secs(5), || flaky_runner.received() >= 3).await;
    let before = healthy_runner.received();
    wait_until(Duration::from_secs(5), || healthy_runner.received() > before).await;

    cancel.cancel();
}

#[tokio::test]
async fn rejected_upgrade_stops_the_runner() {
    let server = feed_server(
        FeedScript {
            drop_first: 0,
            messages: Vec::new(),
            repeat_every: None,
            reject_with: Some(401),
        },
        "/traffic",
    )
    .await;
    let (tx, _rx) = channel("fan_in", 8, &QueueGauges::new());
    let runner = runner("rejected:traffic", server.url.clone(), Duration::from_millis(50));

    let exit = tokio::time::timeout(
        Duration::from_secs(5),
        runner.produce(tx, CancellationToken::new()),
    )
    .await
    .expect("runner stops by itself");

    assert!(matches!(exit, TaskExit::Fatal(ref reason) if reason.contains("401")));
    assert_eq!(*runner.subscribe_state().borrow(), ConnectionState::Failed);
    assert_eq!(server.connections(), 1, "no reconnect after a fatal failure");
}

#[tokio::test]
async fn unreachable_feed_keeps_retrying_until_cancelled() {
    // bind then drop to get a port nobody listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let (tx, _rx) = channel("fan_in", 8, &QueueGauges::new());
    let runner = runner(
        "down:traffic",
        format!("ws://127.0.0.1:{port}/traffic"),
        Duration::from_millis(20),
    );
    let mut state = runner.subscribe_state();
    let cancel = CancellationToken::new();
    let task = {
        let runner = Arc::clone(&runner);
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.produce(tx, cancel).await })
    };

    state
        .wait_for(|s| *s == ConnectionState::Backoff)
        .await
        .expect("enters backoff");
    cancel.cancel();
    let exit = task.await.expect("join");
    assert_eq!(exit, TaskExit::Cancelled);
}
