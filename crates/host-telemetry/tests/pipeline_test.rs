// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{feed_server, wait_until, CapturingShipper, FeedScript};
use host_telemetry::config::{BufferConfig, ClashInput, LokiOutput, OutputConfig, RestartConfig};
use host_telemetry::record::{labels, Labels};
use host_telemetry::sink::loki::PUSH_PATH;
use host_telemetry::source::clash::{self, Feed};
use host_telemetry::source::websocket::ReconnectPolicy;
use host_telemetry::source::Source;
use host_telemetry::supervisor::{Supervisor, SupervisorSettings};
use mockito::Server;

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        queue_capacity: 64,
        report_interval: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(2),
        restart: RestartConfig::default(),
    }
}

fn clash_input(host: &str, feeds: Vec<Feed>) -> ClashInput {
    ClashInput {
        host: host.to_string(),
        token: None,
        feeds,
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(30),
        reconnect: ReconnectPolicy::Fixed {
            delay: Duration::from_millis(100),
        },
    }
}

fn one_record_batches() -> BufferConfig {
    BufferConfig {
        capacity: 1,
        flush_timeout: Duration::from_secs(60),
        ..BufferConfig::default()
    }
}

/// `ws://127.0.0.1:port/traffic` to `127.0.0.1:port`
fn host_of(url: &str) -> String {
    url.trim_start_matches("ws://")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn traffic_event_reaches_sink_as_one_group() {
    let server = feed_server(FeedScript::once(r#"{"type":"traffic","bytesUp":100}"#), "/traffic").await;

    let mut supervisor = Supervisor::new(settings());
    let shipper = Arc::new(CapturingShipper::default());
    supervisor.add_sink("capture".to_string(), shipper.clone(), one_record_batches());
    for runner in clash::runners(&clash_input(&host_of(&server.url), vec![Feed::Traffic]), "edge-1")
        .expect("runners")
    {
        supervisor
            .register_source(Source::WebSocket(runner))
            .expect("register");
    }

    let handle = supervisor.start().expect("start");
    wait_until(Duration::from_secs(5), || handle.pushed() == 1).await;

    let batches = shipper.batches();
    assert_eq!(batches.len(), 1);
    let groups = batches[0].groups();
    assert_eq!(groups.len(), 1);
    let (group_labels, values): &(Labels, Vec<(i64, String)>) = &groups[0];
    assert_eq!(
        group_labels,
        &labels([("type", "traffic"), ("reportNode", "edge-1")])
    );
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].1, r#"{"bytesUp":100}"#);
    assert_eq!(handle.dispatched(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn loki_sink_pushes_gzipped_batches_with_basic_auth() {
    let feed = feed_server(FeedScript::once(r#"{"up":1,"down":2}"#), "/traffic").await;
    let mut loki = Server::new_async().await;
    let mock = loki
        .mock("POST", PUSH_PATH)
        // "1234:secret"
        .match_header("authorization", "Basic MTIzNDpzZWNyZXQ=")
        .match_header("content-encoding", "gzip")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let mut supervisor = Supervisor::new(settings());
    supervisor
        .add_output(&OutputConfig::Loki(LokiOutput {
            host: loki.url(),
            user_id: "1234".to_string(),
            api_key: "secret".to_string(),
            verify: true,
            labels: labels([("app", "edge")]),
            push_timeout: Duration::from_secs(2),
            compression_level: 6,
            buffer: one_record_batches(),
        }))
        .expect("loki output");
    for runner in clash::runners(&clash_input(&host_of(&feed.url), vec![Feed::Traffic]), "edge-1")
        .expect("runners")
    {
        supervisor
            .register_source(Source::WebSocket(runner))
            .expect("register");
    }

    let handle = supervisor.start().expect("start");
    wait_until(Duration::from_secs(5), || handle.pushed() == 1).await;
    mock.assert_async().await;
    assert_eq!(handle.sinks()[0].stats().failed_flushes(), 0);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn failing_loki_keeps_records_until_it_recovers() {
    let feed = feed_server(FeedScript::once(r#"{"up":1}"#), "/traffic").await;
    let mut loki = Server::new_async().await;
    let failing = loki
        .mock("POST", PUSH_PATH)
        .with_status(500)
        .expect_at_least(1)
        .create_async()
        .await;

    let mut supervisor = Supervisor::new(settings());
    supervisor
        .add_output(&OutputConfig::Loki(LokiOutput {
            host: loki.url(),
            user_id: "1".to_string(),
            api_key: "k".to_string(),
            verify: true,
            labels: Labels::new(),
            push_timeout: Duration::from_secs(2),
            compression_level: 1,
            buffer: BufferConfig {
                capacity: 1,
                flush_timeout: Duration::from_millis(200),
                ..BufferConfig::default()
            },
        }))
        .expect("loki output");
    for runner in clash::runners(&clash_input(&host_of(&feed.url), vec![Feed::Traffic]), "edge-1")
        .expect("runners")
    {
        supervisor
            .register_source(Source::WebSocket(runner))
            .expect("register");
    }

    let handle = supervisor.start().expect("start");
    wait_until(Duration::from_secs(5), || handle.sinks()[0].stats().failed_flushes() >= 2).await;
    assert_eq!(handle.pushed(), 0);
    failing.assert_async().await;
    failing.remove_async().await;

    let accepting = loki
        .mock("POST", PUSH_PATH)
        .with_status(204)
        .expect(1)
        .create_async()
        .await;
    wait_until(Duration::from_secs(5), || handle.pushed() == 1).await;
    accepting.assert_async().await;

    supervisor.shutdown().await;
}
