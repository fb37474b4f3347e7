// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host telemetry collection and forwarding.
//!
//! Sources (proxy websocket feeds, a polled mesh network, latency probes) emit
//! labeled [`record::Record`]s into one bounded fan-in queue. A dispatcher copies
//! every record to each configured sink, which batches records by label set and
//! ships them to Loki (or a local file) with at-least-once semantics.
//!
//! ```text
//!   clash feeds ─┐
//!   tailscale ───┼──> fan-in queue ──> dispatcher ──> sink queue ──> SinkService ──> Loki
//!   ping ────────┘                                └─> sink queue ──> SinkService ──> file
//! ```
//!
//! The [`supervisor::Supervisor`] owns every task, restarts dead sources and
//! reports throughput on a fixed interval.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hostname;
pub mod log_forward;
pub mod logger;
pub mod queue;
pub mod record;
pub mod sink;
pub mod source;
pub mod supervisor;

/// Value of the `app` label on forwarded agent logs.
pub const APP_NAME: &str = "host-telemetry";
