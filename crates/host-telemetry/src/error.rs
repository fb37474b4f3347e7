// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crate-level error aggregating the per-module error types.

use thiserror::Error;

use crate::config::ConfigError;
use crate::sink::ShipError;
use crate::source::tailscale::PollError;
use crate::supervisor::SupervisorError;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("shipping error: {0}")]
    Ship(#[from] ShipError),

    #[error("poll error: {0}")]
    Poll(#[from] PollError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
