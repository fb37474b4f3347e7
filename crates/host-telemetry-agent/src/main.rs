// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use host_telemetry::{
    config::Config,
    error::TelemetryError,
    hostname::resolve_hostname,
    log_forward::{ForwardHandle, ForwardLayer},
    logger::{env_filter, Formatter, LOG_PREFIX},
    supervisor::Supervisor,
};

const DEFAULT_CONFIG_PATH: &str = "/etc/host-telemetry/config.yaml";

#[derive(Debug, Parser)]
#[command(author, version, about = "Host telemetry collector")]
struct Args {
    /// YAML configuration file.
    #[arg(short, long, env = "HOST_TELEMETRY_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            // logging is not set up yet, the level lives in the config
            eprintln!("{LOG_PREFIX} | ERROR | {e}");
            return ExitCode::FAILURE;
        }
    };

    let report_node = resolve_hostname(config.hostname.as_deref());
    let forward = match init_logging(&config, &report_node) {
        Ok(forward) => forward,
        Err(e) => {
            eprintln!("{LOG_PREFIX} | ERROR | {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(&config, forward).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("failed to start: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config, report_node: &str) -> anyhow::Result<Option<ForwardHandle>> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = env_filter(config.log_level, rust_log.as_deref());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .event_format(Formatter);

    let (forward_layer, forward_handle) = if config.self_logs.enabled {
        let (layer, handle) =
            ForwardLayer::new(config.self_logs.level.as_tracing_level(), report_node);
        (Some(layer), Some(handle))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(forward_layer)
        .try_init()
        .context("failed to install the log subscriber")?;
    Ok(forward_handle)
}

async fn run(config: &Config, forward: Option<ForwardHandle>) -> Result<(), TelemetryError> {
    let mut supervisor = Supervisor::from_config(config)?;
    if let Some(forward) = forward {
        forward.attach(supervisor.fan_in());
    }

    let handle = supervisor.start()?;
    info!("host telemetry agent started");

    let reason = handle.wait_for_shutdown().await;
    info!("stopping: {:?}", reason);
    supervisor.shutdown().await;
    Ok(())
}
