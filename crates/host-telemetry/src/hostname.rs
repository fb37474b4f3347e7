// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Name of this node, reported as `reportNode` and `source` labels.

use std::env;
use tracing::warn;

pub const HOSTNAME_ENV: &str = "HOST_TELEMETRY_HOSTNAME";

/// Resolves the local host name.
///
/// Order: explicit override, `HOST_TELEMETRY_HOSTNAME`, `HOSTNAME`, the
/// `gethostname` syscall, then `"unknown"`.
#[must_use]
pub fn resolve_hostname(config_override: Option<&str>) -> String {
    if let Some(name) = config_override.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }

    for var in [HOSTNAME_ENV, "HOSTNAME"] {
        if let Ok(hostname) = env::var(var) {
            if !hostname.trim().is_empty() {
                return hostname.trim().to_string();
            }
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname) => {
            if let Some(hostname) = hostname.to_str().filter(|h| !h.is_empty()) {
                return hostname.to_string();
            }
        }
        Err(e) => {
            warn!("Failed to get system hostname: {}", e);
        }
    }

    warn!("Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}
