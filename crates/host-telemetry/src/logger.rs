// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line formatting for the agent.
//!
//! Every line is prefixed so agent output is easy to pick out of a shared
//! journal:
//!
//! ```text
//! HOST_TELEMETRY | WARN | WS | clash:127.0.0.1:9090:traffic disconnected after 12.30s
//! HOST_TELEMETRY | INFO | watchdog{uptime_s=60}: SUPERVISOR | dispatched=120
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::log_level::LogLevel;

pub const LOG_PREFIX: &str = "HOST_TELEMETRY";

/// Dependency targets that are far too chatty at debug level.
const QUIET_TARGETS: &str = "h2=off,hyper=off,hyper_util=off,rustls=off,tungstenite=off,tokio_tungstenite=off,reqwest=warn";

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "{LOG_PREFIX} | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Builds the filter directive for `level`, silencing dependency noise.
///
/// `override_directive` (from `RUST_LOG` or the env) replaces the level part
/// when it parses.
#[must_use]
pub fn env_filter(level: LogLevel, override_directive: Option<&str>) -> EnvFilter {
    let directive = override_directive
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(level.as_ref());
    EnvFilter::try_new(format!("{QUIET_TARGETS},{directive}"))
        .unwrap_or_else(|_| EnvFilter::new(format!("{QUIET_TARGETS},{level}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_formatter_prefix_level_and_span() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .event_format(Formatter)
            .with_writer(capture.clone())
            .with_max_level(tracing::Level::DEBUG)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("watchdog", uptime_s = 60);
            let _guard = span.enter();
            tracing::warn!(depth = 3, "queue growing");
        });

        let output = String::from_utf8(capture.0.lock().expect("lock").clone()).expect("utf8");
        assert_eq!(
            output,
            "HOST_TELEMETRY | WARN | watchdog{uptime_s=60}: queue growing depth=3\n"
        );
    }

    #[test]
    fn test_env_filter_falls_back_on_bad_directive() {
        let filter = env_filter(LogLevel::Debug, Some("host_telemetry=loud"));
        assert!(filter.to_string().contains("debug"));
        let filter = env_filter(LogLevel::Info, Some("host_telemetry=trace"));
        assert!(filter.to_string().contains("host_telemetry=trace"));
    }
}
