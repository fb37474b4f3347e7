// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ships the agent's own log events alongside the collected telemetry.
//!
//! [`ForwardLayer`] is installed with the subscriber before the pipeline
//! exists. Events are dropped until [`ForwardHandle::attach`] hands it the
//! fan-in queue. Sink events are never forwarded so a failing sink cannot
//! feed itself.

use std::fmt::{self, Write as _};
use std::sync::{Arc, OnceLock};

use serde_json::json;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::queue::RecordSender;
use crate::record::{labels, now_ns, Record};
use crate::APP_NAME;

const EXCLUDED_TARGET: &str = "host_telemetry::sink";

pub struct ForwardLayer {
    min_level: Level,
    report_node: String,
    sender: Arc<OnceLock<RecordSender>>,
}

/// Connects a [`ForwardLayer`] to the pipeline once it is built.
#[derive(Clone)]
pub struct ForwardHandle {
    sender: Arc<OnceLock<RecordSender>>,
}

impl ForwardHandle {
    /// Starts forwarding into `sender`. Only the first call has an effect.
    pub fn attach(&self, sender: RecordSender) {
        let _ = self.sender.set(sender);
    }
}

impl ForwardLayer {
    /// Forwards events at `min_level` or more severe.
    #[must_use]
    pub fn new(min_level: Level, report_node: &str) -> (Self, ForwardHandle) {
        let sender = Arc::new(OnceLock::new());
        let layer = ForwardLayer {
            min_level,
            report_node: report_node.to_string(),
            sender: Arc::clone(&sender),
        };
        (layer, ForwardHandle { sender })
    }

    fn to_record(&self, event: &Event<'_>) -> Record {
        let meta = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let level = meta.level().as_str().to_lowercase();
        let line = json!({
            "message": visitor.finish(),
            "target": meta.target(),
            "file": meta.file(),
            "line": meta.line(),
        });
        Record::new(
            labels([
                ("app", APP_NAME),
                ("name", meta.target()),
                ("reportNode", self.report_node.as_str()),
                ("type", "agentlog"),
                ("level", level.as_str()),
            ]),
            now_ns(),
            line.to_string(),
        )
    }
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        // more verbose levels compare greater
        if *meta.level() > self.min_level || meta.target().starts_with(EXCLUDED_TARGET) {
            return;
        }
        let Some(sender) = self.sender.get() else {
            return;
        };
        // never block the logging call site; a full queue drops the event
        let _ = sender.try_send(self.to_record(event));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
