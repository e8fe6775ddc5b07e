//! Log shipping.
//!
//! [`ReportingLayer`] is a `tracing_subscriber` layer that copies events at or
//! above a minimum level onto the active trace as [`LogRecord`]s, next to the
//! usual terminal output of the `fmt` layer.
//!
//! [`LogRecord`]: crate::types::LogRecord

use std::collections::BTreeMap;
use std::fmt;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::collector;
use crate::types::LogLevel;

/// Attribute naming where a shipped record came from.
pub const ORIGIN_ATTRIBUTE: &str = "telemetry.origin";
const LOG_ORIGIN: &str = "tracing.logging";

/// Ships `tracing` events into the active trace.
#[derive(Debug, Clone)]
pub struct ReportingLayer {
    min_level: Level,
}

impl ReportingLayer {
    /// Ship events at `min_level` or more severe.
    pub fn new(min_level: Level) -> Self {
        Self { min_level }
    }
}

impl Default for ReportingLayer {
    fn default() -> Self {
        Self::new(Level::WARN)
    }
}

impl<S: Subscriber> Layer<S> for ReportingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        // tracing orders levels by verbosity: ERROR < WARN < ... < TRACE
        if level > self.min_level || !collector::is_tracing_active() {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        visitor.attributes.insert(
            ORIGIN_ATTRIBUTE.to_string(),
            serde_json::Value::String(LOG_ORIGIN.to_string()),
        );
        visitor.attributes.insert(
            "target".to_string(),
            serde_json::Value::String(event.metadata().target().to_string()),
        );

        collector::record_log(LogLevel::from(&level), visitor.message, visitor.attributes);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    attributes: BTreeMap<String, serde_json::Value>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: serde_json::Value) {
        if field.name() == "message" {
            self.message = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
        } else {
            self.attributes.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, serde_json::Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, serde_json::Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, serde_json::Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, serde_json::Value::String(format!("{:?}", value)));
    }
}
