//! Telemetry records.
//!
//! A [`Trace`] is one transaction: the part of a distributed trace recorded by
//! a single process. Several transactions share a `trace_id` when the trace is
//! continued across a boundary; `parent_span_id` links a transaction to the
//! remote span it continues.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

type Attributes = BTreeMap<String, serde_json::Value>;

/// 32 lowercase hex characters.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// 16 lowercase hex characters.
pub fn new_span_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

fn elapsed_ms(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Option<u64> {
    end.map(|end| (end - start).num_milliseconds().max(0) as u64)
}

/// A transaction: one process's share of a distributed trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,

    /// Root span of this transaction; spans without an open parent hang off it.
    pub span_id: String,

    /// Span in the calling process that this transaction continues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    /// Defaults to the first top-level span's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Unsampled transactions are never sent.
    pub sampled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baggage: Option<String>,

    pub start_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub spans: Vec<Span>,

    /// Log records emitted while the transaction was active.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogRecord>,

    /// Copied from the isolation scope at capture time.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: Attributes,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
}

/// A named, timed operation inside a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,

    /// e.g. "durable-object-runEffect"
    pub name: String,

    /// Operation category, e.g. "rpc" or "http.server".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,

    pub start_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Span>,

    /// `None` while the span is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SpanOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SpanOutcome {
    Ok,
    Error { message: String },
}

/// A point-in-time occurrence within a span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Severity of a shipped log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

/// A structured log record attached to a trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,

    /// Span that was open when the record was emitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

/// A captured error, linked to the trace and span it happened in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub event_id: String,

    /// Error type name, e.g. "ChildEffectError". Events group by it.
    pub name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
}

impl Trace {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: new_span_id(),
            parent_span_id: None,
            name: None,
            sampled: true,
            baggage: None,
            start_timestamp: Utc::now(),
            end_timestamp: None,
            spans: Vec::new(),
            logs: Vec::new(),
            tags: BTreeMap::new(),
            contexts: BTreeMap::new(),
            environment: None,
            release: None,
        }
    }

    /// A transaction starting a brand-new trace.
    pub fn new_random() -> Self {
        Self::new(new_trace_id())
    }

    /// Stamp the end time and fall back to the first span's name.
    pub fn finish(&mut self) {
        self.end_timestamp = Some(Utc::now());
        if self.name.is_none() {
            self.name = self.spans.first().map(|s| s.name.clone());
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        elapsed_ms(self.start_timestamp, self.end_timestamp)
    }

    /// Depth-first search for a span by name.
    pub fn find_span(&self, name: &str) -> Option<&Span> {
        self.spans.iter().find_map(|s| s.find(name))
    }

    /// Whether any span ended with an error.
    pub fn has_error(&self) -> bool {
        self.spans.iter().any(Span::has_error)
    }

    /// Number of spans, nested ones included.
    pub fn span_count(&self) -> usize {
        self.spans.iter().map(Span::count).sum()
    }
}

impl Span {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            span_id: new_span_id(),
            name: name.into(),
            op: None,
            attributes: BTreeMap::new(),
            start_timestamp: Utc::now(),
            end_timestamp: None,
            events: Vec::new(),
            children: Vec::new(),
            outcome: None,
        }
    }

    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    /// Values that fail to serialize are dropped.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(v) = serde_json::to_value(value) {
            self.attributes.insert(key.into(), v);
        }
    }

    pub fn finish(&mut self, outcome: SpanOutcome) {
        self.end_timestamp = Some(Utc::now());
        self.outcome = Some(outcome);
    }

    pub fn record_event(&mut self, name: impl Into<String>, data: Option<impl Serialize>) {
        self.events.push(Event {
            name: name.into(),
            timestamp: Utc::now(),
            data: data.and_then(|d| serde_json::to_value(d).ok()),
        });
    }

    pub fn duration_ms(&self) -> Option<u64> {
        elapsed_ms(self.start_timestamp, self.end_timestamp)
    }

    /// Depth-first search for this span or a descendant by name.
    pub fn find(&self, name: &str) -> Option<&Span> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    fn has_error(&self) -> bool {
        matches!(self.outcome, Some(SpanOutcome::Error { .. }))
            || self.children.iter().any(Span::has_error)
    }

    fn count(&self) -> usize {
        1 + self.children.iter().map(Span::count).sum::<usize>()
    }
}

impl ErrorEvent {
    /// An unlinked event with a fresh event ID.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_id: new_trace_id(),
            name: name.into(),
            message: message.into(),
            timestamp: Utc::now(),
            trace_id: None,
            span_id: None,
            tags: BTreeMap::new(),
            environment: None,
            release: None,
        }
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: Option<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = span_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_hex_of_expected_length() {
        let trace = Trace::new_random();
        assert_eq!(trace.trace_id.len(), 32);
        assert_eq!(trace.span_id.len(), 16);
        assert!(trace.span_id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(trace.end_timestamp.is_none());
        assert!(trace.sampled);
    }

    #[test]
    fn test_finish_names_trace_after_first_span() {
        let mut trace = Trace::new("abc");
        let mut outer = Span::new("outer").with_op("rpc");
        let mut inner = Span::new("inner");
        inner.finish(SpanOutcome::Error {
            message: "boom".to_string(),
        });
        outer.children.push(inner);
        outer.finish(SpanOutcome::Ok);
        trace.spans.push(outer);
        trace.finish();

        assert_eq!(trace.name.as_deref(), Some("outer"));
        assert!(trace.has_error());
        assert_eq!(trace.span_count(), 2);
        assert!(trace.duration_ms().is_some());
        assert_eq!(trace.find_span("inner").map(|s| s.name.as_str()), Some("inner"));
    }

    #[test]
    fn test_log_level_from_tracing() {
        assert_eq!(LogLevel::from(&tracing::Level::WARN), LogLevel::Warn);
        assert!(LogLevel::Error > LogLevel::Warn);
    }

    #[test]
    fn test_wire_shape() {
        let mut trace = Trace::new("test-123");
        let mut span = Span::new("operation");
        span.set_attribute("span.level", 2);
        span.record_event("started", None::<()>);
        span.finish(SpanOutcome::Ok);
        trace.spans.push(span);
        trace.finish();

        let json = serde_json::to_value(&trace).unwrap();
        assert_eq!(json["trace_id"], "test-123");
        assert_eq!(json["spans"][0]["outcome"], serde_json::json!({"status": "ok"}));
        assert_eq!(json["spans"][0]["attributes"]["span.level"], 2);
        // Empty collections are omitted
        assert!(json.get("logs").is_none());
        assert!(json.get("parent_span_id").is_none());
    }
}
