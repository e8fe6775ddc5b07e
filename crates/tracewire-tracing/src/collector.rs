//! Task-local trace collector.
//!
//! Provides infrastructure for collecting trace data scoped to async tasks.
//! Consumers create spans and events; the collector aggregates them into a
//! [`Trace`]. Spans form a stack, so concurrent sub-futures polled by the same
//! task must not open spans of their own.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::mem;

use chrono::Utc;

use crate::propagation::{PropagationError, TraceContext, TraceHeader};
use crate::types::{LogLevel, LogRecord, Span, SpanOutcome, Trace};

type Attributes = BTreeMap<String, serde_json::Value>;

tokio::task_local! {
    static CURRENT_COLLECTOR: RefCell<TraceCollector>;
}

/// Errors that can describe themselves to the reporting client.
///
/// The name groups captured events, so every layer that reports the same
/// failure must produce the same name.
pub trait Reportable: fmt::Display {
    /// Error type name (e.g., "ChildEffectError").
    fn error_name(&self) -> Cow<'_, str>;
}

impl Reportable for std::convert::Infallible {
    fn error_name(&self) -> Cow<'_, str> {
        match *self {}
    }
}

/// Operation category and attributes for a new span.
#[derive(Debug, Clone, Default)]
pub struct SpanOptions {
    pub op: Option<String>,
    pub attributes: Attributes,
}

impl SpanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl serde::Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.attributes.insert(key.into(), v);
        }
        self
    }
}

/// The transaction being recorded by the current task.
///
/// Open spans live on a stack; ending one attaches it to the span below, or
/// to the transaction when the stack is empty.
#[derive(Debug)]
pub struct TraceCollector {
    trace: Trace,
    open: Vec<Span>,
}

impl TraceCollector {
    /// Start a new trace with a random ID.
    pub fn new() -> Self {
        Self::from_trace(Trace::new_random())
    }

    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self::from_trace(Trace::new(trace_id))
    }

    /// Continue the trace described by `header`.
    ///
    /// `sampled` applies only when the caller left the decision open.
    pub fn continued(header: &TraceHeader, baggage: Option<String>, sampled: bool) -> Self {
        let mut trace = Trace::new(header.trace_id.clone());
        trace.parent_span_id = Some(header.parent_span_id.clone());
        trace.sampled = header.sampled.unwrap_or(sampled);
        trace.baggage = baggage;
        Self::from_trace(trace)
    }

    fn from_trace(trace: Trace) -> Self {
        Self {
            trace,
            open: Vec::new(),
        }
    }

    /// Open a span. Pair with [`Self::end_span`].
    pub fn start_span(&mut self, name: impl Into<String>, options: SpanOptions) {
        let mut span = Span::new(name);
        span.op = options.op;
        span.attributes = options.attributes;
        self.open.push(span);
    }

    /// Close the innermost open span.
    pub fn end_span(&mut self, outcome: SpanOutcome) {
        if let Some(mut span) = self.open.pop() {
            span.finish(outcome);
            self.attach(span);
        }
    }

    fn attach(&mut self, span: Span) {
        match self.open.last_mut() {
            Some(parent) => parent.children.push(span),
            None => self.trace.spans.push(span),
        }
    }

    pub fn record_event(&mut self, name: impl Into<String>, data: Option<impl serde::Serialize>) {
        if let Some(span) = self.open.last_mut() {
            span.record_event(name, data);
        }
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl serde::Serialize) {
        if let Some(span) = self.open.last_mut() {
            span.set_attribute(key, value);
        }
    }

    /// Attach a log record, linked to the innermost open span.
    pub fn record_log(&mut self, mut record: LogRecord) {
        if record.span_id.is_none() {
            record.span_id = self.active_span_id().map(str::to_string);
        }
        self.trace.logs.push(record);
    }

    /// Close leftover spans as errors and return the finished transaction.
    pub fn finalize(mut self) -> Trace {
        while !self.open.is_empty() {
            self.end_span(SpanOutcome::Error {
                message: "span not explicitly closed".to_string(),
            });
        }
        self.trace.finish();
        self.trace
    }

    pub fn trace_id(&self) -> &str {
        &self.trace.trace_id
    }

    pub fn active_span_id(&self) -> Option<&str> {
        self.open.last().map(|s| s.span_id.as_str())
    }

    /// Propagation context for an outgoing call.
    ///
    /// The parent span is the innermost open span, or the transaction root
    /// when no span is open.
    pub fn trace_context(&self) -> TraceContext {
        let parent = self.active_span_id().unwrap_or(&self.trace.span_id);
        let header = TraceHeader::new(&self.trace.trace_id, parent, Some(self.trace.sampled));
        TraceContext::new(header.to_string(), self.trace.baggage.clone())
    }
}

impl Default for TraceCollector {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_collector<F, T>(collector: TraceCollector, f: F) -> (T, Trace)
where
    F: Future<Output = T>,
{
    CURRENT_COLLECTOR
        .scope(RefCell::new(collector), async {
            let result = f.await;
            let trace = CURRENT_COLLECTOR.with(|tc| mem::take(&mut *tc.borrow_mut()).finalize());
            (result, trace)
        })
        .await
}

/// Run `f` against the current task's collector, if there is one.
fn with_collector<R>(f: impl FnOnce(&mut TraceCollector) -> R) -> Option<R> {
    CURRENT_COLLECTOR
        .try_with(|tc| tc.try_borrow_mut().ok().map(|mut c| f(&mut c)))
        .ok()
        .flatten()
}

/// Run `f` as a new, sampled-per-options trace.
///
/// Returns both the output and the finished transaction.
pub async fn with_tracing<F, T>(f: F) -> (T, Trace)
where
    F: Future<Output = T>,
{
    let mut collector = TraceCollector::new();
    collector.trace.sampled = crate::scope::sample_new_trace();
    run_collector(collector, f).await
}

/// Like [`with_tracing`] with a caller-chosen trace ID.
pub async fn with_tracing_id<F, T>(trace_id: impl Into<String>, f: F) -> (T, Trace)
where
    F: Future<Output = T>,
{
    run_collector(TraceCollector::with_trace_id(trace_id), f).await
}

/// Run `f` as a transaction continuing `context`.
///
/// An empty context starts a new trace. A malformed one is logged and also
/// starts a new trace; propagation never fails the operation.
pub async fn continue_trace<F, T>(context: &TraceContext, f: F) -> (T, Trace)
where
    F: Future<Output = T>,
{
    let collector = match context.header() {
        Ok(header) => {
            let sampled = header.sampled.unwrap_or_else(crate::scope::sample_new_trace);
            TraceCollector::continued(&header, context.baggage.clone(), sampled)
        }
        Err(e) => {
            if !matches!(e, PropagationError::Empty) {
                tracing::warn!(error = %e, "Ignoring invalid trace context, starting a new trace");
            }
            let mut collector = TraceCollector::new();
            collector.trace.sampled = crate::scope::sample_new_trace();
            collector.trace.baggage = context.baggage.clone();
            collector
        }
    };
    run_collector(collector, f).await
}

/// Run `f` inside a span, ending it according to the future's result.
///
/// Failures are captured as error events on the current isolation scope,
/// linked to the failing span.
pub async fn in_span<F, T, E>(name: impl Into<String>, options: SpanOptions, f: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: Reportable,
{
    start_span_with_options(name, options);
    let result = f.await;
    match &result {
        Ok(_) => end_span_ok(),
        Err(e) => {
            crate::scope::capture_error(e);
            end_span_error(e.to_string());
        }
    }
    result
}

pub fn is_tracing_active() -> bool {
    CURRENT_COLLECTOR.try_with(|_| ()).is_ok()
}

// The span helpers below are no-ops outside a trace.

pub fn start_span(name: impl Into<String>) {
    with_collector(|c| c.start_span(name, SpanOptions::default()));
}

pub fn start_span_with_options(name: impl Into<String>, options: SpanOptions) {
    with_collector(|c| c.start_span(name, options));
}

pub fn end_span_ok() {
    with_collector(|c| c.end_span(SpanOutcome::Ok));
}

pub fn end_span_error(message: impl Into<String>) {
    with_collector(|c| {
        c.end_span(SpanOutcome::Error {
            message: message.into(),
        })
    });
}

pub fn record_event(name: impl Into<String>, data: Option<impl serde::Serialize>) {
    with_collector(|c| c.record_event(name, data));
}

pub fn set_attribute(key: impl Into<String>, value: impl serde::Serialize) {
    with_collector(|c| c.set_attribute(key, value));
}

/// Attach a log record to the current trace.
///
/// Returns `false` when no trace is active or the collector is busy (a log
/// emitted from inside a collector call).
pub fn record_log(level: LogLevel, message: impl Into<String>, attributes: Attributes) -> bool {
    with_collector(|c| {
        c.record_log(LogRecord {
            level,
            message: message.into(),
            timestamp: Utc::now(),
            span_id: None,
            attributes,
        })
    })
    .is_some()
}

pub fn current_trace_id() -> Option<String> {
    with_collector(|c| c.trace_id().to_string())
}

/// The innermost open span, if any.
pub fn current_span_id() -> Option<String> {
    with_collector(|c| c.active_span_id().map(str::to_string)).flatten()
}

/// Propagation context of the active trace.
pub fn current_trace_context() -> Option<TraceContext> {
    with_collector(|c| c.trace_context())
}
