//! Minimal reporting SDK for distributed traces.
//!
//! This crate provides the telemetry primitives the rest of the workspace is
//! built on:
//!
//! - **Types**: `Trace` (one transaction), `Span`, `Event`, `LogRecord`, `ErrorEvent`
//! - **Propagation**: `TraceContext` and the `<trace>-<span>[-<sampled>]` header
//! - **Collector**: task-local span collection via `continue_trace()` / `in_span()`
//! - **Scope**: per request `IsolationScope` owning a `ReportingClient`
//! - **Client**: buffered capture, sampling and timed `flush()` to a `Transport`
//! - **Writer**: JSONL persistence with daily rotation
//! - **Layer**: ships `tracing` warnings and errors into the active trace
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tracewire_tracing::{
//!     ClientOptions, IsolationScope, MemoryTransport, ReportingClient, SpanOptions,
//!     TraceContext, capture_transaction, continue_trace, in_span, with_isolation_scope,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = Arc::new(MemoryTransport::new());
//!     let client = Arc::new(ReportingClient::new(ClientOptions::default(), transport));
//!     let scope = IsolationScope::new(Arc::clone(&client));
//!
//!     with_isolation_scope(scope, async {
//!         let (result, trace) = continue_trace(&TraceContext::empty(), async {
//!             in_span("my_operation", SpanOptions::new().op("task"), async {
//!                 Ok::<_, std::convert::Infallible>("done")
//!             })
//!             .await
//!         })
//!         .await;
//!         capture_transaction(trace);
//!         result
//!     })
//!     .await
//!     .unwrap();
//!
//!     client.flush_default().await;
//! }
//! ```

pub mod client;
pub mod collector;
pub mod layer;
pub mod propagation;
pub mod scope;
pub mod types;
pub mod writer;

// Re-export main types
pub use client::{
    ClientOptions, DEFAULT_FLUSH_TIMEOUT, Envelope, JsonlTransport, MemoryTransport,
    NoopTransport, ReportingClient, SharedTransport, Transport, TransportError,
};
pub use collector::{
    Reportable, SpanOptions, TraceCollector, continue_trace, current_span_id,
    current_trace_context, current_trace_id, end_span_error, end_span_ok, in_span,
    is_tracing_active, record_event, record_log, set_attribute, start_span,
    start_span_with_options, with_tracing, with_tracing_id,
};
pub use layer::{ORIGIN_ATTRIBUTE, ReportingLayer};
pub use propagation::{BAGGAGE_HEADER, PropagationError, TRACE_HEADER, TraceContext, TraceHeader};
pub use scope::{
    IsolationScope, capture_error, capture_transaction, current_client, current_scope, set_context,
    set_tag, with_isolation_scope,
};
pub use types::{ErrorEvent, Event, LogLevel, LogRecord, Span, SpanOutcome, Trace};
pub use writer::{TraceWriter, WriteError, WriterConfig};
