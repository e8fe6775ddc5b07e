//! Reporting client: buffers finished telemetry and ships it on flush.
//!
//! The client never sends on the capture path. Transactions and error events
//! accumulate in memory until [`ReportingClient::flush`] hands them to the
//! [`Transport`], bounded by a timeout.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ErrorEvent, Span, Trace};
use crate::writer::{TraceWriter, WriteError, WriterConfig};

/// Upper bound for a flush when the caller has no preference.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_millis(2000);

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    #[error("Transport task failed: {0}")]
    Task(String),
}

/// A unit of telemetry handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Transaction(Trace),
    Error(ErrorEvent),
}

/// Destination for flushed telemetry.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, envelopes: Vec<Envelope>) -> Result<(), TransportError>;
}

/// Shared transport handle.
pub type SharedTransport = Arc<dyn Transport>;

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopTransport;

#[async_trait]
impl Transport for NoopTransport {
    async fn send(&self, _envelopes: Vec<Envelope>) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Keeps every envelope in memory for later inspection.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<Envelope>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All envelopes sent so far.
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sent transactions, in send order.
    pub fn transactions(&self) -> Vec<Trace> {
        self.envelopes()
            .into_iter()
            .filter_map(|e| match e {
                Envelope::Transaction(t) => Some(t),
                Envelope::Error(_) => None,
            })
            .collect()
    }

    /// Sent error events, in send order.
    pub fn errors(&self) -> Vec<ErrorEvent> {
        self.envelopes()
            .into_iter()
            .filter_map(|e| match e {
                Envelope::Error(ev) => Some(ev),
                Envelope::Transaction(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, envelopes: Vec<Envelope>) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(envelopes);
        Ok(())
    }
}

/// Appends envelopes as JSON lines through a [`TraceWriter`].
#[derive(Debug)]
pub struct JsonlTransport {
    writer: Arc<TraceWriter>,
}

impl JsonlTransport {
    pub fn new(config: WriterConfig) -> Result<Self, TransportError> {
        Ok(Self {
            writer: Arc::new(TraceWriter::new(config)?),
        })
    }

    /// Path of the file the next envelope will be appended to.
    pub fn current_file_path(&self) -> PathBuf {
        self.writer.current_file_path()
    }
}

#[async_trait]
impl Transport for JsonlTransport {
    async fn send(&self, envelopes: Vec<Envelope>) -> Result<(), TransportError> {
        let writer = Arc::clone(&self.writer);
        let written = tokio::task::spawn_blocking(move || writer.append_all(&envelopes))
            .await
            .map_err(|e| TransportError::Task(e.to_string()))??;
        tracing::trace!(written, "Appended telemetry");
        Ok(())
    }
}

/// Options shared by every client built for a process.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub environment: Option<String>,
    pub release: Option<String>,
    /// Fraction of new traces to sample, `0.0..=1.0`.
    pub traces_sample_rate: f64,
    /// Log a summary of every captured transaction.
    pub debug: bool,
    /// Ship log records attached to transactions.
    pub enable_logs: bool,
    /// Transactions whose name contains any of these are dropped.
    pub ignore_transactions: Vec<String>,
    pub flush_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            environment: None,
            release: None,
            traces_sample_rate: 1.0,
            debug: false,
            enable_logs: true,
            ignore_transactions: vec!["/favicon.ico".to_string()],
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

impl ClientOptions {
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_release(mut self, release: impl Into<String>) -> Self {
        self.release = Some(release.into());
        self
    }

    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.traces_sample_rate = rate;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Whether a transaction with this name is ignored.
    pub fn is_ignored(&self, transaction: &str) -> bool {
        self.ignore_transactions
            .iter()
            .any(|pattern| transaction.contains(pattern.as_str()))
    }
}

/// Buffers telemetry for one isolation scope and ships it on flush.
#[derive(Debug)]
pub struct ReportingClient {
    options: ClientOptions,
    transport: SharedTransport,
    buffer: Mutex<Vec<Envelope>>,
}

impl ReportingClient {
    pub fn new(options: ClientOptions, transport: SharedTransport) -> Self {
        Self {
            options,
            transport,
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Roll the sampling decision for a new trace.
    pub fn sample(&self) -> bool {
        let rate = self.options.traces_sample_rate;
        if rate >= 1.0 {
            true
        } else if rate <= 0.0 {
            false
        } else {
            rand::random::<f64>() < rate
        }
    }

    /// Buffer a finished transaction. Returns whether it was kept.
    pub fn capture_transaction(&self, mut trace: Trace) -> bool {
        if !trace.sampled {
            tracing::debug!(trace_id = %trace.trace_id, "Dropping unsampled transaction");
            return false;
        }
        if let Some(name) = trace.name.as_deref() {
            if self.options.is_ignored(name) {
                tracing::debug!(transaction = %name, "Dropping ignored transaction");
                return false;
            }
        }

        if trace.environment.is_none() {
            trace.environment = self.options.environment.clone();
        }
        if trace.release.is_none() {
            trace.release = self.options.release.clone();
        }
        if !self.options.enable_logs {
            trace.logs.clear();
        }
        if self.options.debug {
            log_transaction_summary(&trace);
        }

        self.lock_buffer().push(Envelope::Transaction(trace));
        true
    }

    /// Buffer an error event. Returns whether it was kept.
    ///
    /// An event with the same name and message as one already buffered for
    /// the same trace is dropped, so a failure reported by several layers is
    /// only sent once.
    pub fn capture_error(&self, mut event: ErrorEvent) -> bool {
        let mut buffer = self.lock_buffer();
        let duplicate = buffer.iter().any(|e| match e {
            Envelope::Error(existing) => {
                existing.name == event.name
                    && existing.message == event.message
                    && existing.trace_id == event.trace_id
            }
            Envelope::Transaction(_) => false,
        });
        if duplicate {
            tracing::debug!(name = %event.name, "Dropping duplicate error event");
            return false;
        }

        if event.environment.is_none() {
            event.environment = self.options.environment.clone();
        }
        if event.release.is_none() {
            event.release = self.options.release.clone();
        }
        buffer.push(Envelope::Error(event));
        true
    }

    /// Number of buffered envelopes.
    pub fn pending(&self) -> usize {
        self.lock_buffer().len()
    }

    /// Send everything buffered so far, giving up after `timeout`.
    ///
    /// Returns `true` when the buffer was empty or fully delivered.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let batch = std::mem::take(&mut *self.lock_buffer());
        if batch.is_empty() {
            return true;
        }

        let count = batch.len();
        match tokio::time::timeout(timeout, self.transport.send(batch)).await {
            Ok(Ok(())) => {
                tracing::debug!(count, "Flushed telemetry");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, count, "Failed to flush telemetry");
                false
            }
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, count, "Telemetry flush timed out");
                false
            }
        }
    }

    /// Flush with the configured timeout.
    pub async fn flush_default(&self) -> bool {
        self.flush(self.options.flush_timeout).await
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, Vec<Envelope>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_transaction_summary(trace: &Trace) {
    fn walk(span: &Span, parent: &str, out: &mut Vec<String>) {
        out.push(format!(
            "{} ({}) (id: {}, parent: {}, {}ms)",
            span.name,
            span.op.as_deref().unwrap_or("-"),
            span.span_id,
            parent,
            span.duration_ms().unwrap_or_default()
        ));
        for child in &span.children {
            walk(child, &span.span_id, out);
        }
    }

    let mut lines = Vec::new();
    for span in &trace.spans {
        walk(span, &trace.span_id, &mut lines);
    }

    tracing::debug!(
        trace_id = %trace.trace_id,
        transaction = trace.name.as_deref().unwrap_or("<unnamed>"),
        parent_span_id = trace.parent_span_id.as_deref().unwrap_or("-"),
        span_id = %trace.span_id,
        spans = lines.len(),
        "Capturing transaction:\n  {}",
        lines.join("\n  ")
    );
}
