//! Isolation scopes.
//!
//! An [`IsolationScope`] owns the reporting client and the tags/contexts of
//! one unit of work (an HTTP request, an inbound RPC call). It is installed
//! task-locally with [`with_isolation_scope`], so concurrent units of work
//! never see each other's state.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::client::ReportingClient;
use crate::collector::{self, Reportable};
use crate::types::{ErrorEvent, Trace};

tokio::task_local! {
    static CURRENT_SCOPE: RefCell<IsolationScope>;
}

/// Request-scoped telemetry container.
#[derive(Debug, Clone)]
pub struct IsolationScope {
    client: Arc<ReportingClient>,
    tags: BTreeMap<String, String>,
    contexts: BTreeMap<String, serde_json::Value>,
}

impl IsolationScope {
    pub fn new(client: Arc<ReportingClient>) -> Self {
        Self {
            client,
            tags: BTreeMap::new(),
            contexts: BTreeMap::new(),
        }
    }

    pub fn client(&self) -> &Arc<ReportingClient> {
        &self.client
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn set_context(&mut self, key: impl Into<String>, value: impl serde::Serialize) {
        if let Ok(v) = serde_json::to_value(value) {
            self.contexts.insert(key.into(), v);
        }
    }

    /// Copy scope data onto a finished transaction and hand it to the client.
    pub fn capture_transaction(&self, mut trace: Trace) -> bool {
        for (k, v) in &self.tags {
            trace.tags.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in &self.contexts {
            trace.contexts.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self.client.capture_transaction(trace)
    }

    /// Copy scope tags onto an error event and hand it to the client.
    pub fn capture_event(&self, mut event: ErrorEvent) -> bool {
        for (k, v) in &self.tags {
            event.tags.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self.client.capture_error(event)
    }
}

/// Run `f` with `scope` installed as the current isolation scope.
pub async fn with_isolation_scope<F, T>(scope: IsolationScope, f: F) -> T
where
    F: Future<Output = T>,
{
    CURRENT_SCOPE.scope(RefCell::new(scope), f).await
}

/// Set a tag on the current scope (no-op outside a scope).
pub fn set_tag(key: impl Into<String>, value: impl Into<String>) {
    let _ = CURRENT_SCOPE.try_with(|s| s.borrow_mut().set_tag(key, value));
}

/// Set a context on the current scope (no-op outside a scope).
pub fn set_context(key: impl Into<String>, value: impl serde::Serialize) {
    let _ = CURRENT_SCOPE.try_with(|s| s.borrow_mut().set_context(key, value));
}

/// The current scope's client.
pub fn current_client() -> Option<Arc<ReportingClient>> {
    CURRENT_SCOPE
        .try_with(|s| Arc::clone(s.borrow().client()))
        .ok()
}

/// Snapshot of the current scope, sharing its client.
pub fn current_scope() -> Option<IsolationScope> {
    CURRENT_SCOPE.try_with(|s| s.borrow().clone()).ok()
}

/// Sampling decision for a trace started in the current scope.
pub(crate) fn sample_new_trace() -> bool {
    current_client().is_none_or(|client| client.sample())
}

/// Capture an error on the current scope, linked to the active trace and span.
///
/// Returns whether the event was kept; `false` outside a scope.
pub fn capture_error<E: Reportable + ?Sized>(error: &E) -> bool {
    let mut event = ErrorEvent::new(error.error_name(), error.to_string());
    if let Some(trace_id) = collector::current_trace_id() {
        event = event.with_trace(trace_id, collector::current_span_id());
    }
    CURRENT_SCOPE
        .try_with(|s| s.borrow().capture_event(event))
        .unwrap_or(false)
}

/// Hand a finished transaction to the current scope.
///
/// Returns whether it was kept; `false` outside a scope.
pub fn capture_transaction(trace: Trace) -> bool {
    CURRENT_SCOPE
        .try_with(|s| s.borrow().capture_transaction(trace))
        .unwrap_or(false)
}
