//! Background work that must outlive a response.
//!
//! [`BackgroundTasks`] is the "wait until" contract: a registered future is
//! driven to completion independently of the request that registered it.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinSet;
use tracewire_tracing::{
    Reportable, SpanOptions, TraceContext, capture_transaction, continue_trace,
    current_scope, current_trace_context, in_span, with_isolation_scope,
};

/// A unit of background work.
pub type BackgroundTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Registrar for work that runs after (or alongside) the response.
pub trait BackgroundTasks: Send + Sync {
    /// Register `task`; it is guaranteed to be driven to completion.
    fn wait_until(&self, task: BackgroundTask);
}

/// [`BackgroundTasks`] backed by a tokio `JoinSet`.
///
/// Clones share the same set. [`WaitUntil::drain`] waits for everything
/// registered so far, including tasks registered while draining.
#[derive(Debug, Clone, Default)]
pub struct WaitUntil {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl WaitUntil {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks not yet reaped.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Wait for every registered task. Returns how many completed normally.
    pub async fn drain(&self) -> usize {
        let mut completed = 0;
        loop {
            let mut set = std::mem::take(&mut *self.lock());
            if set.is_empty() {
                return completed;
            }
            while let Some(result) = set.join_next().await {
                match result {
                    Ok(()) => completed += 1,
                    Err(e) => tracing::warn!(error = %e, "Background task failed"),
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BackgroundTasks for WaitUntil {
    fn wait_until(&self, task: BackgroundTask) {
        let mut set = self.lock();
        // Reap finished tasks so a long-lived registrar does not grow unbounded
        while let Some(result) = set.try_join_next() {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Background task failed");
            }
        }
        set.spawn(task);
    }
}

/// Run `work` in the background as its own transaction in the current trace.
///
/// The transaction continues the active span at registration time, so work
/// that outlives the request still nests under it. It reports to a snapshot
/// of the current isolation scope and flushes that scope's client when done.
pub fn spawn_transaction<F, E>(
    tasks: &dyn BackgroundTasks,
    name: impl Into<String>,
    options: SpanOptions,
    work: F,
) where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Reportable + Send + 'static,
{
    let name = name.into();
    let context = current_trace_context().unwrap_or_else(TraceContext::empty);
    let scope = current_scope();

    tasks.wait_until(Box::pin(async move {
        let run = async move {
            let (result, trace) = continue_trace(&context, in_span(name, options, work)).await;
            if let Err(e) = &result {
                tracing::debug!(error = %e, "Background transaction failed");
            }
            trace
        };

        match scope {
            Some(scope) => {
                let client = Arc::clone(scope.client());
                with_isolation_scope(scope, async {
                    let trace = run.await;
                    capture_transaction(trace);
                })
                .await;
                client.flush_default().await;
            }
            None => {
                run.await;
            }
        }
    }));
}
