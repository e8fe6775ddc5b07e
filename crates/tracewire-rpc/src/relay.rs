//! Trace relay across RPC boundaries.
//!
//! The caller side ([`call_traced`]) attaches the active trace to outgoing
//! arguments. The callee side ([`InboundRelay::continue_traced`]) picks it
//! back up, runs the handler inside an `rpc` span under a fresh isolation
//! scope, and registers a single background flush before returning.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracewire_tracing::{
    ClientOptions, IsolationScope, ORIGIN_ATTRIBUTE, ReportingClient, SharedTransport,
    SpanOptions, TraceContext, capture_transaction, continue_trace, end_span_error, end_span_ok,
    start_span_with_options, with_isolation_scope,
};

use crate::background::BackgroundTasks;
use crate::envelope::Traced;

/// Span op for inbound RPC handlers.
pub const RPC_OP: &str = "rpc";

/// Origin attribute value for inbound RPC spans.
pub const RPC_ORIGIN: &str = "auto.rpc.durable_object";

/// Tag naming the hosting platform on every inbound transaction.
pub const CLOUD_PROVIDER_TAG: &str = "cloud.provider";

/// Value of [`CLOUD_PROVIDER_TAG`] unless overridden.
pub const DEFAULT_CLOUD_PROVIDER: &str = "cloudflare";

/// Invoke `call` with `args` wrapped in the ambient trace context.
///
/// The result is returned as-is. Outside an active trace the envelope simply
/// carries no context.
pub async fn call_traced<A, F, Fut, R>(call: F, args: A) -> R
where
    F: FnOnce(Traced<A>) -> Fut,
    Fut: Future<Output = R>,
{
    call(Traced::capture(args)).await
}

/// Receiving side of the relay.
///
/// Holds only what is shared between calls: client options and transport.
/// Every call gets its own scope and client.
#[derive(Debug, Clone)]
pub struct InboundRelay {
    options: ClientOptions,
    transport: SharedTransport,
    cloud_provider: String,
}

impl InboundRelay {
    /// Relay building each call's client from `options`, sending to `transport`.
    pub fn new(options: ClientOptions, transport: SharedTransport) -> Self {
        Self {
            options,
            transport,
            cloud_provider: DEFAULT_CLOUD_PROVIDER.to_string(),
        }
    }

    /// Override the [`CLOUD_PROVIDER_TAG`] value set on every call.
    pub fn with_cloud_provider(mut self, provider: impl Into<String>) -> Self {
        self.cloud_provider = provider.into();
        self
    }

    /// Options every per-call client is built from.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Transport shared by all per-call clients.
    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    fn new_scope(&self) -> IsolationScope {
        let client = ReportingClient::new(self.options.clone(), Arc::clone(&self.transport));
        let mut scope = IsolationScope::new(Arc::new(client));
        scope.set_tag(CLOUD_PROVIDER_TAG, self.cloud_provider.as_str());
        scope.set_context(
            "cloud_resource",
            serde_json::json!({ CLOUD_PROVIDER_TAG: self.cloud_provider }),
        );
        scope
    }

    /// Run `handler` on the payload of `args`, continuing the caller's trace.
    ///
    /// The handler's result is returned unchanged. Failures mark the span
    /// but are not reported here; reporting belongs to whoever handles the
    /// error upstream. Exactly one flush is registered on `tasks` per call.
    pub async fn continue_traced<A, R, E, H, Fut>(
        &self,
        span_name: &str,
        handler: H,
        tasks: &dyn BackgroundTasks,
        args: Traced<A>,
    ) -> Result<R, E>
    where
        H: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: fmt::Display,
    {
        let (trace, payload) = args.into_parts();
        let context = trace.unwrap_or_else(|| {
            tracing::warn!(span = span_name, "No trace context in RPC arguments");
            TraceContext::empty()
        });

        let scope = self.new_scope();
        let client = Arc::clone(scope.client());

        let result = with_isolation_scope(scope, async {
            let (result, trace) = continue_trace(&context, async {
                start_span_with_options(
                    span_name,
                    SpanOptions::new()
                        .op(RPC_OP)
                        .attribute(ORIGIN_ATTRIBUTE, RPC_ORIGIN),
                );
                let result = handler(payload).await;
                match &result {
                    Ok(_) => end_span_ok(),
                    Err(e) => end_span_error(e.to_string()),
                }
                result
            })
            .await;
            capture_transaction(trace);
            result
        })
        .await;

        let timeout = client.options().flush_timeout;
        tasks.wait_until(Box::pin(async move {
            if !client.flush(timeout).await {
                tracing::debug!("Inbound RPC telemetry not fully delivered");
            }
        }));

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::{BackgroundTask, WaitUntil};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use serde_json::{Map, Value, json};
    use tracewire_tracing::{MemoryTransport, SpanOutcome, TraceHeader, with_tracing};

    /// Registrar that counts registrations and still runs the tasks.
    #[derive(Default)]
    struct CountingTasks {
        registered: AtomicUsize,
        inner: WaitUntil,
    }

    impl CountingTasks {
        fn count(&self) -> usize {
            self.registered.load(Ordering::SeqCst)
        }
    }

    impl BackgroundTasks for CountingTasks {
        fn wait_until(&self, task: BackgroundTask) {
            self.registered.fetch_add(1, Ordering::SeqCst);
            self.inner.wait_until(task);
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct HandlerError(String);

    impl fmt::Display for HandlerError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    fn relay() -> (InboundRelay, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let relay = InboundRelay::new(ClientOptions::default(), transport.clone());
        (relay, transport)
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_untraced_args_reach_handler_unchanged() {
        let (relay, transport) = relay();
        let tasks = CountingTasks::default();
        let args = object(json!({"someParam": "value", "count": 2}));
        let expected = args.clone();

        let result = relay
            .continue_traced(
                "durable-object-runEffect",
                |payload: Map<String, Value>| async move {
                    assert_eq!(payload, expected);
                    Ok::<_, HandlerError>(payload.len())
                },
                &tasks,
                Traced::new(args),
            )
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(tasks.count(), 1);

        tasks.inner.drain().await;
        let sent = transport.transactions();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].parent_span_id.is_none());
    }

    #[tokio::test]
    async fn test_malformed_context_runs_handler_with_one_flush() {
        for bad in [json!("garbage"), json!({"traceId": 5}), json!({})] {
            let (relay, transport) = relay();
            let tasks = CountingTasks::default();
            let args: Traced<Map<String, Value>> =
                crate::durable::decode(json!({"someParam": "v", "__trace": bad})).unwrap();

            let result = relay
                .continue_traced(
                    "durable-object-runEffect",
                    |payload: Map<String, Value>| async move {
                        assert_eq!(payload["someParam"], "v");
                        Ok::<_, HandlerError>(json!({"ok": true}))
                    },
                    &tasks,
                    args,
                )
                .await;

            assert_eq!(result, Ok(json!({"ok": true})));
            assert_eq!(tasks.count(), 1);
            tasks.inner.drain().await;
            let sent = transport.transactions();
            assert_eq!(sent.len(), 1);
            assert!(sent[0].parent_span_id.is_none());
        }
    }

    #[tokio::test]
    async fn test_handler_never_sees_reserved_key() {
        let (relay, _) = relay();
        let tasks = CountingTasks::default();
        let wire = json!({
            "someParam": "value",
            "__trace": {"traceId": "abc", "baggage": "k=v"}
        });
        let args: Traced<Map<String, Value>> = serde_json::from_value(wire).unwrap();

        let keys = relay
            .continue_traced(
                "durable-object-runEffect",
                |payload: Map<String, Value>| async move {
                    Ok::<_, HandlerError>(payload.keys().cloned().collect::<Vec<_>>())
                },
                &tasks,
                args,
            )
            .await
            .unwrap();

        assert_eq!(keys, vec!["someParam".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_handler_error_propagates_with_one_flush() {
        let (relay, transport) = relay();
        let tasks = CountingTasks::default();

        let result: Result<(), HandlerError> = relay
            .continue_traced(
                "durable-object-runEffectWithError",
                |_: Map<String, Value>| async { Err(HandlerError("boom".to_string())) },
                &tasks,
                Traced::new(Map::new()),
            )
            .await;

        assert_eq!(result, Err(HandlerError("boom".to_string())));
        assert_eq!(tasks.count(), 1);

        tasks.inner.drain().await;
        let sent = transport.transactions();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].spans[0].outcome,
            Some(SpanOutcome::Error {
                message: "boom".to_string()
            })
        );
        // Marked on the span, reported by the caller
        assert!(transport.errors().is_empty());
    }

    #[tokio::test]
    async fn test_succeeding_handler_value_returned_with_one_flush() {
        let (relay, transport) = relay();
        let tasks = CountingTasks::default();

        let result = relay
            .continue_traced(
                "durable-object-runEffect",
                |_: Map<String, Value>| async { Ok::<_, HandlerError>(json!({"answer": 42})) },
                &tasks,
                Traced::new(Map::new()),
            )
            .await;

        assert_eq!(result, Ok(json!({"answer": 42})));
        assert_eq!(tasks.count(), 1);

        tasks.inner.drain().await;
        let trace = &transport.transactions()[0];
        let span = &trace.spans[0];
        assert_eq!(span.name, "durable-object-runEffect");
        assert_eq!(span.op.as_deref(), Some(RPC_OP));
        assert_eq!(span.attributes[ORIGIN_ATTRIBUTE], json!(RPC_ORIGIN));
        assert_eq!(span.outcome, Some(SpanOutcome::Ok));
        assert_eq!(trace.tags[CLOUD_PROVIDER_TAG], DEFAULT_CLOUD_PROVIDER);
        assert!(trace.contexts.contains_key("cloud_resource"));
    }

    #[tokio::test]
    async fn test_round_trip_through_serializer() {
        let (relay, _) = relay();
        let tasks = CountingTasks::default();
        let ctx = TraceContext::new("abc", Some("k=v".to_string()));

        let wire = serde_json::to_string(&Traced::with_context(Map::new(), ctx)).unwrap();
        let args: Traced<Map<String, Value>> = serde_json::from_str(&wire).unwrap();

        let result = relay
            .continue_traced(
                "durable-object-runEffect",
                |payload: Map<String, Value>| async move {
                    assert!(payload.is_empty());
                    Ok::<_, HandlerError>(json!({"ok": true}))
                },
                &tasks,
                args,
            )
            .await;

        assert_eq!(result, Ok(json!({"ok": true})));
        assert_eq!(tasks.count(), 1);
        tasks.inner.drain().await;
    }

    #[tokio::test]
    async fn test_caller_trace_is_continued() {
        let (relay, transport) = relay();
        let tasks = CountingTasks::default();

        let (outbound, caller) = with_tracing(async {
            tracewire_tracing::start_span("GET /api/durable-object");
            let args = call_traced(|args: Traced<Map<String, Value>>| async move { args }, Map::new()).await;
            tracewire_tracing::end_span_ok();
            args
        })
        .await;

        let context = outbound.trace.clone().unwrap();
        let header: TraceHeader = context.trace_id.parse().unwrap();
        assert_eq!(header.trace_id, caller.trace_id);
        assert_eq!(header.parent_span_id, caller.spans[0].span_id);

        relay
            .continue_traced(
                "durable-object-runEffect",
                |_: Map<String, Value>| async { Ok::<_, HandlerError>(()) },
                &tasks,
                outbound,
            )
            .await
            .unwrap();
        tasks.inner.drain().await;

        let callee = &transport.transactions()[0];
        assert_eq!(callee.trace_id, caller.trace_id);
        assert_eq!(callee.parent_span_id.as_deref(), Some(caller.spans[0].span_id.as_str()));
    }

    #[tokio::test]
    async fn test_call_traced_outside_trace_sends_no_context() {
        let args = call_traced(|args: Traced<Map<String, Value>>| async move { args }, Map::new()).await;
        assert!(args.trace.is_none());
    }

    #[tokio::test]
    async fn test_custom_cloud_provider() {
        let (relay, transport) = relay();
        let relay = relay.with_cloud_provider("local");
        let tasks = CountingTasks::default();

        relay
            .continue_traced(
                "durable-object-runEffect",
                |_: Map<String, Value>| async { Ok::<_, HandlerError>(()) },
                &tasks,
                Traced::new(Map::new()),
            )
            .await
            .unwrap();
        tasks.inner.drain().await;

        assert_eq!(transport.transactions()[0].tags[CLOUD_PROVIDER_TAG], "local");
    }
}
