//! Cross-crate integration and E2E tests
//!
//! These tests run the worker on a real socket, call it over HTTP and read
//! the telemetry back from the JSONL files it wrote.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracewire_rpc::{
    DurableObject, DurableObjectNamespace, InboundRelay, ObjectContext, RPC_OP, RpcError,
    TRACE_FIELD, Traced, decode, encode,
};
use tracewire_tracing::{
    BAGGAGE_HEADER, ClientOptions, Envelope, ErrorEvent, JsonlTransport, MemoryTransport,
    TRACE_HEADER, Trace, TraceHeader, TraceWriter, WriterConfig, with_tracing,
};
use tracewire_worker::{CHILD_ERROR_NAME, WorkerConfig, WorkerServer};

const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
const PARENT_SPAN_ID: &str = "00f067aa0ba902b7";

/// Get an available port for testing.
fn get_test_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A running worker writing telemetry to a temp file.
struct TestWorker {
    port: u16,
    trace_file: PathBuf,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
    _temp: tempfile::TempDir,
}

impl TestWorker {
    async fn start() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let trace_file = temp.path().join("traces").join("telemetry.jsonl");
        let transport = JsonlTransport::new(WriterConfig::session(&trace_file)).unwrap();

        let port = get_test_port();
        let config = WorkerConfig::new(format!("127.0.0.1:{}", port).parse().unwrap())
            .with_fork_delay(Duration::from_millis(10))
            .with_jitter_ms(0, 0);
        let server = WorkerServer::new(config, Arc::new(transport));

        let (shutdown, shutdown_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            server
                .run_with_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
        });

        // Wait for server to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        Self {
            port,
            trace_file,
            shutdown,
            handle,
            _temp: temp,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    /// Stop the server, wait for background flushes and read what was written.
    async fn stop(self) -> (Vec<Trace>, Vec<ErrorEvent>) {
        self.shutdown.send(()).unwrap();
        self.handle.await.unwrap().unwrap();
        read_envelopes(&self.trace_file)
    }
}

fn read_envelopes(path: &Path) -> (Vec<Trace>, Vec<ErrorEvent>) {
    let mut transactions = Vec::new();
    let mut errors = Vec::new();
    if !path.exists() {
        return (transactions, errors);
    }
    for envelope in TraceWriter::read_lines::<Envelope>(path).unwrap() {
        match envelope {
            Envelope::Transaction(trace) => transactions.push(trace),
            Envelope::Error(error) => errors.push(error),
        }
    }
    (transactions, errors)
}

fn caller_header() -> String {
    TraceHeader::new(TRACE_ID, PARENT_SPAN_ID, Some(true)).to_string()
}

/// E2E Test: caller trace flows through HTTP into the Durable Object
///
/// 1. Client sends a request carrying `x-trace` and `baggage`
/// 2. The request transaction continues the caller's trace
/// 3. The Durable Object continues it again from the RPC arguments
/// 4. Both transactions reach the JSONL file after shutdown
#[tokio::test]
async fn test_e2e_durable_object_continues_caller_trace() {
    let worker = TestWorker::start().await;

    let response = reqwest::Client::new()
        .get(worker.url("/api/durable-object"))
        .header(TRACE_HEADER, caller_header())
        .header(BAGGAGE_HEADER, "k=v")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"hello": "from durable object"}));

    let (transactions, errors) = worker.stop().await;
    assert!(errors.is_empty());
    assert_eq!(transactions.len(), 2);
    assert!(transactions.iter().all(|t| t.trace_id == TRACE_ID));
    assert!(transactions.iter().all(|t| t.tags["cloud.provider"] == "cloudflare"));

    let request = transactions
        .iter()
        .find(|t| t.find_span("GET /api/durable-object").is_some())
        .unwrap();
    assert_eq!(request.parent_span_id.as_deref(), Some(PARENT_SPAN_ID));
    assert_eq!(request.baggage.as_deref(), Some("k=v"));

    let rpc = transactions
        .iter()
        .find(|t| t.find_span("durable-object-runEffect").is_some())
        .unwrap();
    let span = rpc.find_span("durable-object-runEffect").unwrap();
    assert_eq!(span.op.as_deref(), Some(RPC_OP));
    assert!(span.find("parentEffect").is_some());
    // The object's transaction hangs off a span of the request transaction
    let parent = rpc.parent_span_id.as_deref().unwrap();
    assert_ne!(parent, PARENT_SPAN_ID);
}

/// E2E Test: a failing Durable Object keeps its error name end to end
#[tokio::test]
async fn test_e2e_durable_object_error_propagates() {
    let worker = TestWorker::start().await;

    let response = reqwest::get(worker.url("/api/durable-object-error"))
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["name"], CHILD_ERROR_NAME);

    let (transactions, errors) = worker.stop().await;
    assert_eq!(transactions.len(), 2);
    let trace_id = &transactions[0].trace_id;
    assert!(transactions.iter().all(|t| &t.trace_id == trace_id));
    assert!(transactions.iter().all(|t| t.has_error()));

    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.name == CHILD_ERROR_NAME));
    assert!(errors.iter().all(|e| e.trace_id.as_ref() == Some(trace_id)));
}

/// E2E Test: forked work started by a request is flushed before shutdown completes
#[tokio::test]
async fn test_e2e_forked_effect_is_drained_on_shutdown() {
    let worker = TestWorker::start().await;

    let response = reqwest::get(worker.url("/api/durable-object-forked-effect"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let (transactions, _) = worker.stop().await;
    assert_eq!(transactions.len(), 3);
    let background = transactions
        .iter()
        .find(|t| t.name.as_deref() == Some("effectWithBackgroundFork"))
        .unwrap();
    assert!(background.find_span("parentEffect").is_some());
    assert!(transactions.iter().all(|t| t.trace_id == background.trace_id));
}

/// E2E Test: ignored transactions and untraced routes write nothing
#[tokio::test]
async fn test_e2e_favicon_and_health_write_nothing() {
    let worker = TestWorker::start().await;
    let client = reqwest::Client::new();

    let favicon = client.get(worker.url("/favicon.ico")).send().await.unwrap();
    assert_eq!(favicon.status(), 404);
    let health = client.get(worker.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let (transactions, errors) = worker.stop().await;
    assert!(transactions.is_empty());
    assert!(errors.is_empty());
}

/// Echoes its arguments back through the inbound relay.
struct EchoObject {
    relay: InboundRelay,
}

#[async_trait]
impl DurableObject for EchoObject {
    async fn call(
        &mut self,
        method: &str,
        args: Value,
        ctx: &ObjectContext,
    ) -> tracewire_rpc::Result<Value> {
        let args: Traced<Value> = decode(args)?;
        let name = format!("echo-{method}");
        let echoed = self
            .relay
            .continue_traced(
                &name,
                |payload: Value| async move { Ok::<_, RpcError>(payload) },
                ctx.tasks(),
                args,
            )
            .await?;
        encode(&echoed)
    }
}

/// RPC Test: a custom object behind the namespace continues the caller's trace
/// and receives its arguments without the reserved field
#[tokio::test]
async fn test_custom_object_receives_arguments_without_trace_field() {
    let transport = Arc::new(MemoryTransport::new());
    let relay = InboundRelay::new(ClientOptions::default(), transport.clone());
    let ns = DurableObjectNamespace::new(move |_| EchoObject {
        relay: relay.clone(),
    });
    let stub = ns.get_by_name("echo");

    let (echoed, caller) = with_tracing(async {
        stub.call_traced::<_, Value>("say", json!({"words": "hi", "count": 2}))
            .await
    })
    .await;
    let echoed = echoed.unwrap();
    assert_eq!(echoed, json!({"words": "hi", "count": 2}));
    assert!(echoed.get(TRACE_FIELD).is_none());

    // Exactly one flush registered by the single call
    assert_eq!(ns.shutdown().await, 1);
    let sent = transport.transactions();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].trace_id, caller.trace_id);
    assert!(sent[0].find_span("echo-say").is_some());
}
