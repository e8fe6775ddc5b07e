//! HTTP API for the demo worker.
//!
//! Every `/api` request runs in its own isolation scope with a fresh
//! reporting client. The trace is continued from the `x-trace` and
//! `baggage` request headers, the request gets an `http.server` span, and
//! the client is flushed in the background once the response is ready.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rand::Rng;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracewire_rpc::{
    BackgroundTasks, CLOUD_PROVIDER_TAG, DEFAULT_CLOUD_PROVIDER, DurableObjectNamespace,
    InboundRelay, WaitUntil,
};
use tracewire_tracing::{
    BAGGAGE_HEADER, ClientOptions, IsolationScope, ORIGIN_ATTRIBUTE, ReportingClient,
    SharedTransport, SpanOptions, TRACE_HEADER, TraceContext, capture_error, capture_transaction,
    continue_trace, end_span_error, end_span_ok, set_attribute, start_span_with_options,
    with_isolation_scope,
};

use crate::error::{CapturedError, Result};
use crate::object::{
    ExampleObject, ExampleProps, RUN_EFFECT, RUN_EFFECT_WITH_ERROR, RUN_FORKED_EFFECT,
};
use crate::programs::{DEFAULT_FORK_DELAY, run_forked_program, run_program, run_program_with_error};

/// Span op for inbound HTTP requests.
pub const HTTP_SERVER_OP: &str = "http.server";

/// Origin attribute value for inbound HTTP spans.
pub const HTTP_ORIGIN: &str = "auto.http.server";

/// Configuration for the worker server.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Address to bind the server to.
    pub bind_addr: SocketAddr,
    /// Whether to enable CORS.
    pub enable_cors: bool,
    /// Whether to enable request logging (HTTP layer).
    pub enable_http_logging: bool,
    /// Options for every reporting client the worker builds.
    pub client: ClientOptions,
    /// Value of the cloud provider tag on inbound RPC transactions.
    pub cloud_provider: String,
    /// Name of the Durable Object the API calls into.
    pub object_name: String,
    /// Delay before forked programs start.
    pub fork_delay: Duration,
    /// Random pause before and after handler work, in milliseconds.
    pub jitter_ms: (u64, u64),
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            enable_cors: true,
            enable_http_logging: true,
            client: ClientOptions::default(),
            cloud_provider: DEFAULT_CLOUD_PROVIDER.to_string(),
            object_name: "static-name".to_string(),
            fork_delay: DEFAULT_FORK_DELAY,
            jitter_ms: (10, 100),
        }
    }
}

impl WorkerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_client_options(mut self, options: ClientOptions) -> Self {
        self.client = options;
        self
    }

    pub fn with_cloud_provider(mut self, provider: impl Into<String>) -> Self {
        self.cloud_provider = provider.into();
        self
    }

    pub fn with_fork_delay(mut self, delay: Duration) -> Self {
        self.fork_delay = delay;
        self
    }

    /// Set the random pause range; `(0, 0)` disables it.
    pub fn with_jitter_ms(mut self, min: u64, max: u64) -> Self {
        self.jitter_ms = (min, max.max(min));
        self
    }
}

/// Shared state for the worker's handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    options: ClientOptions,
    transport: SharedTransport,
    tasks: WaitUntil,
    objects: DurableObjectNamespace<ExampleObject>,
    object_name: String,
    cloud_provider: String,
    fork_delay: Duration,
    jitter_ms: (u64, u64),
}

impl AppState {
    fn new(config: &WorkerConfig, transport: SharedTransport) -> Self {
        let relay = InboundRelay::new(config.client.clone(), Arc::clone(&transport))
            .with_cloud_provider(config.cloud_provider.clone());
        let fork_delay = config.fork_delay;
        let objects =
            DurableObjectNamespace::new(move |_| ExampleObject::new(relay.clone(), fork_delay));

        Self {
            options: config.client.clone(),
            transport,
            tasks: WaitUntil::new(),
            objects,
            object_name: config.object_name.clone(),
            cloud_provider: config.cloud_provider.clone(),
            fork_delay,
            jitter_ms: config.jitter_ms,
        }
    }

    /// A fresh scope and client for one request.
    fn new_scope(&self) -> IsolationScope {
        let client = ReportingClient::new(self.options.clone(), Arc::clone(&self.transport));
        let mut scope = IsolationScope::new(Arc::new(client));
        scope.set_tag(CLOUD_PROVIDER_TAG, self.cloud_provider.as_str());
        scope
    }

    /// Background work registered by requests.
    pub fn tasks(&self) -> &WaitUntil {
        &self.tasks
    }

    pub fn objects(&self) -> &DurableObjectNamespace<ExampleObject> {
        &self.objects
    }

    /// Wait for all request and object background work.
    pub async fn drain(&self) -> usize {
        let objects = self.objects.shutdown().await;
        objects + self.tasks.drain().await
    }

    async fn sleep_random(&self) {
        let (min, max) = self.jitter_ms;
        if max == 0 {
            return;
        }
        let ms = rand::rng().random_range(min..=max);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// The demo worker server.
#[derive(Debug)]
pub struct WorkerServer {
    config: WorkerConfig,
    state: AppState,
}

impl WorkerServer {
    pub fn new(config: WorkerConfig, transport: SharedTransport) -> Self {
        let state = AppState::new(&config, transport);
        Self { config, state }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the axum router for the worker.
    pub fn router(&self) -> Router {
        let api = Router::new()
            .route("/api/effect", get(handle_effect))
            .route("/api/effect-error", get(handle_effect_error))
            .route("/api/durable-object", get(handle_durable_object))
            .route("/api/durable-object-error", get(handle_durable_object_error))
            .route("/api/forked-effect", get(handle_forked_effect))
            .route(
                "/api/durable-object-forked-effect",
                get(handle_durable_object_forked_effect),
            )
            .fallback(handle_not_found)
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(
                        self.state.clone(),
                        trace_requests,
                    ))
                    .layer(middleware::from_fn(capture_errors)),
            )
            .with_state(self.state.clone());

        let mut router = Router::new()
            .route("/health", get(handle_health))
            .merge(api);

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        if self.config.enable_http_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Run the worker server.
    pub async fn run(self) -> std::io::Result<()> {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Run the worker server with graceful shutdown.
    ///
    /// Background work still pending when the server stops is drained before
    /// returning.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "Starting worker server");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        let completed = self.state.drain().await;
        tracing::info!(completed, "Drained background work");
        Ok(())
    }
}

/// Trace context sent by the caller, if any.
fn trace_context_from_headers(headers: &HeaderMap) -> TraceContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    match header(TRACE_HEADER) {
        Some(trace_id) => TraceContext::new(trace_id, header(BAGGAGE_HEADER)),
        None => TraceContext::empty(),
    }
}

/// Run each request as a transaction in its own isolation scope.
async fn trace_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let context = trace_context_from_headers(request.headers());
    let method = request.method().to_string();
    let name = format!("{} {}", method, request.uri().path());

    let scope = state.new_scope();
    let client = Arc::clone(scope.client());

    let response = with_isolation_scope(scope, async {
        let (response, trace) = continue_trace(&context, async {
            start_span_with_options(
                name.as_str(),
                SpanOptions::new()
                    .op(HTTP_SERVER_OP)
                    .attribute(ORIGIN_ATTRIBUTE, HTTP_ORIGIN)
                    .attribute("http.request.method", &method),
            );
            let response = next.run(request).await;
            let status = response.status();
            set_attribute("http.response.status_code", status.as_u16());
            if status.is_server_error() {
                end_span_error(status.to_string());
            } else {
                end_span_ok();
            }
            response
        })
        .await;
        capture_transaction(trace);
        response
    })
    .await;

    state.tasks.wait_until(Box::pin(async move {
        client.flush_default().await;
    }));
    response
}

/// Log and report handler errors, then pass the response through.
async fn capture_errors(request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    if let Some(CapturedError(error)) = response.extensions().get::<CapturedError>() {
        tracing::error!(error = %error, "Request failed");
        capture_error(error.as_ref());
    }
    response
}

/// Handle GET /health
async fn handle_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "tracewire"
    }))
}

async fn handle_not_found() -> impl IntoResponse {
    (
        axum::http::StatusCode::NOT_FOUND,
        Json(json!({
            "type": "error",
            "error": {"type": "not_found", "message": "Not found"}
        })),
    )
}

/// Handle GET /api/effect
async fn handle_effect(State(state): State<AppState>) -> Result<Json<Value>> {
    state.sleep_random().await;
    run_program().await?;
    state.sleep_random().await;
    Ok(Json(json!([{"ok": true}])))
}

/// Handle GET /api/effect-error
async fn handle_effect_error(State(state): State<AppState>) -> Result<Json<Value>> {
    state.sleep_random().await;
    run_program_with_error().await?;
    state.sleep_random().await;
    Ok(Json(json!([{"ok": true}])))
}

/// Handle GET /api/durable-object
async fn handle_durable_object(State(state): State<AppState>) -> Result<Json<Value>> {
    state.sleep_random().await;
    let stub = state.objects.get_by_name(&state.object_name);
    let res: Value = stub.call_traced(RUN_EFFECT, ExampleProps::default()).await?;
    state.sleep_random().await;
    Ok(Json(res))
}

/// Handle GET /api/durable-object-error
async fn handle_durable_object_error(State(state): State<AppState>) -> Result<Json<Value>> {
    state.sleep_random().await;
    let stub = state.objects.get_by_name(&state.object_name);
    let res: Value = stub
        .call_traced(RUN_EFFECT_WITH_ERROR, ExampleProps::default())
        .await?;
    state.sleep_random().await;
    Ok(Json(res))
}

/// Handle GET /api/forked-effect
async fn handle_forked_effect(State(state): State<AppState>) -> Result<Json<Value>> {
    state.sleep_random().await;
    run_forked_program(&state.tasks, state.fork_delay).await?;
    state.sleep_random().await;
    Ok(Json(json!({"ok": true})))
}

/// Handle GET /api/durable-object-forked-effect
async fn handle_durable_object_forked_effect(State(state): State<AppState>) -> Result<Json<Value>> {
    state.sleep_random().await;
    let stub = state.objects.get_by_name(&state.object_name);
    state.sleep_random().await;
    let props = ExampleProps {
        just_to_show_that_types_work: Some(true),
    };
    let res: Value = stub.call_traced(RUN_FORKED_EFFECT, props).await?;
    Ok(Json(res))
}
