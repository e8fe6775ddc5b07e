//! Trace relay across Durable Object RPC boundaries.
//!
//! - **Envelope**: `Traced<A>`, RPC arguments plus the caller's `TraceContext`
//!   under the reserved `__trace` key
//! - **Relay**: `call_traced()` on the way out, `InboundRelay::continue_traced()`
//!   on the way in
//! - **Background**: the `BackgroundTasks` ("wait until") contract, `WaitUntil`,
//!   and `spawn_transaction()` for work that outlives a request
//! - **Durable**: in-process Durable Objects addressed by name
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::{Map, Value, json};
//! use tracewire_rpc::{InboundRelay, Traced, WaitUntil, call_traced};
//! use tracewire_tracing::{ClientOptions, MemoryTransport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let relay = InboundRelay::new(ClientOptions::default(), Arc::new(MemoryTransport::new()));
//!     let tasks = WaitUntil::new();
//!
//!     let result = call_traced(
//!         |args: Traced<Map<String, Value>>| {
//!             relay.continue_traced(
//!                 "durable-object-runEffect",
//!                 |_payload| async { Ok::<_, std::convert::Infallible>(json!({"ok": true})) },
//!                 &tasks,
//!                 args,
//!             )
//!         },
//!         Map::new(),
//!     )
//!     .await;
//!
//!     assert_eq!(result.unwrap(), json!({"ok": true}));
//!     tasks.drain().await;
//! }
//! ```

pub mod background;
pub mod durable;
pub mod envelope;
pub mod error;
pub mod relay;

pub use background::{BackgroundTask, BackgroundTasks, WaitUntil, spawn_transaction};
pub use durable::{DurableObject, DurableObjectNamespace, DurableObjectStub, ObjectContext, decode, encode};
pub use envelope::{TRACE_FIELD, Traced};
pub use error::{Result, RpcError};
pub use relay::{
    CLOUD_PROVIDER_TAG, DEFAULT_CLOUD_PROVIDER, InboundRelay, RPC_OP, RPC_ORIGIN, call_traced,
};
