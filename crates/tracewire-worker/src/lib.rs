//! Demo worker for distributed tracing across RPC boundaries.
//!
//! - **Server**: axum API whose requests each run as a transaction in their
//!   own isolation scope, continuing traces from `x-trace`/`baggage` headers
//! - **Programs**: small span trees (including a failing one and a forked
//!   background one) to make trace shapes visible
//! - **Object**: `ExampleObject`, a Durable Object exposing the programs over
//!   traced RPC
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tracewire_tracing::MemoryTransport;
//! use tracewire_worker::{WorkerConfig, WorkerServer};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let server = WorkerServer::new(WorkerConfig::default(), Arc::new(MemoryTransport::new()));
//!     server.run().await
//! }
//! ```

pub mod error;
pub mod object;
pub mod programs;
pub mod server;

pub use error::{CapturedError, ProgramError, Result, WorkerError};
pub use object::{
    ExampleObject, ExampleProps, Greeting, RUN_EFFECT, RUN_EFFECT_WITH_ERROR, RUN_FORKED_EFFECT,
};
pub use programs::{
    CHILD_ERROR_MESSAGE, CHILD_ERROR_NAME, DEFAULT_FORK_DELAY, run_forked_program, run_program,
    run_program_with_error,
};
pub use server::{AppState, HTTP_ORIGIN, HTTP_SERVER_OP, WorkerConfig, WorkerServer};
