//! The traced argument envelope.
//!
//! [`Traced<A>`] pairs an RPC payload with the caller's trace context. On the
//! wire it is the payload's own object with one reserved key, [`TRACE_FIELD`],
//! added next to the payload's fields:
//!
//! ```json
//! { "someParam": "value", "__trace": { "traceId": "...", "baggage": "..." } }
//! ```
//!
//! Deserializing consumes the reserved key, so the payload never sees it. A
//! reserved key that is not a valid context is logged and read as absent;
//! it never fails the call.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracewire_tracing::{TraceContext, current_trace_context};

/// Reserved key carrying the trace context inside serialized arguments.
pub const TRACE_FIELD: &str = "__trace";

/// RPC arguments with an optional trace context attached.
///
/// The payload must serialize as an object (a struct or a map).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Traced<A> {
    /// Trace context of the caller, if it had an active trace.
    #[serde(
        rename = "__trace",
        default,
        deserialize_with = "lenient_context",
        skip_serializing_if = "Option::is_none"
    )]
    pub trace: Option<TraceContext>,

    /// The handler's arguments.
    #[serde(flatten)]
    pub payload: A,
}

impl<A> Traced<A> {
    /// Wrap a payload without a trace context.
    pub fn new(payload: A) -> Self {
        Self {
            trace: None,
            payload,
        }
    }

    /// Wrap a payload with an explicit trace context.
    pub fn with_context(payload: A, trace: TraceContext) -> Self {
        Self {
            trace: Some(trace),
            payload,
        }
    }

    /// Wrap a payload with a snapshot of the ambient active trace.
    pub fn capture(payload: A) -> Self {
        Self {
            trace: current_trace_context(),
            payload,
        }
    }

    /// Split into trace context and payload.
    pub fn into_parts(self) -> (Option<TraceContext>, A) {
        (self.trace, self.payload)
    }
}

fn lenient_context<'de, D>(deserializer: D) -> Result<Option<TraceContext>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    match serde_json::from_value(value) {
        Ok(context) => Ok(Some(context)),
        Err(e) => {
            tracing::warn!(error = %e, "Malformed {} in RPC arguments, ignoring it", TRACE_FIELD);
            Ok(None)
        }
    }
}
