//! Trace propagation formats.
//!
//! A trace crosses a process boundary as a [`TraceContext`]: the trace header
//! (`<trace-id>-<parent-span-id>[-<sampled>]`) plus an optional baggage string.
//! Over HTTP the pair travels in the [`TRACE_HEADER`] and [`BAGGAGE_HEADER`]
//! headers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// HTTP header carrying the trace header value.
pub const TRACE_HEADER: &str = "x-trace";
/// HTTP header carrying baggage.
pub const BAGGAGE_HEADER: &str = "baggage";

const TRACE_ID_LEN: usize = 32;
const SPAN_ID_LEN: usize = 16;

/// Errors parsing a trace header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropagationError {
    #[error("empty trace header")]
    Empty,

    #[error("malformed trace header '{0}'")]
    Malformed(String),
}

/// Serializable trace identifier pair, carried across process boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    /// Trace header value: `<trace-id>-<parent-span-id>[-<sampled>]`.
    pub trace_id: String,

    /// Baggage string, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baggage: Option<String>,
}

impl TraceContext {
    pub fn new(trace_id: impl Into<String>, baggage: Option<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            baggage,
        }
    }

    /// A context that continues nothing; continuing it starts a new trace.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.trace_id.is_empty()
    }

    /// Parse the trace header.
    pub fn header(&self) -> Result<TraceHeader, PropagationError> {
        self.trace_id.parse()
    }
}

/// Parsed trace header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHeader {
    pub trace_id: String,
    pub parent_span_id: String,
    /// Sampling decision of the caller; `None` defers to the receiver.
    pub sampled: Option<bool>,
}

impl TraceHeader {
    pub fn new(
        trace_id: impl Into<String>,
        parent_span_id: impl Into<String>,
        sampled: Option<bool>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            parent_span_id: parent_span_id.into(),
            sampled,
        }
    }
}

fn is_hex_id(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl FromStr for TraceHeader {
    type Err = PropagationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PropagationError::Empty);
        }

        let malformed = || PropagationError::Malformed(s.to_string());
        let mut parts = s.split('-');
        let trace_id = parts.next().ok_or_else(malformed)?;
        let span_id = parts.next().ok_or_else(malformed)?;
        let sampled = match parts.next() {
            None => None,
            Some("1") => Some(true),
            Some("0") => Some(false),
            Some(_) => return Err(malformed()),
        };

        if parts.next().is_some()
            || !is_hex_id(trace_id, TRACE_ID_LEN)
            || !is_hex_id(span_id, SPAN_ID_LEN)
        {
            return Err(malformed());
        }

        Ok(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            parent_span_id: span_id.to_ascii_lowercase(),
            sampled,
        })
    }
}

impl fmt::Display for TraceHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.trace_id, self.parent_span_id)?;
        match self.sampled {
            Some(true) => write!(f, "-1"),
            Some(false) => write!(f, "-0"),
            None => Ok(()),
        }
    }
}
