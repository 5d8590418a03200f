//! Core data model for dispatch: calls go in, fragments come out.
//!
//! A [`Call`] addresses one registered handler by name and carries a raw
//! payload. While the handler runs it streams zero or more [`Fragment`]s to
//! the caller's sink; the engine stamps each fragment with the originating
//! call id and handler name so interleaved batch output stays attributable.
//! After the call finishes, an [`ExecutionSummary`] records what was
//! delivered and how the call ended.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::Error;

/// A single invocation request addressed to a named handler.
#[derive(Debug, Clone)]
pub struct Call {
    /// Caller-chosen correlation id, stamped onto every fragment the call
    /// produces.
    pub id: String,
    /// Name of the handler to execute.
    pub handler: String,
    /// Raw payload bytes, validated before the handler sees them.
    pub payload: Bytes,
}

impl Call {
    /// Builds a call addressed to `handler`.
    pub fn new(
        id: impl Into<String>,
        handler: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: id.into(),
            handler: handler.into(),
            payload: payload.into(),
        }
    }
}

/// Position of a fragment within a handler's output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    /// Interim output produced while the handler is still running.
    Progress,
    /// Final output; at most one non-error result closes a stream.
    Result,
}

impl FragmentKind {
    /// Wire-friendly name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Result => "result",
        }
    }
}

/// One unit of streamed handler output.
///
/// Handlers construct fragments with empty `call_id` and `handler` fields;
/// the engine fills both in at delivery time. Fields a handler did set are
/// left untouched, so relays can forward fragments on behalf of other calls.
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Correlation id of the originating call.
    pub call_id: String,
    /// Name of the handler that produced the fragment.
    pub handler: String,
    /// Whether this is interim progress or the final result.
    pub kind: FragmentKind,
    /// Serialized payload.
    pub data: Bytes,
    /// Marks a fragment that reports a failure instead of a payload.
    pub is_error: bool,
    /// Side-channel for annotations the payload itself does not carry.
    pub metadata: Option<Map<String, Value>>,
}

impl Fragment {
    /// Builds a final-result fragment from serialized payload bytes.
    pub fn result(data: impl Into<Bytes>) -> Self {
        Self {
            call_id: String::new(),
            handler: String::new(),
            kind: FragmentKind::Result,
            data: data.into(),
            is_error: false,
            metadata: None,
        }
    }

    /// Builds an interim progress fragment from serialized payload bytes.
    pub fn progress(data: impl Into<Bytes>) -> Self {
        Self {
            kind: FragmentKind::Progress,
            ..Self::result(data)
        }
    }

    /// Builds an error-flagged final fragment whose payload is the
    /// requester-facing message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::result(message.into())
        }
    }

    /// Attaches side-channel metadata to the fragment.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Record of how a single call went, handed to the after hook and used by
/// the engine to decide the call's return value.
///
/// `fragments` and `bytes` count only non-error fragments the sink actually
/// accepted; rejected or error-flagged fragments never inflate the totals.
#[derive(Debug)]
pub struct ExecutionSummary {
    /// Correlation id of the call.
    pub call_id: String,
    /// Name of the handler the call addressed.
    pub handler: String,
    /// Non-error fragments successfully delivered.
    pub fragments: usize,
    /// Total payload bytes across those fragments.
    pub bytes: usize,
    /// Terminal error, if the call failed.
    pub error: Option<Error>,
}
