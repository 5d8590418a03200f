//! The handler contract: what the engine dispatches to.
//!
//! A [`Handler`] is a named, schema-described unit of work. Most handlers
//! are produced by the builders in [`crate::builder`], which add payload
//! validation and typed function signatures on top; implementing the trait
//! directly is the escape hatch for handlers that manage their own parsing.

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::Result, sink::SinkHandle};

/// Capability facet of a handler.
///
/// Every field has a zero value meaning "no such capability": no timeout
/// override, no tags, no version, not dangerous. Handlers that expose
/// nothing simply rely on [`Default`], so callers never need to distinguish
/// "absent" from "empty".
#[derive(Debug, Clone, Default)]
pub struct HandlerMetadata {
    /// Per-handler execution deadline, overriding the registry default.
    pub timeout: Option<std::time::Duration>,
    /// Free-form labels for discovery and routing.
    pub tags: Vec<String>,
    /// Implementation version of the handler.
    pub version: Option<String>,
    /// Marks handlers whose side effects warrant caller confirmation.
    pub dangerous: bool,
}

/// A named, schema-described unit of executable work.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Unique name the handler is registered and addressed under.
    fn name(&self) -> &str;

    /// Human-readable description of what the handler does.
    fn description(&self) -> &str;

    /// Schema document describing valid payloads.
    ///
    /// The returned document is self-contained and independently owned;
    /// callers may mutate their copy freely.
    fn schema(&self) -> serde_json::Value;

    /// Capability facet; the default is all zero values.
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::default()
    }

    /// Runs the handler against a raw payload, streaming output fragments
    /// into `sink`.
    ///
    /// Dropping the returned future cancels the call; deadlines are imposed
    /// by the engine wrapping this future.
    ///
    /// # Errors
    ///
    /// Client-class errors report invalid payloads; system-class errors
    /// report execution failures. A sink rejection surfaces as the
    /// stream-aborted sentinel.
    async fn execute(&self, payload: Bytes, sink: SinkHandle) -> Result<()>;
}
