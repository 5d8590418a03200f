//! # Switchboard
//!
//! An async dispatch engine for named handlers that stream their output.
//! Handlers declare a JSON Schema for their input; the registry routes
//! calls to them by name, enforces admission limits and deadlines,
//! recovers panics into errors, and counts what each call delivered.
//!
//! ## Defining and Executing a Handler
//!
//! Typed handlers are built from an input type and an async closure. The
//! input type derives its schema and may carry a business rule:
//!
//! ```
//! use std::sync::{Arc, Mutex};
//!
//! use switchboard::{Call, HandlerBuilder, Input, Registry, SinkHandle};
//!
//! #[derive(serde::Deserialize, schemars::JsonSchema)]
//! struct Greet {
//!     name: String,
//! }
//!
//! impl Input for Greet {}
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> switchboard::Result<()> {
//! let registry = Registry::default();
//! registry.register(
//!     HandlerBuilder::new("greet", "Greets by name")
//!         .build(|input: Greet| async move { Ok(format!("hello, {}", input.name)) })?,
//! );
//!
//! let collected = Arc::new(Mutex::new(Vec::new()));
//! let sink_collected = Arc::clone(&collected);
//! let sink = SinkHandle::from_fn(move |fragment| {
//!     sink_collected.lock().unwrap().push(fragment.data);
//!     Ok(())
//! });
//!
//! registry
//!     .execute(Call::new("c1", "greet", r#"{"name":"ada"}"#), sink)
//!     .await?;
//! assert_eq!(collected.lock().unwrap()[0], "\"hello, ada\"");
//! # Ok(())
//! # }
//! ```
//!
//! ## Streaming, Dynamic, and Proxy Handlers
//!
//! [`HandlerBuilder::build_streaming`] hands the handler an [`Emitter`] for
//! incremental progress fragments. [`HandlerBuilder::build_dynamic`] and
//! [`HandlerBuilder::build_proxy`] take the schema as a runtime document
//! instead of a Rust type, for handlers that front another system.
//!
//! ## Decoration
//!
//! Cross-cutting behavior wraps handlers through [`Decorator`] values:
//! [`decorator::logging`], [`decorator::fault_recovery`], and
//! [`decorator::timeout`]. Chains rebuild from the undecorated handler, so
//! re-decoration never stacks duplicate wrappers.
//!
//! ## Batches and Shutdown
//!
//! [`Registry::execute_batch`] runs calls concurrently against one shared
//! sink with partial success: a failing call becomes an error-flagged
//! fragment rather than sinking the batch. [`Registry::shutdown`] stops
//! admission and drains in-flight calls within a grace period.

pub mod builder;
pub mod call;
pub mod decorator;
pub mod error;
pub mod extractor;
pub mod handler;
pub mod registry;
pub mod schema;
pub mod sink;

pub use anyhow;
pub use builder::{Emitter, HandlerBuilder};
pub use call::{Call, ExecutionSummary, Fragment, FragmentKind};
pub use decorator::Decorator;
pub use error::{Error, ErrorClass, Result};
pub use extractor::{Extractor, Input};
pub use handler::{Handler, HandlerMetadata};
pub use registry::{Registry, RegistryBuilder};
pub use schema::SchemaCatalog;
// Full schemars re-export so dependents can derive `JsonSchema` for their
// input types without naming the crate themselves.
pub use schemars;
pub use schemars::JsonSchema;
pub use sink::{Sink, SinkHandle};
