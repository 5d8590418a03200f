//! A scriptable handler for exercising registries in tests.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use switchboard::{Fragment, Handler, HandlerMetadata, SinkHandle};

type ExecuteFn =
    Arc<dyn Fn(Bytes, SinkHandle) -> BoxFuture<'static, switchboard::Result<()>> + Send + Sync>;

/// Handler with configurable identity and scripted behavior.
///
/// The default behavior echoes the payload back as a single result
/// fragment. Clones share the invocation counter, so a test can keep one
/// clone for assertions and register the other.
///
/// ```
/// use switchboard_testkit::MockHandler;
///
/// let mock = MockHandler::new("echo");
/// let registry = switchboard_testkit::test_registry([mock.clone().into_arc()]);
/// assert!(registry.contains("echo"));
/// assert_eq!(mock.calls(), 0);
/// ```
#[derive(Clone)]
pub struct MockHandler {
    name: String,
    description: String,
    schema: serde_json::Value,
    metadata: HandlerMetadata,
    behavior: ExecuteFn,
    calls: Arc<AtomicUsize>,
}

impl MockHandler {
    /// Creates an echoing mock with a permissive object schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: "mock handler".to_string(),
            schema: serde_json::json!({ "type": "object" }),
            metadata: HandlerMetadata::default(),
            behavior: echo(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = schema;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: HandlerMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Replaces the scripted behavior.
    #[must_use]
    pub fn on_execute<F, Fut>(mut self, behavior: F) -> Self
    where
        F: Fn(Bytes, SinkHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = switchboard::Result<()>> + Send + 'static,
    {
        self.behavior = Arc::new(move |payload, sink| Box::pin(behavior(payload, sink)));
        self
    }

    /// Number of times the mock has been executed, across all clones.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Erases the concrete type for registration.
    #[must_use]
    pub fn into_arc(self) -> Arc<dyn Handler> {
        Arc::new(self)
    }
}

fn echo() -> ExecuteFn {
    Arc::new(|payload: Bytes, sink: SinkHandle| {
        Box::pin(async move {
            sink.deliver(Fragment::result(payload))?;
            Ok(())
        })
    })
}

#[async_trait]
impl Handler for MockHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn metadata(&self) -> HandlerMetadata {
        self.metadata.clone()
    }

    async fn execute(&self, payload: Bytes, sink: SinkHandle) -> switchboard::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.behavior)(payload, sink).await
    }
}

impl fmt::Debug for MockHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockHandler")
            .field("name", &self.name)
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}
