//! Cross-cutting handler wrappers: logging, fault recovery, timeouts.
//!
//! A [`Decorator`] is a transform from one handler to another. Wrappers
//! delegate name, description, schema, and metadata untouched, so a
//! decorated handler is indistinguishable from the original everywhere
//! except `execute`.
//! Chains are applied by [`Registry::decorate`](crate::Registry::decorate),
//! which replaces the previous chain and rebuilds from the undecorated
//! handler, so re-applying a chain never stacks a second copy of a wrapper
//! onto the first.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tracing::{debug, error, info};

use crate::{
    error::{Error, Result},
    handler::{Handler, HandlerMetadata},
    sink::SinkHandle,
};

/// Transform applied to a handler at registration time.
///
/// The first decorator in a chain becomes the outermost wrapper.
pub type Decorator = Arc<dyn Fn(Arc<dyn Handler>) -> Arc<dyn Handler> + Send + Sync>;

/// Decorator that logs execution start, finish, and failure with elapsed
/// time.
#[must_use]
pub fn logging() -> Decorator {
    Arc::new(|inner| Arc::new(LoggingHandler { inner }))
}

/// Decorator that converts a panicking handler into a system-class error.
#[must_use]
pub fn fault_recovery() -> Decorator {
    Arc::new(|inner| Arc::new(RecoveringHandler { inner }))
}

/// Decorator that bounds execution time.
///
/// The wrapper imposes `limit` on `execute`; expiry surfaces as
/// [`Error::Timeout`]. Metadata passes through untouched, and deadlines
/// nest, so when an engine deadline also applies the earlier of the two
/// cuts the call off. A zero `limit` adds no bound.
#[must_use]
pub fn timeout(limit: Duration) -> Decorator {
    Arc::new(move |inner| {
        if limit.is_zero() {
            inner
        } else {
            Arc::new(TimeoutHandler { inner, limit })
        }
    })
}

/// Runs a handler future, converting an escaped panic into the same
/// system-class error shape the recovery decorator produces.
pub(crate) async fn recover<F>(fut: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let detail = panic_detail(payload.as_ref());
            error!(panic = %detail, "Handler execution panicked");
            Err(Error::system(anyhow::anyhow!("handler panicked: {detail}")))
        }
    }
}

fn panic_detail(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

struct LoggingHandler {
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for LoggingHandler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn schema(&self) -> serde_json::Value {
        self.inner.schema()
    }

    fn metadata(&self) -> HandlerMetadata {
        self.inner.metadata()
    }

    async fn execute(&self, payload: Bytes, sink: SinkHandle) -> Result<()> {
        debug!(handler = %self.inner.name(), "Handler starting");
        let started = std::time::Instant::now();
        let result = self.inner.execute(payload, sink).await;
        let elapsed = started.elapsed();
        match &result {
            Ok(()) => info!(handler = %self.inner.name(), elapsed = ?elapsed, "Handler finished"),
            Err(err) => {
                error!(
                    handler = %self.inner.name(),
                    elapsed = ?elapsed,
                    error = ?err,
                    "Handler failed"
                );
            }
        }
        result
    }
}

struct RecoveringHandler {
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for RecoveringHandler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn schema(&self) -> serde_json::Value {
        self.inner.schema()
    }

    fn metadata(&self) -> HandlerMetadata {
        self.inner.metadata()
    }

    async fn execute(&self, payload: Bytes, sink: SinkHandle) -> Result<()> {
        recover(self.inner.execute(payload, sink)).await
    }
}

struct TimeoutHandler {
    inner: Arc<dyn Handler>,
    limit: Duration,
}

#[async_trait]
impl Handler for TimeoutHandler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn schema(&self) -> serde_json::Value {
        self.inner.schema()
    }

    fn metadata(&self) -> HandlerMetadata {
        self.inner.metadata()
    }

    async fn execute(&self, payload: Bytes, sink: SinkHandle) -> Result<()> {
        match tokio::time::timeout(self.limit, self.inner.execute(payload, sink)).await {
            Ok(result) => result,
            Err(_expired) => Err(Error::Timeout),
        }
    }
}
