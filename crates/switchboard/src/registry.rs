//! Handler registration and the execution engine.
//!
//! # Architecture
//!
//! The registry owns three things: the named handler table (each entry kept
//! in decorated and undecorated form), the decorator chain, and the
//! execution machinery for admission control, deadlines, fault recovery,
//! lifecycle hooks, and output counting. Execution follows a fixed order
//! for every call:
//!
//! 1. reject when draining;
//! 2. resolve the handler by name;
//! 3. count the call in-flight, re-check the draining flag, and acquire an
//!    admission slot;
//! 4. fix the effective deadline (handler override, else registry default);
//! 5. fire the before hook;
//! 6. run the handler with a counting, stamping sink;
//! 7. recover a panic into a system-class error (when enabled);
//! 8. fire the after hook exactly once with the summary and elapsed time;
//! 9. release the slot and the in-flight count on every exit path.
//!
//! # Thread Safety
//!
//! `Registry` is cheaply cloneable; clones share all state. Handler and
//! decorator tables sit behind `RwLock` and are never held across an
//! await. The in-flight counter is atomic and managed by an RAII guard, so
//! it is decremented exactly once on every exit path, unwinding included.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    call::{Call, ExecutionSummary, Fragment},
    decorator::{self, Decorator},
    error::{Error, Result},
    handler::Handler,
    sink::{Sink, SinkHandle},
};

type BeforeHook = Arc<dyn Fn(&Call) + Send + Sync>;
type AfterHook = Arc<dyn Fn(&ExecutionSummary, Duration) + Send + Sync>;
type FragmentHook = Arc<dyn Fn(&Fragment) + Send + Sync>;

/// Constructor-time configuration for a [`Registry`].
///
/// Everything about a registry is fixed at build time except the handler
/// table and the decorator chain.
pub struct RegistryBuilder {
    default_timeout: Duration,
    max_concurrency: usize,
    recover_faults: bool,
    on_before: Option<BeforeHook>,
    on_after: Option<AfterHook>,
    on_fragment: Option<FragmentHook>,
    decorators: Vec<Decorator>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            max_concurrency: 10,
            recover_faults: true,
            on_before: None,
            on_after: None,
            on_fragment: None,
            decorators: Vec::new(),
        }
    }
}

impl RegistryBuilder {
    /// Starts from the defaults: 5s timeout, 10 concurrent calls, fault
    /// recovery on.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline applied when a handler carries no timeout override. Zero
    /// disables the default entirely.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Upper bound on concurrently executing calls; `0` means unlimited.
    #[must_use]
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Whether a panicking handler is converted into a system-class error
    /// instead of unwinding through the caller.
    #[must_use]
    pub fn recover_faults(mut self, enabled: bool) -> Self {
        self.recover_faults = enabled;
        self
    }

    /// Hook fired after admission, before the handler runs.
    #[must_use]
    pub fn on_before(mut self, hook: impl Fn(&Call) + Send + Sync + 'static) -> Self {
        self.on_before = Some(Arc::new(hook));
        self
    }

    /// Hook fired exactly once per admitted call, after it settles.
    #[must_use]
    pub fn on_after(
        mut self,
        hook: impl Fn(&ExecutionSummary, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_after = Some(Arc::new(hook));
        self
    }

    /// Hook fired for every non-error fragment the sink accepted.
    #[must_use]
    pub fn on_fragment(mut self, hook: impl Fn(&Fragment) + Send + Sync + 'static) -> Self {
        self.on_fragment = Some(Arc::new(hook));
        self
    }

    /// Appends a decorator to the initial chain; the first appended ends up
    /// outermost.
    #[must_use]
    pub fn decorator(mut self, decorator: Decorator) -> Self {
        self.decorators.push(decorator);
        self
    }

    /// Builds the registry.
    #[must_use]
    pub fn build(self) -> Registry {
        Registry {
            inner: Arc::new(RegistryInner {
                handlers: RwLock::new(HashMap::new()),
                decorators: RwLock::new(self.decorators),
                default_timeout: self.default_timeout,
                recover_faults: self.recover_faults,
                on_before: self.on_before,
                on_after: self.on_after,
                on_fragment: self.on_fragment,
                admission: (self.max_concurrency > 0)
                    .then(|| Semaphore::new(self.max_concurrency)),
                draining: AtomicBool::new(false),
                in_flight: AtomicU64::new(0),
            }),
        }
    }
}

/// Dispatch and execution engine for named handlers.
///
/// Cloning is cheap and every clone shares the same state, which is how
/// batch execution runs one task per call.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    handlers: RwLock<HashMap<String, Registration>>,
    decorators: RwLock<Vec<Decorator>>,
    default_timeout: Duration,
    recover_faults: bool,
    on_before: Option<BeforeHook>,
    on_after: Option<AfterHook>,
    on_fragment: Option<FragmentHook>,
    admission: Option<Semaphore>,
    draining: AtomicBool,
    in_flight: AtomicU64,
}

/// Both forms of a registered handler. The undecorated form is what chain
/// rebuilds start from.
struct Registration {
    decorated: Arc<dyn Handler>,
    undecorated: Arc<dyn Handler>,
}

impl Default for Registry {
    fn default() -> Self {
        RegistryBuilder::new().build()
    }
}

impl Registry {
    /// Starts a configuration builder.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Registers a handler under its own name, replacing any existing
    /// registration with that name.
    ///
    /// The current decorator chain is applied immediately; the undecorated
    /// form is retained for future chain rebuilds.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock was poisoned by a panicking thread.
    pub fn register(&self, handler: Arc<dyn Handler>) {
        let name = handler.name().to_string();
        let decorated = self.apply_chain(&handler);
        let mut handlers = self.inner.handlers.write().expect("handler table poisoned");
        handlers.insert(
            name.clone(),
            Registration {
                decorated,
                undecorated: handler,
            },
        );
        drop(handlers);
        info!(handler = %name, "Registered handler");
    }

    /// Replaces the decorator chain and rebuilds every registered handler
    /// from its undecorated form.
    ///
    /// The previous chain is discarded, never wrapped over: each wrapper is
    /// applied once per entry of the new chain, so swapping one chain for
    /// another cannot duplicate a decorator's side effects.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock was poisoned by a panicking thread.
    pub fn decorate(&self, decorators: impl IntoIterator<Item = Decorator>) {
        let mut chain = self
            .inner
            .decorators
            .write()
            .expect("decorator chain poisoned");
        *chain = decorators.into_iter().collect();
        let total = chain.len();
        drop(chain);

        let mut handlers = self.inner.handlers.write().expect("handler table poisoned");
        for registration in handlers.values_mut() {
            registration.decorated = self.apply_chain(&registration.undecorated);
        }
        let rebuilt = handlers.len();
        drop(handlers);
        debug!(decorators = total, handlers = rebuilt, "Rebuilt decorator chain");
    }

    fn apply_chain(&self, handler: &Arc<dyn Handler>) -> Arc<dyn Handler> {
        let chain = self
            .inner
            .decorators
            .read()
            .expect("decorator chain poisoned");
        // First in the chain is outermost, so wrap back-to-front.
        chain
            .iter()
            .rev()
            .fold(Arc::clone(handler), |wrapped, decorate| decorate(wrapped))
    }

    /// Returns the decorated handler registered under `name`.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock was poisoned by a panicking thread.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        let handlers = self.inner.handlers.read().expect("handler table poisoned");
        handlers
            .get(name)
            .map(|registration| Arc::clone(&registration.decorated))
    }

    /// Returns every decorated handler, sorted by name.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock was poisoned by a panicking thread.
    #[must_use]
    pub fn handlers(&self) -> Vec<Arc<dyn Handler>> {
        let handlers = self.inner.handlers.read().expect("handler table poisoned");
        let mut list: Vec<Arc<dyn Handler>> = handlers
            .values()
            .map(|registration| Arc::clone(&registration.decorated))
            .collect();
        drop(handlers);
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }

    /// Whether a handler is registered under `name`.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock was poisoned by a panicking thread.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .handlers
            .read()
            .expect("handler table poisoned")
            .contains_key(name)
    }

    /// Number of registered handlers.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock was poisoned by a panicking thread.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .handlers
            .read()
            .expect("handler table poisoned")
            .len()
    }

    /// Whether the registry has no handlers.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock was poisoned by a panicking thread.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Executes one call, streaming output into `sink`.
    ///
    /// Fragments are stamped with the call id and handler name, non-error
    /// deliveries are counted into the summary, and the effective deadline
    /// is the handler's timeout override when positive, otherwise the
    /// registry default.
    ///
    /// # Errors
    ///
    /// Client-class errors for bad input or an unknown handler; the
    /// shutting-down sentinel when draining; the timeout sentinel on
    /// deadline expiry; the stream-aborted sentinel when the sink rejected
    /// a fragment; system-class errors for handler faults.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock was poisoned, or when fault recovery is
    /// disabled and the handler itself panics.
    #[instrument(skip(self, call, sink), fields(call_id = %call.id, handler = %call.handler))]
    pub async fn execute(&self, call: Call, sink: SinkHandle) -> Result<()> {
        if self.inner.draining.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let Some(handler) = self.get(&call.handler) else {
            debug!("Handler not found");
            return Err(Error::NotFound {
                name: call.handler,
            });
        };

        let _guard = InFlightGuard::begin(&self.inner.in_flight);
        // Re-checked after the increment: `shutdown` swaps the flag before
        // it reads the counter, so one side always observes the other and a
        // drained shutdown means no call is past this point.
        if self.inner.draining.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let _permit = match &self.inner.admission {
            Some(semaphore) => match semaphore.acquire().await {
                Ok(permit) => Some(permit),
                // The semaphore only closes on shutdown.
                Err(_closed) => return Err(Error::ShuttingDown),
            },
            None => None,
        };

        let deadline = effective_deadline(handler.metadata().timeout, self.inner.default_timeout);

        if let Some(hook) = &self.inner.on_before {
            hook(&call);
        }

        let Call {
            id,
            handler: handler_name,
            payload,
        } = call;
        let counters = DeliveryCounters::default();
        let counting = SinkHandle::new(CountingSink {
            downstream: sink,
            call_id: id.clone(),
            handler: handler_name.clone(),
            counters: counters.clone(),
            on_fragment: self.inner.on_fragment.clone(),
        });

        let started = Instant::now();
        let execution = handler.execute(payload, counting);
        let outcome = if self.inner.recover_faults {
            bounded(deadline, decorator::recover(execution)).await
        } else {
            bounded(deadline, execution).await
        };
        let elapsed = started.elapsed();

        let mut summary = ExecutionSummary {
            call_id: id,
            handler: handler_name,
            fragments: counters.fragments(),
            bytes: counters.bytes(),
            error: outcome.err(),
        };
        if let Some(hook) = &self.inner.on_after {
            hook(&summary, elapsed);
        }
        match &summary.error {
            None => debug!(
                fragments = summary.fragments,
                bytes = summary.bytes,
                elapsed = ?elapsed,
                "Call completed"
            ),
            Some(err) => error!(error = ?err, elapsed = ?elapsed, "Call failed"),
        }

        match summary.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Executes a batch of calls concurrently against one shared sink.
    ///
    /// Partial success is the contract: a failing call becomes an
    /// error-flagged final fragment for that call id (client-class
    /// retryable failures carry `{"retryable": true}` metadata) and never
    /// suppresses other calls' output. The sink's own mutex serializes
    /// interleaved deliveries.
    ///
    /// # Errors
    ///
    /// Only batch-level aborts: the sink rejected a fragment, or a call
    /// task panicked with fault recovery disabled. The first such error is
    /// returned after every task has been awaited.
    #[instrument(skip(self, calls, sink), fields(calls = calls.len()))]
    pub async fn execute_batch(&self, calls: Vec<Call>, sink: SinkHandle) -> Result<()> {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for call in calls {
            let registry = self.clone();
            let sink = sink.clone();
            tasks.spawn(async move {
                let call_id = call.id.clone();
                let handler = call.handler.clone();
                match registry.execute(call, sink.clone()).await {
                    Ok(()) => Ok(()),
                    // The sink already refused output; reporting to it
                    // would be futile. Abort the batch.
                    Err(err) if err.is_stream_aborted() => Err(err),
                    Err(err) => {
                        let mut fragment = Fragment::error(err.to_string());
                        fragment.call_id = call_id;
                        fragment.handler = handler;
                        if err.retryable() {
                            let mut metadata = serde_json::Map::new();
                            metadata
                                .insert("retryable".to_string(), serde_json::Value::Bool(true));
                            fragment = fragment.with_metadata(metadata);
                        }
                        sink.deliver(fragment)
                    }
                }
            });
        }

        let mut batch_result: Result<()> = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if batch_result.is_ok() {
                        batch_result = Err(err);
                    }
                }
                Err(join_err) => {
                    warn!(error = %join_err, "Batch call task did not finish");
                    if batch_result.is_ok() {
                        batch_result =
                            Err(Error::system(anyhow::anyhow!("call task failed: {join_err}")));
                    }
                }
            }
        }
        batch_result
    }

    /// Drains the registry: stops admitting calls and waits for in-flight
    /// ones to finish.
    ///
    /// Idempotent: the first call begins draining and waits up to `grace`;
    /// every later call returns immediately.
    ///
    /// # Errors
    ///
    /// Returns the timeout sentinel when in-flight calls remain after
    /// `grace`.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        if self.inner.draining.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(semaphore) = &self.inner.admission {
            semaphore.close();
        }
        info!("Registry shutting down, draining in-flight calls");

        let deadline = Instant::now() + grace;
        loop {
            let remaining = self.inner.in_flight.load(Ordering::SeqCst);
            if remaining == 0 {
                info!("Registry drained");
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(in_flight = remaining, "Shutdown grace period expired");
                return Err(Error::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Handler override when positive, else the registry default; a zero
/// default disables deadlines.
fn effective_deadline(handler_timeout: Option<Duration>, default: Duration) -> Option<Duration> {
    match handler_timeout {
        Some(timeout) if !timeout.is_zero() => Some(timeout),
        _ if default.is_zero() => None,
        _ => Some(default),
    }
}

async fn bounded<F>(deadline: Option<Duration>, fut: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(outcome) => outcome,
            Err(_expired) => Err(Error::Timeout),
        },
        None => fut.await,
    }
}

/// Counts a call as in-flight for exactly as long as the guard lives.
#[must_use = "the guard must be held for the duration of the call"]
struct InFlightGuard<'a> {
    counter: &'a AtomicU64,
}

impl<'a> InFlightGuard<'a> {
    fn begin(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                Some(count.saturating_sub(1))
            });
    }
}

#[derive(Clone, Default)]
struct DeliveryCounters {
    fragments: Arc<AtomicUsize>,
    bytes: Arc<AtomicUsize>,
}

impl DeliveryCounters {
    fn fragments(&self) -> usize {
        self.fragments.load(Ordering::Relaxed)
    }

    fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Sink layer the engine wraps around the caller's sink for one call:
/// stamps attribution onto fragments, counts accepted non-error
/// deliveries, and fires the fragment hook for exactly those.
struct CountingSink {
    downstream: SinkHandle,
    call_id: String,
    handler: String,
    counters: DeliveryCounters,
    on_fragment: Option<FragmentHook>,
}

impl Sink for CountingSink {
    fn deliver(&mut self, mut fragment: Fragment) -> anyhow::Result<()> {
        if fragment.call_id.is_empty() {
            fragment.call_id = self.call_id.clone();
        }
        if fragment.handler.is_empty() {
            fragment.handler = self.handler.clone();
        }
        let payload_len = fragment.data.len();
        let is_error = fragment.is_error;
        let observed = self
            .on_fragment
            .as_ref()
            .map(|_hook| fragment.clone());
        self.downstream.deliver_raw(fragment)?;
        if !is_error {
            self.counters.fragments.fetch_add(1, Ordering::Relaxed);
            self.counters.bytes.fetch_add(payload_len, Ordering::Relaxed);
            if let (Some(hook), Some(fragment)) = (&self.on_fragment, &observed) {
                hook(fragment);
            }
        }
        Ok(())
    }
}
