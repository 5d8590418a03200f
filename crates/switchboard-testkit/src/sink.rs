//! Sinks that capture or refuse output, for asserting on delivery.

use std::sync::{Arc, Mutex};

use switchboard::{Fragment, Sink, SinkHandle};

/// Captures every delivered fragment for later assertions.
///
/// Clones share the same store. An optional quota makes the sink reject
/// deliveries past a limit, which is how abort handling gets exercised.
///
/// ```
/// use switchboard_testkit::RecordingSink;
///
/// let sink = RecordingSink::new();
/// let handle = sink.handle();
/// handle.deliver(switchboard::Fragment::result("out")).unwrap();
/// assert_eq!(sink.fragments().len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    fragments: Arc<Mutex<Vec<Fragment>>>,
    quota: Option<usize>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts at most `limit` fragments, rejecting the rest.
    #[must_use]
    pub fn with_quota(limit: usize) -> Self {
        Self {
            fragments: Arc::new(Mutex::new(Vec::new())),
            quota: Some(limit),
        }
    }

    /// A handle suitable for passing to the engine. Deliveries land in
    /// this sink's store.
    #[must_use]
    pub fn handle(&self) -> SinkHandle {
        SinkHandle::new(self.clone())
    }

    /// Snapshot of everything delivered so far.
    ///
    /// # Panics
    ///
    /// Panics if the store lock was poisoned by a panicking thread.
    #[must_use]
    pub fn fragments(&self) -> Vec<Fragment> {
        self.fragments.lock().expect("fragment store poisoned").clone()
    }

    /// Fragments stamped with `call_id`, in delivery order.
    ///
    /// # Panics
    ///
    /// Panics if the store lock was poisoned by a panicking thread.
    #[must_use]
    pub fn fragments_for(&self, call_id: &str) -> Vec<Fragment> {
        self.fragments
            .lock()
            .expect("fragment store poisoned")
            .iter()
            .filter(|fragment| fragment.call_id == call_id)
            .cloned()
            .collect()
    }

    /// Number of fragments accepted so far.
    ///
    /// # Panics
    ///
    /// Panics if the store lock was poisoned by a panicking thread.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fragments.lock().expect("fragment store poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Sink for RecordingSink {
    fn deliver(&mut self, fragment: Fragment) -> anyhow::Result<()> {
        let mut fragments = self.fragments.lock().expect("fragment store poisoned");
        if let Some(limit) = self.quota
            && fragments.len() >= limit
        {
            anyhow::bail!("delivery quota of {limit} exhausted");
        }
        fragments.push(fragment);
        Ok(())
    }
}
