//! Fragment delivery: the [`Sink`] contract and the shared [`SinkHandle`].
//!
//! A sink is the caller-supplied receiving end of a handler's output
//! stream. Delivery is synchronous; handlers do their async work first and
//! hand finished fragments over. Returning an error from [`Sink::deliver`]
//! rejects the fragment and aborts the stream.
//!
//! # Thread Safety
//!
//! [`SinkHandle`] wraps a sink in `Arc<Mutex<…>>` so it can be cloned into
//! every concurrent call of a batch. The mutex is the serialization point:
//! no two fragments are ever delivered to the same sink at the same time,
//! no matter how many handlers are streaming into it.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use crate::{
    call::Fragment,
    error::{Error, Result},
};

/// Receiving end of a handler's output stream.
pub trait Sink: Send {
    /// Accepts one fragment.
    ///
    /// # Errors
    ///
    /// Returning an error rejects the fragment; the engine treats the
    /// rejection as a stream abort and stops the producing call.
    fn deliver(&mut self, fragment: Fragment) -> anyhow::Result<()>;
}

impl<F> Sink for F
where
    F: FnMut(Fragment) -> anyhow::Result<()> + Send,
{
    fn deliver(&mut self, fragment: Fragment) -> anyhow::Result<()> {
        self(fragment)
    }
}

/// Cloneable, mutex-serialized handle to a [`Sink`].
///
/// All clones of a handle deliver into the same underlying sink, one
/// fragment at a time. This is the handle the engine passes to handlers and
/// shares across every call of a batch.
#[derive(Clone)]
pub struct SinkHandle {
    inner: Arc<Mutex<dyn Sink>>,
}

impl SinkHandle {
    /// Wraps a sink in a shareable handle.
    pub fn new(sink: impl Sink + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
        }
    }

    /// Wraps a closure in a shareable handle.
    pub fn from_fn(f: impl FnMut(Fragment) -> anyhow::Result<()> + Send + 'static) -> Self {
        Self::new(f)
    }

    /// Delivers one fragment, serialized against all other clones.
    ///
    /// # Errors
    ///
    /// Returns the stream-aborted sentinel when the sink rejects the
    /// fragment; the sentinel's detail carries the sink's own rejection
    /// text. A poisoned sink lock counts as a rejection.
    pub fn deliver(&self, fragment: Fragment) -> Result<()> {
        self.deliver_raw(fragment).map_err(|rejection| Error::StreamAborted {
            detail: format!("{rejection:#}"),
        })
    }

    /// Delivery without sentinel wrapping, for the engine's counting layer.
    pub(crate) fn deliver_raw(&self, fragment: Fragment) -> anyhow::Result<()> {
        match self.inner.lock() {
            Ok(mut sink) => sink.deliver(fragment),
            Err(_) => Err(anyhow::anyhow!("sink lock poisoned")),
        }
    }
}

impl fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_handle() -> (SinkHandle, Arc<Mutex<Vec<Fragment>>>) {
        let store = Arc::new(Mutex::new(Vec::new()));
        let sink_store = Arc::clone(&store);
        let handle = SinkHandle::from_fn(move |fragment| {
            sink_store.lock().unwrap().push(fragment);
            Ok(())
        });
        (handle, store)
    }

    #[test]
    fn test_closures_are_sinks() {
        let mut count = 0;
        {
            let mut sink = |_fragment: Fragment| -> anyhow::Result<()> {
                count += 1;
                Ok(())
            };
            sink.deliver(Fragment::result("a")).unwrap();
            sink.deliver(Fragment::result("b")).unwrap();
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn test_handle_clones_share_one_sink() {
        let (handle, store) = collecting_handle();
        let clone = handle.clone();
        handle.deliver(Fragment::result("first")).unwrap();
        clone.deliver(Fragment::result("second")).unwrap();
        assert_eq!(store.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_rejection_becomes_stream_aborted() {
        let handle = SinkHandle::from_fn(|_fragment| Err(anyhow::anyhow!("refused")));
        let err = handle.deliver(Fragment::result("x")).unwrap_err();
        assert!(err.is_stream_aborted());
        assert!(err.detail().unwrap().contains("refused"));
    }

    #[test]
    fn test_poisoned_lock_counts_as_rejection() {
        let handle = SinkHandle::from_fn(|_fragment| panic!("sink blew up"));
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = handle.deliver(Fragment::result("x"));
        }));
        assert!(panicked.is_err());

        let err = handle.deliver(Fragment::result("y")).unwrap_err();
        assert!(err.is_stream_aborted());
        assert!(err.detail().unwrap().contains("poisoned"));
    }
}
