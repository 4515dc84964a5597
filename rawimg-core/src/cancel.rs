//! Cooperative cancellation shared by the stages of one run.

use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A one-shot cancellation flag.
///
/// Stages poll [`is_cancelled`](Self::is_cancelled) once per loop iteration.
/// Cancelling also disconnects an internal channel, which wakes any stage that
/// is blocked waiting on the transfer queue.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    // Never sent on; dropping it disconnects `watch`.
    trigger: Mutex<Option<Sender<()>>>,
    watch: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, watch) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                watch,
            }),
        }
    }

    /// Requests cancellation.
    ///
    /// Returns `true` only for the call that actually set the flag; later calls
    /// are no-ops and return `false`.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut trigger = self
            .inner
            .trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(trigger.take());
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// A receiver that becomes ready (disconnected) once the token is cancelled.
    pub(crate) fn watch(&self) -> Receiver<()> {
        self.inner.watch.clone()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
