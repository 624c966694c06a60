use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use mio::Waker;

/// A callback queued for exactly one run at the start of the next dispatch
/// cycle. Boxed so the queue can carry heterogeneous closures.
pub type DelayedCallback = Box<dyn FnOnce() + Send>;

/// FIFO of callbacks to run once at the start of the next dispatch cycle.
///
/// This is the *only* part of the event loop safe to touch from another
/// thread: `sender()` hands out a cloneable, `Send` producer backed by
/// `std::sync::mpsc`, while the loop itself drains the
/// receiver from the thread that calls `run`. The `has_pending` flag lets
/// the dispatch cycle check for work without paying a channel `recv` when
/// nothing is queued.
pub struct DelayedQueue {
    receiver: mpsc::Receiver<DelayedCallback>,
    sender: mpsc::Sender<DelayedCallback>,
    has_pending: Arc<AtomicBool>,
    waker: Arc<Mutex<Option<Arc<Waker>>>>,
}

impl DelayedQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        DelayedQueue {
            receiver,
            sender,
            has_pending: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(Mutex::new(None)),
        }
    }

    /// Wires in the Poller's waker so a cross-thread `enqueue` pulls a
    /// blocked loop out of its poll wait. Installed once the loop's Poller
    /// exists.
    pub fn install_waker(&self, waker: Arc<Waker>) {
        *self.waker.lock().unwrap() = Some(waker);
    }

    /// A cloneable, thread-safe handle for enqueueing callbacks from any
    /// thread.
    pub fn sender(&self) -> DelayedSender {
        DelayedSender {
            inner: self.sender.clone(),
            has_pending: self.has_pending.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.has_pending.load(Ordering::Acquire)
    }

    /// Detaches the current FIFO contents and runs every callback in order.
    /// Callbacks enqueued *during* this call (by a running callback) are
    /// left in the channel for the *next* cycle, bounding work per cycle. A
    /// panicking callback is caught and logged so it cannot strand the
    /// remaining callbacks in this batch or the dispatch cycle itself.
    pub fn drain_and_run(&self) {
        self.has_pending.store(false, Ordering::Release);

        let pending: Vec<DelayedCallback> = self.receiver.try_iter().collect();
        for callback in pending {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                log::error!("delayed callback panicked");
            }
        }
    }
}

impl Default for DelayedQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct DelayedSender {
    inner: mpsc::Sender<DelayedCallback>,
    has_pending: Arc<AtomicBool>,
    waker: Arc<Mutex<Option<Arc<Waker>>>>,
}

impl DelayedSender {
    /// Enqueues a callback. O(1), safe to call from any thread. If the loop
    /// is currently blocked in its poll wait, this wakes it.
    pub fn enqueue(&self, callback: DelayedCallback) {
        // The channel send itself cannot fail here: the queue outlives every
        // sender clone it hands out (it owns the receiving end for the
        // lifetime of the loop), so a send error would mean the loop has
        // already been dropped out from under a live sender, which callers
        // are not expected to do.
        let _ = self.inner.send(callback);
        self.has_pending.store(true, Ordering::Release);

        if let Some(waker) = self.waker.lock().unwrap().as_ref() {
            let _ = waker.wake();
        }
    }
}
