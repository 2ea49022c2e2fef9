//! Close coordination for connections, channels and endpoints.
//!
//! `CloseState` is the shared machinery: an idempotent closed flag, an
//! ordered close-listener list, and a watch channel that `closed()` waiters
//! park on. Resources embed one and drive it in two steps: `begin()` claims
//! the close (exactly one caller wins), the winner releases the resource,
//! then `finish()` fires listeners and wakes waiters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

/// Callback invoked exactly once after a resource is fully released.
pub type CloseListener = Box<dyn FnOnce() + Send + 'static>;

/// Common contract for closeable resources.
///
/// `close()` is idempotent and may be invoked from any task. Closing an
/// already-closed resource is a no-op, never an error.
#[async_trait]
pub trait Closeable {
    /// Close the resource, waiting for the release to complete.
    async fn close(&self);

    /// Schedule closure without blocking the caller.
    fn close_async(&self);

    /// Register a close listener. Listeners fire exactly once, in
    /// registration order, after release; registering on an already-closed
    /// resource fires the listener immediately and synchronously.
    fn on_close(&self, listener: CloseListener);

    /// Whether close has been initiated.
    fn is_closed(&self) -> bool;
}

/// State shared by every closeable resource in the crate.
pub struct CloseState {
    /// Set by the first `begin()` caller; checked by operations that must
    /// fail with `ConnectionClosed` once teardown starts.
    begun: AtomicBool,
    /// Pending listeners; `None` once they have fired.
    listeners: Mutex<Option<Vec<CloseListener>>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl CloseState {
    pub fn new() -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            begun: AtomicBool::new(false),
            listeners: Mutex::new(Some(Vec::new())),
            done_tx,
            done_rx,
        }
    }

    /// Claim the close transition. Returns `true` for exactly one caller;
    /// everyone else sees `false` and must not release the resource again.
    pub fn begin(&self) -> bool {
        !self.begun.swap(true, Ordering::SeqCst)
    }

    /// Whether close has been initiated (release may still be in progress).
    pub fn is_closed(&self) -> bool {
        self.begun.load(Ordering::SeqCst)
    }

    /// Whether the release finished and listeners have fired.
    pub fn is_finished(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Fire listeners in registration order and wake `closed()` waiters.
    /// Called by the `begin()` winner after the resource is released.
    pub fn finish(&self) {
        let drained = self
            .listeners
            .lock()
            .expect("close listener lock poisoned")
            .take();
        // Run outside the lock so a listener may register on this state.
        if let Some(listeners) = drained {
            for listener in listeners {
                listener();
            }
        }
        let _ = self.done_tx.send(true);
    }

    /// Register a listener, or run it immediately if listeners already fired.
    pub fn on_close(&self, listener: CloseListener) {
        {
            let mut guard = self.listeners.lock().expect("close listener lock poisoned");
            if let Some(pending) = guard.as_mut() {
                pending.push(listener);
                return;
            }
        }
        listener();
    }

    /// Wait until the release completed and listeners fired.
    pub async fn closed(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CloseState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CloseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseState")
            .field("closed", &self.is_closed())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn begin_is_claimed_once() {
        let state = CloseState::new();
        assert!(state.begin());
        assert!(!state.begin());
        assert!(state.is_closed());
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let state = CloseState::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            state.on_close(Box::new(move || order.lock().unwrap().push(i)));
        }
        state.begin();
        state.finish();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn late_listener_fires_immediately() {
        let state = CloseState::new();
        state.begin();
        state.finish();

        let fired = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&fired);
        state.on_close(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_waits_for_finish() {
        let state = Arc::new(CloseState::new());
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.closed().await })
        };
        state.begin();
        state.finish();
        waiter.await.unwrap();
        assert!(state.is_finished());
    }
}
