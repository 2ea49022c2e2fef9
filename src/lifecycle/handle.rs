//! Reference-counted handle duplication over a shared resource.
//!
//! # Responsibilities
//! - Hand out duplicate handles that share one underlying resource
//! - Give each handle an independent close-listener set
//! - Run the release routine exactly once, when the last handle closes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;

use super::closeable::{CloseListener, CloseState};

type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Shared by all handles over one resource.
struct HandleCore {
    /// Open handles still contributing a count.
    remaining: AtomicUsize,
    /// The real release routine; taken by the count-to-zero transition.
    release: Mutex<Option<ReleaseFn>>,
}

impl HandleCore {
    /// Run the release routine if this caller drove the count to zero.
    async fn release_if_last(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let release = self
            .release
            .lock()
            .expect("release lock poisoned")
            .take();
        if let Some(release) = release {
            release().await;
        }
    }
}

/// One countable reference to a shared closeable resource.
///
/// Closing a handle decrements the shared count; the underlying resource is
/// released only when the count reaches zero. Each handle carries its own
/// listener set, fired when *this* handle closes. A handle contributes one
/// count no matter how many times it is closed.
pub struct Handle {
    core: Arc<HandleCore>,
    state: Arc<CloseState>,
}

impl Handle {
    /// Create the first handle over a resource. `release` runs when the last
    /// handle closes.
    pub fn new<F, Fut>(release: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            core: Arc::new(HandleCore {
                remaining: AtomicUsize::new(1),
                release: Mutex::new(Some(Box::new(move || Box::pin(release())))),
            }),
            state: Arc::new(CloseState::new()),
        }
    }

    /// Duplicate this handle: shares the resource, contributes one more
    /// count, and starts with an empty listener set.
    ///
    /// Duplicating after the resource was released yields a handle that is
    /// already closed.
    pub fn duplicate(&self) -> Self {
        let acquired = self
            .core
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == 0 {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .is_ok();

        let state = Arc::new(CloseState::new());
        if !acquired {
            state.begin();
            state.finish();
        }
        Self {
            core: Arc::clone(&self.core),
            state,
        }
    }

    /// Close this handle, releasing the resource if it was the last one.
    pub async fn close(&self) {
        close_inner(Arc::clone(&self.core), Arc::clone(&self.state)).await;
    }

    /// Schedule closure of this handle without blocking.
    pub fn close_async(&self) {
        let core = Arc::clone(&self.core);
        let state = Arc::clone(&self.state);
        tokio::spawn(close_inner(core, state));
    }

    /// Register a listener fired when this handle closes.
    pub fn on_close(&self, listener: CloseListener) {
        self.state.on_close(listener);
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Wait until this handle's close completed.
    pub async fn closed(&self) {
        self.state.closed().await;
    }

    /// Open handles still sharing the resource.
    pub fn remaining(&self) -> usize {
        self.core.remaining.load(Ordering::Acquire)
    }
}

async fn close_inner(core: Arc<HandleCore>, state: Arc<CloseState>) {
    if !state.begin() {
        return;
    }
    core.release_if_last().await;
    state.finish();
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.state.is_closed() {
            return;
        }
        // Leaked handles must not pin the resource open forever.
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let core = Arc::clone(&self.core);
            let state = Arc::clone(&self.state);
            rt.spawn(close_inner(core, state));
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("remaining", &self.remaining())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_handle(released: &Arc<AtomicU32>) -> Handle {
        let released = Arc::clone(released);
        Handle::new(move || async move {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn last_close_releases_exactly_once() {
        let released = Arc::new(AtomicU32::new(0));
        let first = counting_handle(&released);
        let handles: Vec<Handle> = (0..4).map(|_| first.duplicate()).collect();

        first.close().await;
        for handle in &handles[..3] {
            handle.close().await;
            assert_eq!(released.load(Ordering::SeqCst), 0);
        }
        handles[3].close().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn double_close_contributes_one_count() {
        let released = Arc::new(AtomicU32::new(0));
        let first = counting_handle(&released);
        let second = first.duplicate();

        first.close().await;
        first.close().await;
        assert_eq!(released.load(Ordering::SeqCst), 0);

        second.close().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_after_release_is_closed() {
        let released = Arc::new(AtomicU32::new(0));
        let handle = counting_handle(&released);
        handle.close().await;

        let late = handle.duplicate();
        assert!(late.is_closed());
        late.close().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handle_listeners_are_independent() {
        let released = Arc::new(AtomicU32::new(0));
        let first = counting_handle(&released);
        let second = first.duplicate();

        let first_fired = Arc::new(AtomicU32::new(0));
        let second_fired = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&first_fired);
        first.on_close(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        let s = Arc::clone(&second_fired);
        second.on_close(Box::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        first.close().await;
        assert_eq!(first_fired.load(Ordering::SeqCst), 1);
        assert_eq!(second_fired.load(Ordering::SeqCst), 0);

        second.close().await;
        assert_eq!(second_fired.load(Ordering::SeqCst), 1);
    }
}
