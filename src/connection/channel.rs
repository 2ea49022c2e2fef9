//! Channel handles and pending channel opens.
//!
//! # Responsibilities
//! - Represent one logical channel multiplexed over a connection
//! - Track the multiplexer slot a channel occupies (released on close)
//! - Resolve pending opens to a usable channel or a terminal failure,
//!   never a silent drop

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::sync::OwnedSemaphorePermit;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lifecycle::{CloseListener, CloseState, Closeable};
use crate::observability::metrics;
use crate::transport::{ChannelId, ChannelOptions, Transport};

use super::connection::ConnectionInner;

struct ChannelInner {
    id: ChannelId,
    service: String,
    options: ChannelOptions,
    connection: Weak<ConnectionInner>,
    /// Multiplexer slot; dropping it frees capacity for new opens.
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    close: CloseState,
}

/// One logical communication stream bound to a named service.
///
/// Message exchange happens elsewhere; this handle covers identification
/// and lifecycle. Clones share the same underlying channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        service: String,
        options: ChannelOptions,
        connection: Weak<ConnectionInner>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                service,
                options,
                connection,
                permit: Mutex::new(Some(permit)),
                close: CloseState::new(),
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// The service name this channel was opened against.
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    /// Wait until this channel's close completed.
    pub async fn closed(&self) {
        self.inner.close.closed().await;
    }

    async fn close_with(&self, notify_peer: bool) {
        if !self.inner.close.begin() {
            return;
        }
        if let Some(connection) = self.inner.connection.upgrade() {
            connection.forget_channel(self.inner.id);
            if notify_peer && !connection.is_closing() {
                connection.transport().close_channel(self.inner.id).await;
            }
        }
        drop(
            self.inner
                .permit
                .lock()
                .expect("channel permit lock poisoned")
                .take(),
        );
        metrics::channel_closed();
        self.inner.close.finish();
    }

    /// Close driven by the owning connection's cascade: the transport is
    /// going down wholesale, so no per-channel message is sent.
    pub(crate) async fn close_for_connection(&self) {
        self.close_with(false).await;
    }
}

#[async_trait]
impl Closeable for Channel {
    async fn close(&self) {
        self.close_with(true).await;
    }

    fn close_async(&self) {
        let channel = self.clone();
        tokio::spawn(async move { channel.close_with(true).await });
    }

    fn on_close(&self, listener: CloseListener) {
        self.inner.close.on_close(listener);
    }

    fn is_closed(&self) -> bool {
        self.inner.close.is_closed()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("service", &self.inner.service)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct CancelState {
    token: Uuid,
    transport: Arc<dyn Transport>,
    requested: AtomicBool,
}

impl CancelState {
    fn fire(&self) {
        if self.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let token = self.token;
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move { transport.cancel_open(token).await });
        }
    }
}

/// A pending channel open.
///
/// Resolves to the channel or a terminal error; the connection completes
/// every pending open when it closes, so the future never dangles.
/// Cancelling (explicitly or by dropping the future) before the peer
/// responds releases the multiplex slot on both sides; once the peer has
/// accepted, the cancel is a no-op and the channel is delivered.
pub struct ChannelFuture {
    rx: oneshot::Receiver<Result<Channel>>,
    cancel: Option<Arc<CancelState>>,
    done: bool,
}

impl ChannelFuture {
    pub(crate) fn pending(
        rx: oneshot::Receiver<Result<Channel>>,
        token: Uuid,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            rx,
            cancel: Some(Arc::new(CancelState {
                token,
                transport,
                requested: AtomicBool::new(false),
            })),
            done: false,
        }
    }

    /// A future that failed before any request reached the peer.
    pub(crate) fn failed(error: Error) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self {
            rx,
            cancel: None,
            done: false,
        }
    }

    /// Ask the peer to abandon this open. The future still resolves:
    /// `Cancelled` if the peer had not accepted, or the delivered channel
    /// if it had.
    pub fn cancel(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.fire();
        }
    }
}

impl Future for ChannelFuture {
    type Output = Result<Channel>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                self.done = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                // Sender dropped without resolving: the connection went away.
                self.done = true;
                Poll::Ready(Err(Error::ConnectionClosed))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ChannelFuture {
    fn drop(&mut self) {
        // Dropping an unresolved open counts as cancellation; the peer
        // side must not retain a half-open channel.
        if !self.done {
            if let Some(cancel) = &self.cancel {
                cancel.fire();
            }
        }
    }
}

impl std::fmt::Debug for ChannelFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelFuture")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
