//! Managed connections: transparent re-establishment.
//!
//! # Responsibilities
//! - Re-dial a lost connection with exponential backoff
//! - Preserve one peer identity context across physical sessions, so
//!   cacheable credentials survive a reconnect
//! - Never retry authentication failures; only transport-level loss is
//!   retried

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::config::ReconnectConfig;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::identity::PeerIdentityContext;
use crate::lifecycle::Closeable;
use crate::observability::metrics;
use crate::resilience::backoff::reconnect_delay;

use super::builder::ConnectionDefinition;
use super::connection::Connection;

/// A logical connection that survives physical session loss.
///
/// [`connection`] hands out the live session, re-establishing it when
/// the previous one closed. The peer identity context is shared across
/// every session of this managed connection; identity handles from an
/// old session are invalid on the new one and must be re-derived.
///
/// [`connection`]: ManagedConnection::connection
pub struct ManagedConnection {
    endpoint: Endpoint,
    definition: ConnectionDefinition,
    peer_context: Arc<PeerIdentityContext>,
    reconnect: ReconnectConfig,
    current: ArcSwapOption<Connection>,
    /// Serializes re-establishment; concurrent callers share one dial.
    redial: tokio::sync::Mutex<()>,
    sessions: AtomicU64,
    closed: AtomicBool,
}

impl ManagedConnection {
    pub(crate) fn new(
        endpoint: Endpoint,
        definition: ConnectionDefinition,
        peer_context: Arc<PeerIdentityContext>,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            endpoint,
            definition,
            peer_context,
            reconnect,
            current: ArcSwapOption::from(None),
            redial: tokio::sync::Mutex::new(()),
            sessions: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// The live connection, dialing or re-dialing if necessary.
    pub async fn connection(&self) -> Result<Arc<Connection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        if let Some(connection) = self.live() {
            return Ok(connection);
        }

        let _guard = self.redial.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        // Someone else may have re-established while we waited.
        if let Some(connection) = self.live() {
            return Ok(connection);
        }
        self.establish().await
    }

    /// The identity context shared across every session of this managed
    /// connection. Same instance before and after a reconnect.
    pub fn peer_identity_context(&self) -> Arc<PeerIdentityContext> {
        Arc::clone(&self.peer_context)
    }

    /// Physical sessions established so far.
    pub fn session_count(&self) -> u64 {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the managed connection and its live session.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(connection) = self.current.swap(None) {
            connection.close().await;
        }
    }

    fn live(&self) -> Option<Arc<Connection>> {
        self.current
            .load_full()
            .filter(|connection| !connection.is_closed())
    }

    async fn establish(&self) -> Result<Arc<Connection>> {
        let reconnecting = self.sessions.load(Ordering::SeqCst) > 0;
        let mut last_error = Error::ConnectionClosed;

        for attempt in 0..self.reconnect.max_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(reconnect_delay(attempt, &self.reconnect)).await;
            }
            match self
                .endpoint
                .connect_with(&self.definition, Arc::clone(&self.peer_context))
                .await
            {
                Ok(connection) => {
                    let connection = Arc::new(connection);
                    self.current.store(Some(Arc::clone(&connection)));
                    self.sessions.fetch_add(1, Ordering::SeqCst);
                    if reconnecting {
                        metrics::reconnected();
                        tracing::info!(
                            uri = %self.definition.uri,
                            attempt,
                            "managed connection re-established"
                        );
                    }
                    return Ok(connection);
                }
                // Authentication failures are the caller's to handle;
                // retrying them here would hammer the credential layer.
                Err(e @ Error::Authentication(_)) => return Err(e),
                Err(e @ Error::InvalidArgument(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        uri = %self.definition.uri,
                        attempt,
                        error = %e,
                        "managed connection dial failed"
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("uri", &self.definition.uri.as_str())
            .field("sessions", &self.session_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
