//! Peer identity handles and task-scoped identity assertion.
//!
//! A [`ConnectionPeerIdentity`] is a capability token: "identity N is in
//! effect for calls issued from the current execution context on this
//! connection". Handles are cheap; the numeric ID is the identity. The
//! binding itself is a tokio task-local scoped by [`run_as`].
//!
//! [`run_as`]: ConnectionPeerIdentity::run_as

use std::future::Future;
use std::sync::Arc;

use crate::connection::connection::ConnectionInner;
use crate::connection::ConnectionId;
use crate::error::{Error, Result};

use super::SecurityIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    connection: ConnectionId,
    id: u32,
}

tokio::task_local! {
    static CURRENT_BINDING: Binding;
}

/// The identity ID bound to the current task for `connection`, if any.
/// A binding scoped to a different connection instance does not apply;
/// after a managed reconnect the caller must re-derive.
pub(crate) fn current_binding_for(connection: ConnectionId) -> Option<u32> {
    CURRENT_BINDING
        .try_with(|binding| (binding.connection == connection).then_some(binding.id))
        .ok()
        .flatten()
}

/// A handle asserting that a specific identity ID is in effect for the
/// current execution context's calls on a connection.
///
/// Many handles may reference the same ID. Each live handle holds one
/// reference in the identity table; dynamic IDs are retired once the
/// connection is closing and the last handle is gone.
pub struct ConnectionPeerIdentity {
    connection: Arc<ConnectionInner>,
    id: u32,
}

impl ConnectionPeerIdentity {
    pub(crate) fn new(connection: Arc<ConnectionInner>, id: u32) -> Self {
        connection.identity_table().retain(id);
        Self { connection, id }
    }

    /// The numeric identity ID: 0 is the connection identity, 1 the
    /// anonymous identity, ≥2 dynamically registered identities.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Whether this handle can still be asserted. Handles are invalidated
    /// when their connection closes or is re-established.
    pub fn is_valid(&self) -> bool {
        !self.connection.is_closing()
            && self.connection.identity_table().lookup(self.id).is_some()
    }

    /// The identity material registered under this handle's ID.
    pub fn security_identity(&self) -> Option<SecurityIdentity> {
        self.connection
            .identity_table()
            .lookup(self.id)
            .map(|m| m.to_security_identity())
    }

    /// Run a future with this identity bound to the execution context.
    /// Calls made inside resolve [`peer_identity_id`] to this handle's ID
    /// without re-authenticating.
    ///
    /// [`peer_identity_id`]: crate::connection::Connection::peer_identity_id
    pub async fn run_as<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        if !self.is_valid() {
            return Err(Error::ConnectionClosed);
        }
        let binding = Binding {
            connection: self.connection.id(),
            id: self.id,
        };
        Ok(CURRENT_BINDING.scope(binding, fut).await)
    }
}

impl Clone for ConnectionPeerIdentity {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.connection), self.id)
    }
}

impl Drop for ConnectionPeerIdentity {
    fn drop(&mut self) {
        self.connection.identity_table().release(self.id);
    }
}

impl std::fmt::Debug for ConnectionPeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPeerIdentity")
            .field("id", &self.id)
            .field("connection", &self.connection.id())
            .field("valid", &self.is_valid())
            .finish()
    }
}
