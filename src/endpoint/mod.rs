//! Endpoint: owner of connections and connect factory.
//!
//! # Data Flow
//! ```text
//! connect(builder):
//!     snapshot → connector for the URI scheme → transport dial
//!         → Connection (outbound, registered here)
//!         → immediate? authenticate the connection identity now
//!
//! accept(transport, local identity):
//!     → Connection (inbound, registered here)
//!
//! close():
//!     → cascade: every owned connection shuts down
//! ```
//!
//! # Design Decisions
//! - Service registration and protocol-handler plugins live outside this
//!   crate; the endpoint only resolves connectors by URI scheme
//! - The permission policy is injected; this crate names the checkpoint,
//!   not the permission system
//! - The registry holds weak references: a connection the caller dropped
//!   must not be pinned alive by its endpoint

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::EndpointConfig;
use crate::connection::connection::{ConnectionRegistry, ConnectionSettings};
use crate::connection::{
    AllowAllPermissions, Connection, ConnectionBuilder, ConnectionDefinition, ManagedConnection,
    PermissionPolicy,
};
use crate::error::{Error, Result};
use crate::identity::{ambient_authentication_context, PeerIdentityContext, SecurityIdentity};
use crate::lifecycle::{CloseListener, CloseState, Closeable};
use crate::transport::Transport;

/// Dials a transport session for a connection definition. Registered on
/// an endpoint under the URI scheme it serves.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, definition: &ConnectionDefinition) -> Result<Box<dyn Transport>>;
}

struct EndpointInner {
    name: String,
    config: EndpointConfig,
    policy: Arc<dyn PermissionPolicy>,
    connectors: DashMap<String, Arc<dyn Connector>>,
    connections: Arc<ConnectionRegistry>,
    close: CloseState,
}

/// A named endpoint owning a set of connections.
///
/// Clones share the same endpoint. Closing it cascades to every owned
/// connection.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    pub fn builder(name: impl Into<String>) -> EndpointBuilder {
        EndpointBuilder {
            name: name.into(),
            config: EndpointConfig::default(),
            policy: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    /// Register the connector serving a URI scheme.
    pub fn register_connector(&self, scheme: impl Into<String>, connector: Arc<dyn Connector>) {
        self.inner.connectors.insert(scheme.into(), connector);
    }

    /// Open a connection as described by the builder. Reads the builder's
    /// snapshot once; later builder mutation does not affect this
    /// connection.
    pub async fn connect(&self, builder: &ConnectionBuilder) -> Result<Connection> {
        let definition = builder.snapshot();
        let peer_context = self.peer_context_for(&definition);
        self.connect_with(&definition, peer_context).await
    }

    /// Open a managed connection: the definition is kept and re-dialed
    /// with backoff when the physical session is lost, preserving the
    /// peer identity context across sessions.
    pub async fn connect_managed(&self, builder: &ConnectionBuilder) -> Result<ManagedConnection> {
        let definition = builder.snapshot();
        let peer_context = self.peer_context_for(&definition);
        let managed = ManagedConnection::new(
            self.clone(),
            definition,
            peer_context,
            self.inner.config.reconnect.clone(),
        );
        // First dial happens eagerly so configuration errors surface here.
        managed.connection().await?;
        Ok(managed)
    }

    pub(crate) async fn connect_with(
        &self,
        definition: &ConnectionDefinition,
        peer_context: Arc<PeerIdentityContext>,
    ) -> Result<Connection> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let scheme = definition.uri.scheme().to_string();
        let connector = self
            .inner
            .connectors
            .get(&scheme)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                Error::InvalidArgument(format!("no connector registered for scheme \"{scheme}\""))
            })?;

        let transport = connector.connect(definition).await?;
        let connection = Connection::new_outbound(
            transport,
            definition.uri.clone(),
            peer_context,
            Arc::clone(&self.inner.policy),
            self.connection_settings(),
            Arc::downgrade(&self.inner.connections),
        );

        if definition.immediate {
            // An authentication failure at connect time is fatal to the
            // connection, unlike one during lazy first use.
            if let Err(e) = connection.authenticate_now().await {
                connection.close().await;
                return Err(e);
            }
        }
        Ok(connection)
    }

    /// Adopt an inbound transport session. The local identity is the
    /// accept-time authentication result.
    pub fn accept(
        &self,
        transport: Box<dyn Transport>,
        local_identity: SecurityIdentity,
    ) -> Result<Connection> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let peer_context = Arc::new(PeerIdentityContext::ambient());
        Ok(Connection::new_inbound(
            transport,
            local_identity,
            peer_context,
            Arc::clone(&self.inner.policy),
            self.connection_settings(),
            Arc::downgrade(&self.inner.connections),
        ))
    }

    /// Connections currently alive on this endpoint.
    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .iter()
            .filter(|entry| entry.value().upgrade().is_some())
            .count()
    }

    fn peer_context_for(&self, definition: &ConnectionDefinition) -> Arc<PeerIdentityContext> {
        let auth = definition
            .authentication_context
            .clone()
            .unwrap_or_else(ambient_authentication_context);
        Arc::new(PeerIdentityContext::new(
            auth,
            definition.sasl_client_factory.clone(),
        ))
    }

    fn connection_settings(&self) -> ConnectionSettings {
        let config = &self.inner.config;
        ConnectionSettings {
            channel_limit: config.channels.max_per_connection,
            open_timeout: config.channels.open_timeout(),
            auth_timeout: config.identity.auth_timeout(),
            anonymous_enabled: config.identity.anonymous_enabled,
        }
    }

    async fn shutdown(inner: Arc<EndpointInner>) {
        if !inner.close.begin() {
            inner.close.closed().await;
            return;
        }
        tracing::info!(endpoint = %inner.name, "closing endpoint");
        let live: Vec<_> = inner
            .connections
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        inner.connections.clear();
        for connection in live {
            connection.shutdown().await;
        }
        inner.close.finish();
    }
}

#[async_trait]
impl Closeable for Endpoint {
    async fn close(&self) {
        Self::shutdown(Arc::clone(&self.inner)).await;
    }

    fn close_async(&self) {
        tokio::spawn(Self::shutdown(Arc::clone(&self.inner)));
    }

    fn on_close(&self, listener: CloseListener) {
        self.inner.close.on_close(listener);
    }

    fn is_closed(&self) -> bool {
        self.inner.close.is_closed()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("connections", &self.connection_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builder for an [`Endpoint`].
pub struct EndpointBuilder {
    name: String,
    config: EndpointConfig,
    policy: Option<Arc<dyn PermissionPolicy>>,
}

impl EndpointBuilder {
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    pub fn permission_policy(mut self, policy: Arc<dyn PermissionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> Endpoint {
        Endpoint {
            inner: Arc::new(EndpointInner {
                name: self.name,
                config: self.config,
                policy: self.policy.unwrap_or_else(|| Arc::new(AllowAllPermissions)),
                connectors: DashMap::new(),
                connections: Arc::new(ConnectionRegistry::new()),
                close: CloseState::new(),
            }),
        }
    }
}
