//! Connection core: one multiplexed transport session.
//!
//! # Responsibilities
//! - Carry addresses, protocol and direction-specific state
//! - Open channels asynchronously against the multiplexer quota
//! - Resolve per-call identities through the identity table
//! - Cascade close: no pending future survives a closed connection

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{oneshot, OnceCell, Semaphore};
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::context::DerivedIdentity;
use crate::identity::peer::current_binding_for;
use crate::identity::{
    ConnectionPeerIdentity, IdentityMaterial, IdentityTable, PeerIdentityContext, Principal,
    SecurityIdentity, ANONYMOUS_ID, CONNECTION_ID,
};
use crate::lifecycle::{CloseListener, CloseState, Closeable, Handle};
use crate::observability::metrics;
use crate::transport::{
    AuthOutcome, AuthRequest, ChannelId, ChannelOptions, OpenReply, OpenRequest, PeerInfo, TlsInfo,
    Transport,
};

use super::channel::{Channel, ChannelFuture};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection instance. A re-established managed
/// connection gets a fresh one, which is what invalidates identity
/// bindings scoped to the old instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Direction-specific state. Exactly one variant holds: outbound
/// connections carry the peer URI and no local identity, inbound
/// connections the reverse.
pub(crate) enum Direction {
    Outbound { peer_uri: Url },
    Inbound { local_identity: SecurityIdentity },
}

/// Limits and deadlines a connection operates under, taken from the
/// endpoint configuration at construction.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub channel_limit: usize,
    pub open_timeout: Duration,
    pub auth_timeout: Duration,
    pub anonymous_enabled: bool,
}

/// Permission checkpoint consulted before handing out the connection
/// peer identity. The permission system itself lives outside this crate.
pub trait PermissionPolicy: Send + Sync {
    fn check_connection_peer_identity(&self) -> Result<()>;
}

/// Default policy: every caller holds every capability.
pub struct AllowAllPermissions;

impl PermissionPolicy for AllowAllPermissions {
    fn check_connection_peer_identity(&self) -> Result<()> {
        Ok(())
    }
}

pub(crate) type ConnectionRegistry = DashMap<ConnectionId, Weak<ConnectionInner>>;

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    direction: Direction,
    protocol: String,
    peer_info: PeerInfo,
    transport: Arc<dyn Transport>,
    identity_table: IdentityTable,
    peer_context: Arc<PeerIdentityContext>,
    permission_policy: Arc<dyn PermissionPolicy>,
    settings: ConnectionSettings,
    channel_permits: Arc<Semaphore>,
    channels: DashMap<ChannelId, Channel>,
    /// Gates the single authentication attempt for identity 0.
    connection_auth: OnceCell<()>,
    /// Per-principal single-flight locks for additional-identity auth.
    auth_flights: Mutex<HashMap<(Principal, String), Arc<tokio::sync::Mutex<()>>>>,
    /// In-flight open tasks; close() drains them so every pending
    /// ChannelFuture has resolved by the time it returns.
    open_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Endpoint's live-connection registry, for deregistration on close.
    registry: Weak<ConnectionRegistry>,
    close: CloseState,
}

impl ConnectionInner {
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn identity_table(&self) -> &IdentityTable {
        &self.identity_table
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.close.is_closed()
    }

    pub(crate) fn forget_channel(&self, id: ChannelId) {
        self.channels.remove(&id);
    }

    fn check_open(&self) -> Result<()> {
        if self.close.is_closed() {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Authenticate the connection identity at most once. Inbound
    /// connections were authenticated at accept time; outbound ones run
    /// the peer-identity-context rules on first use.
    async fn ensure_connection_identity(self: &Arc<Self>) -> Result<()> {
        self.connection_auth
            .get_or_try_init(|| async {
                if matches!(self.direction, Direction::Inbound { .. }) {
                    return Ok(());
                }
                let derived = self.peer_context.derive_identity(&self.peer_info)?;
                if derived.material.principal.is_anonymous() {
                    return Ok(());
                }
                self.authenticate_remote(&derived).await?;
                self.identity_table
                    .update_material(CONNECTION_ID, derived.material);
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn authenticate_remote(&self, derived: &DerivedIdentity) -> Result<()> {
        let request = AuthRequest {
            mechanism: derived.material.mechanism.clone(),
            principal: derived.material.principal.clone(),
            response: derived.response.clone(),
        };
        tracing::debug!(
            connection = %self.id,
            principal = %request.principal,
            mechanism = %request.mechanism,
            "authenticating identity to peer"
        );
        let outcome = tokio::time::timeout(
            self.settings.auth_timeout,
            self.transport.authenticate(request),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "authenticate",
            timeout: self.settings.auth_timeout,
        })??;

        match outcome {
            AuthOutcome::Accepted => Ok(()),
            AuthOutcome::Rejected(reason) => {
                self.peer_context
                    .forget(&derived.material.principal, &derived.material.mechanism);
                metrics::auth_rejected();
                Err(Error::Authentication(reason))
            }
        }
    }

    /// Resolve the ambient-context identity on this connection,
    /// authenticating and registering it if it was never used here.
    /// Serialized per principal so concurrent first resolutions converge
    /// on one ID with one authentication attempt.
    async fn register_ambient_identity(self: &Arc<Self>) -> Result<u32> {
        // A task-scoped context wins; otherwise the connection's own
        // authentication configuration applies.
        let derived = match crate::identity::scoped_authentication_context() {
            Some(auth) => self
                .peer_context
                .derive_identity_from(auth.as_ref(), &self.peer_info)?,
            None => self.peer_context.derive_identity(&self.peer_info)?,
        };
        if derived.material.principal.is_anonymous() {
            if !self.settings.anonymous_enabled {
                return Err(Error::AnonymousDisabled);
            }
            return Ok(ANONYMOUS_ID);
        }

        let key = derived.material.key();
        let flight = {
            let mut flights = self.auth_flights.lock().expect("auth flight lock poisoned");
            Arc::clone(
                flights
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _guard = flight.lock().await;

        self.check_open()?;
        if let Some(id) = self.identity_table.existing_id(&key) {
            return Ok(id);
        }

        if !self.transport.supports_remote_auth() {
            return Err(Error::Authentication(
                "peer does not support additional-identity authentication".into(),
            ));
        }
        self.authenticate_remote(&derived).await?;
        self.identity_table.resolve_or_register(derived.material)
    }

    /// The real release routine, run exactly once.
    pub(crate) async fn shutdown(self: Arc<Self>) {
        if !self.close.begin() {
            self.close.closed().await;
            return;
        }
        tracing::info!(connection = %self.id, "closing connection");

        // Transport first: every pending channel open resolves.
        self.transport.close().await;
        let open_tasks: Vec<_> = {
            let mut tasks = self.open_tasks.lock().expect("open task lock poisoned");
            tasks.drain(..).collect()
        };
        for task in open_tasks {
            let _ = task.await;
        }

        let channels: Vec<Channel> = self.channels.iter().map(|e| e.value().clone()).collect();
        self.channels.clear();
        for channel in channels {
            channel.close_for_connection().await;
        }

        self.identity_table.close();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
        metrics::connection_closed();
        self.close.finish();
    }

    async fn drive_open(
        self: Arc<Self>,
        token: Uuid,
        service: String,
        options: ChannelOptions,
        permit: tokio::sync::OwnedSemaphorePermit,
        tx: oneshot::Sender<Result<Channel>>,
    ) {
        let request = OpenRequest {
            token,
            service: service.clone(),
            options: options.clone(),
        };
        let reply = tokio::time::timeout(
            self.settings.open_timeout,
            self.transport.open_channel(request),
        )
        .await;

        let result = match reply {
            Err(_) => {
                // Deadline passed: abandon the request so no slot leaks
                // on the peer side.
                self.transport.cancel_open(token).await;
                Err(Error::Timeout {
                    operation: "open_channel",
                    timeout: self.settings.open_timeout,
                })
            }
            Ok(Err(e)) => {
                if self.close.is_closed() {
                    Err(Error::ConnectionClosed)
                } else {
                    Err(e)
                }
            }
            Ok(Ok(OpenReply::ServiceNotFound)) => Err(Error::ServiceNotFound { service }),
            Ok(Ok(OpenReply::Cancelled)) => Err(Error::Cancelled),
            Ok(Ok(OpenReply::Accepted(id))) => {
                let channel =
                    Channel::new(id, service, options, Arc::downgrade(&self), permit);
                self.channels.insert(id, channel.clone());
                metrics::channel_opened();
                if self.close.is_closed() {
                    // Close raced the acceptance: deliver the terminal
                    // failure and retire the channel cleanly.
                    self.channels.remove(&id);
                    channel.close_for_connection().await;
                    Err(Error::ConnectionClosed)
                } else {
                    tracing::debug!(connection = %self.id, channel = %id, "channel open");
                    Ok(channel)
                }
            }
        };

        if let Err(unreceived) = tx.send(result) {
            // The future was dropped after the peer accepted; close the
            // delivered channel instead of leaking it.
            if let Ok(channel) = unreceived {
                channel.close_async();
            }
        }
    }
}

/// A connection to a remote peer.
///
/// Each `Connection` value is one countable handle on the underlying
/// session: [`duplicate`] shares the session, and the session is released
/// when the last handle closes. Close listeners registered through
/// [`Closeable::on_close`] fire when the *session* closes, whichever
/// handle or cascade caused it.
///
/// [`duplicate`]: Connection::duplicate
pub struct Connection {
    inner: Arc<ConnectionInner>,
    handle: Handle,
}

impl Connection {
    pub(crate) fn new_outbound(
        transport: Box<dyn Transport>,
        peer_uri: Url,
        peer_context: Arc<PeerIdentityContext>,
        permission_policy: Arc<dyn PermissionPolicy>,
        settings: ConnectionSettings,
        registry: Weak<ConnectionRegistry>,
    ) -> Self {
        Self::build(
            transport,
            Direction::Outbound { peer_uri },
            peer_context,
            permission_policy,
            settings,
            registry,
        )
    }

    pub(crate) fn new_inbound(
        transport: Box<dyn Transport>,
        local_identity: SecurityIdentity,
        peer_context: Arc<PeerIdentityContext>,
        permission_policy: Arc<dyn PermissionPolicy>,
        settings: ConnectionSettings,
        registry: Weak<ConnectionRegistry>,
    ) -> Self {
        Self::build(
            transport,
            Direction::Inbound { local_identity },
            peer_context,
            permission_policy,
            settings,
            registry,
        )
    }

    fn build(
        transport: Box<dyn Transport>,
        direction: Direction,
        peer_context: Arc<PeerIdentityContext>,
        permission_policy: Arc<dyn PermissionPolicy>,
        settings: ConnectionSettings,
        registry: Weak<ConnectionRegistry>,
    ) -> Self {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let id = ConnectionId::next();
        let peer_info = PeerInfo {
            uri: match &direction {
                Direction::Outbound { peer_uri } => Some(peer_uri.clone()),
                Direction::Inbound { .. } => None,
            },
            name: transport.remote_endpoint_name(),
            protocol: transport.protocol(),
        };
        let connection_identity = IdentityMaterial {
            principal: transport.local_principal(),
            mechanism: "transport".into(),
            credential: crate::identity::Credential::None,
        };

        let inner = Arc::new(ConnectionInner {
            id,
            protocol: peer_info.protocol.clone(),
            peer_info,
            direction,
            identity_table: IdentityTable::new(connection_identity),
            peer_context,
            permission_policy,
            channel_permits: Arc::new(Semaphore::new(settings.channel_limit)),
            channels: DashMap::new(),
            connection_auth: OnceCell::new(),
            auth_flights: Mutex::new(HashMap::new()),
            open_tasks: Mutex::new(Vec::new()),
            registry,
            settings,
            transport,
            close: CloseState::new(),
        });

        if let Some(registry) = inner.registry.upgrade() {
            registry.insert(id, Arc::downgrade(&inner));
        }
        metrics::connection_opened();
        tracing::info!(connection = %id, protocol = %inner.protocol, "connection established");

        let release_inner = Arc::clone(&inner);
        Self {
            handle: Handle::new(move || release_inner.shutdown()),
            inner,
        }
    }

    /// Duplicate this handle. The session stays open until every handle
    /// is closed.
    pub fn duplicate(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            handle: self.handle.duplicate(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.peer_addr()
    }

    /// Negotiated protocol name. Never absent.
    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    /// Target URI; absent for accepted (inbound) connections.
    pub fn peer_uri(&self) -> Option<&Url> {
        match &self.inner.direction {
            Direction::Outbound { peer_uri } => Some(peer_uri),
            Direction::Inbound { .. } => None,
        }
    }

    pub fn tls_info(&self) -> Option<TlsInfo> {
        self.inner.transport.tls_info()
    }

    /// Remote endpoint name; absent means the peer is anonymous.
    pub fn remote_endpoint_name(&self) -> Option<String> {
        self.inner.transport.remote_endpoint_name()
    }

    /// The local principal authenticated to the peer. May be anonymous.
    pub fn principal(&self) -> Principal {
        self.inner.transport.local_principal()
    }

    /// Whether the peer accepts additional-identity authentication.
    pub fn supports_remote_auth(&self) -> bool {
        self.inner.transport.supports_remote_auth()
    }

    /// The local identity of this inbound connection; absent when
    /// outbound.
    pub fn local_identity(&self) -> Option<SecurityIdentity> {
        match &self.inner.direction {
            Direction::Inbound { local_identity } => Some(local_identity.clone()),
            Direction::Outbound { .. } => None,
        }
    }

    /// The local identity registered under `id`, for inbound connections.
    pub fn local_identity_for(&self, id: u32) -> Option<SecurityIdentity> {
        match &self.inner.direction {
            Direction::Inbound { .. } => self
                .inner
                .identity_table
                .lookup(id)
                .map(|m| m.to_security_identity()),
            Direction::Outbound { .. } => None,
        }
    }

    /// The peer identity context. Outlives this connection when the
    /// connection is managed.
    pub fn peer_identity_context(&self) -> Arc<PeerIdentityContext> {
        Arc::clone(&self.inner.peer_context)
    }

    /// Open a channel to the named service on the peer.
    ///
    /// Never blocks; suspension happens only at the returned future. The
    /// future fails with `ServiceNotFound`, `ChannelLimitExceeded`,
    /// `ConnectionClosed` or `Cancelled`; the connection stays usable
    /// after channel-open failures.
    pub fn open_channel(&self, service: &str, options: ChannelOptions) -> ChannelFuture {
        if let Err(e) = self.check_open() {
            return ChannelFuture::failed(e);
        }
        if service.is_empty() {
            return ChannelFuture::failed(Error::InvalidArgument(
                "service name must not be empty".into(),
            ));
        }

        // Quota check must not wait: a full multiplexer is an error, not
        // backpressure.
        let permit = match Arc::clone(&self.inner.channel_permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                return ChannelFuture::failed(Error::ChannelLimitExceeded {
                    limit: self.inner.settings.channel_limit,
                })
            }
        };

        let token = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let future = ChannelFuture::pending(rx, token, Arc::clone(&self.inner.transport));
        let task = tokio::spawn(Arc::clone(&self.inner).drive_open(
            token,
            service.to_string(),
            options,
            permit,
            tx,
        ));
        let mut tasks = self
            .inner
            .open_tasks
            .lock()
            .expect("open task lock poisoned");
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        future
    }

    /// The peer identity corresponding to the connection's own
    /// authentication result (ID 0).
    pub async fn connection_peer_identity(&self) -> Result<ConnectionPeerIdentity> {
        self.check_open()?;
        self.inner.permission_policy.check_connection_peer_identity()?;
        self.inner.ensure_connection_identity().await?;
        Ok(ConnectionPeerIdentity::new(
            Arc::clone(&self.inner),
            CONNECTION_ID,
        ))
    }

    /// The reserved anonymous identity (ID 1). Never fails
    /// authentication; fails only when anonymous access is disabled.
    pub fn connection_anonymous_identity(&self) -> Result<ConnectionPeerIdentity> {
        self.check_open()?;
        if !self.inner.settings.anonymous_enabled {
            return Err(Error::AnonymousDisabled);
        }
        Ok(ConnectionPeerIdentity::new(
            Arc::clone(&self.inner),
            ANONYMOUS_ID,
        ))
    }

    /// The ID of the identity bound to the calling execution context, or
    /// of the ambient-context identity, authenticating on demand if it
    /// was never registered on this connection.
    pub async fn peer_identity_id(&self) -> Result<u32> {
        self.check_open()?;
        if let Some(id) = current_binding_for(self.inner.id) {
            return Ok(id);
        }
        self.inner.register_ambient_identity().await
    }

    /// Authenticate the ambient-context identity and return a handle
    /// asserting it. The first request per principal performs the
    /// authentication; later requests reuse the registered ID.
    pub async fn authenticate_peer_identity(&self) -> Result<ConnectionPeerIdentity> {
        self.check_open()?;
        let id = self.inner.register_ambient_identity().await?;
        Ok(ConnectionPeerIdentity::new(Arc::clone(&self.inner), id))
    }

    /// Run the connection-identity authentication immediately. Used by
    /// immediate-mode connects, where a failure is fatal.
    pub(crate) async fn authenticate_now(&self) -> Result<()> {
        self.inner.ensure_connection_identity().await
    }

    /// Open channels on this connection right now.
    pub fn open_channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// Wait until the session's close completed, listeners included.
    pub async fn closed(&self) {
        self.inner.close.closed().await;
    }

    fn check_open(&self) -> Result<()> {
        if self.handle.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.inner.check_open()
    }
}

#[async_trait]
impl Closeable for Connection {
    async fn close(&self) {
        self.handle.close().await;
    }

    fn close_async(&self) {
        self.handle.close_async();
    }

    fn on_close(&self, listener: CloseListener) {
        self.inner.close.on_close(listener);
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed() || self.inner.close.is_closed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("protocol", &self.inner.protocol)
            .field("closed", &self.is_closed())
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}
