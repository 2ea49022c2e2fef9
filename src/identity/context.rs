//! Connection-independent authentication context.
//!
//! # Responsibilities
//! - Run the authentication-context rules to derive identity material for
//!   a peer
//! - Cache reusable proof material across physical connections of the same
//!   logical peer
//! - Re-run per-connection mechanisms on every derivation

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::transport::PeerInfo;

use super::{
    ambient_authentication_context, AuthenticationContext, IdentityMaterial, PlainSaslClientFactory,
    Principal, SaslClientFactory,
};

/// Identity material ready for registration, plus the proof bytes for the
/// authentication round-trip to the peer.
#[derive(Debug, Clone)]
pub struct DerivedIdentity {
    pub material: IdentityMaterial,
    pub response: Vec<u8>,
}

/// Authentication configuration and credential cache that outlives any
/// single physical connection.
///
/// A managed connection keeps one instance across re-establishment, so
/// cacheable credentials are not prompted for again while per-connection
/// mechanisms run fresh each time.
pub struct PeerIdentityContext {
    auth: Arc<dyn AuthenticationContext>,
    sasl_factory: Arc<dyn SaslClientFactory>,
    /// (principal, mechanism) → proof bytes reusable across connections.
    cache: Mutex<HashMap<(Principal, String), Vec<u8>>>,
}

impl PeerIdentityContext {
    pub fn new(
        auth: Arc<dyn AuthenticationContext>,
        sasl_factory: Option<Arc<dyn SaslClientFactory>>,
    ) -> Self {
        Self {
            auth,
            sasl_factory: sasl_factory.unwrap_or_else(|| Arc::new(PlainSaslClientFactory)),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Build from the context ambient in the calling scope.
    pub fn ambient() -> Self {
        Self::new(ambient_authentication_context(), None)
    }

    /// Run the configured rules for `peer` and produce registration
    /// material.
    ///
    /// Cacheable derivations are served from the cache; per-connection
    /// mechanisms (challenge-response) run the SASL client every time.
    pub fn derive_identity(&self, peer: &PeerInfo) -> Result<DerivedIdentity> {
        self.derive_identity_from(self.auth.as_ref(), peer)
    }

    /// Like [`derive_identity`], but selecting through the given rules.
    /// Used when the calling scope carries its own authentication
    /// context; caching and mechanism machinery stay with this context.
    ///
    /// [`derive_identity`]: PeerIdentityContext::derive_identity
    pub fn derive_identity_from(
        &self,
        auth: &dyn AuthenticationContext,
        peer: &PeerInfo,
    ) -> Result<DerivedIdentity> {
        let selection = auth.select(peer)?;
        let material = IdentityMaterial {
            principal: selection.principal.clone(),
            mechanism: selection.mechanism.clone(),
            credential: selection.credential.clone(),
        };

        if selection.principal.is_anonymous() {
            return Ok(DerivedIdentity {
                material: IdentityMaterial::anonymous(),
                response: Vec::new(),
            });
        }

        let key = material.key();
        if selection.cacheable {
            if let Some(response) = self
                .cache
                .lock()
                .expect("credential cache lock poisoned")
                .get(&key)
            {
                return Ok(DerivedIdentity {
                    material,
                    response: response.clone(),
                });
            }
        }

        let mut client = self.sasl_factory.create_client(&selection)?;
        let response = client.initial_response()?;
        if selection.cacheable {
            self.cache
                .lock()
                .expect("credential cache lock poisoned")
                .insert(key, response.clone());
        }
        Ok(DerivedIdentity { material, response })
    }

    /// Drop cached proof material for a principal, forcing the next
    /// derivation to run the mechanism again. Called after the peer
    /// rejects the cached material.
    pub fn forget(&self, principal: &Principal, mechanism: &str) {
        self.cache
            .lock()
            .expect("credential cache lock poisoned")
            .remove(&(principal.clone(), mechanism.to_string()));
    }

    /// Cached entries, for diagnostics.
    pub fn cached_credentials(&self) -> usize {
        self.cache
            .lock()
            .expect("credential cache lock poisoned")
            .len()
    }
}

impl std::fmt::Debug for PeerIdentityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIdentityContext")
            .field("cached_credentials", &self.cached_credentials())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::identity::{Credential, IdentitySelection, SaslClient, StaticAuthenticationContext};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingFactory {
        created: AtomicU32,
    }

    impl SaslClientFactory for CountingFactory {
        fn create_client(&self, selection: &IdentitySelection) -> Result<Box<dyn SaslClient>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            PlainSaslClientFactory.create_client(selection)
        }
    }

    fn context_with(selection: IdentitySelection, factory: Arc<CountingFactory>) -> PeerIdentityContext {
        PeerIdentityContext::new(
            Arc::new(StaticAuthenticationContext::new(selection)),
            Some(factory),
        )
    }

    fn selection(cacheable: bool) -> IdentitySelection {
        IdentitySelection {
            principal: Principal::Named("alice".into()),
            mechanism: "plain".into(),
            credential: Credential::Secret(b"pw".to_vec()),
            cacheable,
        }
    }

    #[test]
    fn cacheable_derivation_runs_mechanism_once() {
        let factory = Arc::new(CountingFactory {
            created: AtomicU32::new(0),
        });
        let ctx = context_with(selection(true), Arc::clone(&factory));
        let peer = PeerInfo::unnamed("memory");

        let first = ctx.derive_identity(&peer).unwrap();
        let second = ctx.derive_identity(&peer).unwrap();
        assert_eq!(first.response, second.response);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn per_connection_mechanism_runs_every_time() {
        let factory = Arc::new(CountingFactory {
            created: AtomicU32::new(0),
        });
        let ctx = context_with(selection(false), Arc::clone(&factory));
        let peer = PeerInfo::unnamed("memory");

        ctx.derive_identity(&peer).unwrap();
        ctx.derive_identity(&peer).unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn forget_forces_rederivation() {
        let factory = Arc::new(CountingFactory {
            created: AtomicU32::new(0),
        });
        let ctx = context_with(selection(true), Arc::clone(&factory));
        let peer = PeerInfo::unnamed("memory");

        ctx.derive_identity(&peer).unwrap();
        ctx.forget(&Principal::Named("alice".into()), "plain");
        ctx.derive_identity(&peer).unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn selection_failure_propagates() {
        struct Failing;
        impl AuthenticationContext for Failing {
            fn select(&self, _peer: &PeerInfo) -> Result<IdentitySelection> {
                Err(Error::Authentication("no rule matched".into()))
            }
        }
        let ctx = PeerIdentityContext::new(Arc::new(Failing), None);
        assert!(matches!(
            ctx.derive_identity(&PeerInfo::unnamed("memory")),
            Err(Error::Authentication(_))
        ));
    }
}
