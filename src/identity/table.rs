//! Per-connection identity registry.
//!
//! Maps small integer IDs to resolved identity material, with the reverse
//! index needed to reuse an existing ID for a principal instead of
//! registering it twice. IDs 0 and 1 are seeded at construction and never
//! evicted; IDs ≥ 2 are allocated from a free-list and physically removed
//! only when unreferenced while the connection is closing.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

use super::{IdentityMaterial, Principal};

/// Reserved ID for the connection's own authenticated identity.
pub const CONNECTION_ID: u32 = 0;

/// Reserved ID for the anonymous identity.
pub const ANONYMOUS_ID: u32 = 1;

const FIRST_DYNAMIC_ID: u32 = 2;

struct Entry {
    material: IdentityMaterial,
    /// Live peer-identity handles referencing this ID.
    refs: usize,
}

struct TableInner {
    entries: HashMap<u32, Entry>,
    /// Reverse index: (principal, mechanism) → ID.
    by_key: HashMap<(Principal, String), u32>,
    /// Retired dynamic IDs available for reuse.
    free: Vec<u32>,
    next: u32,
    closing: bool,
}

/// Shared mutable registry of identities in use on one connection.
///
/// Registration is serialized: concurrent resolutions of the same principal
/// converge on one ID. The resolve-or-reuse step is atomic as a unit.
pub struct IdentityTable {
    inner: Mutex<TableInner>,
}

impl IdentityTable {
    /// Build the table with its two reserved entries: the connection
    /// identity (ID 0) and the anonymous identity (ID 1).
    pub fn new(connection_identity: IdentityMaterial) -> Self {
        let mut entries = HashMap::new();
        let mut by_key = HashMap::new();

        by_key.insert(connection_identity.key(), CONNECTION_ID);
        entries.insert(
            CONNECTION_ID,
            Entry {
                material: connection_identity,
                refs: 0,
            },
        );

        let anonymous = IdentityMaterial::anonymous();
        by_key.insert(anonymous.key(), ANONYMOUS_ID);
        entries.insert(
            ANONYMOUS_ID,
            Entry {
                material: anonymous,
                refs: 0,
            },
        );

        Self {
            inner: Mutex::new(TableInner {
                entries,
                by_key,
                free: Vec::new(),
                next: FIRST_DYNAMIC_ID,
                closing: false,
            }),
        }
    }

    /// Resolve the ID for this material, registering it if absent.
    ///
    /// The anonymous principal always resolves to ID 1; material matching
    /// the connection identity resolves to ID 0. References are owned by
    /// peer-identity handles via [`retain`]/[`release`], not by this call.
    ///
    /// [`retain`]: IdentityTable::retain
    /// [`release`]: IdentityTable::release
    pub fn resolve_or_register(&self, material: IdentityMaterial) -> Result<u32> {
        let mut inner = self.lock();
        if inner.closing {
            return Err(Error::ConnectionClosed);
        }

        if material.principal.is_anonymous() {
            return Ok(ANONYMOUS_ID);
        }
        if let Some(&id) = inner.by_key.get(&material.key()) {
            return Ok(id);
        }

        let id = match inner.free.pop() {
            Some(id) => id,
            None => {
                let id = inner.next;
                inner.next += 1;
                id
            }
        };
        inner.by_key.insert(material.key(), id);
        inner.entries.insert(id, Entry { material, refs: 0 });
        crate::observability::metrics::identity_registered();
        Ok(id)
    }

    /// The ID already registered for this principal+mechanism, if any.
    pub fn existing_id(&self, key: &(Principal, String)) -> Option<u32> {
        self.lock().by_key.get(key).copied()
    }

    /// Look up the identity material registered under `id`.
    pub fn lookup(&self, id: u32) -> Option<IdentityMaterial> {
        self.lock().entries.get(&id).map(|e| e.material.clone())
    }

    /// Add a reference to an already-resolved ID (handle duplication).
    /// Reserved IDs are not reference-counted.
    pub fn retain(&self, id: u32) {
        if id < FIRST_DYNAMIC_ID {
            return;
        }
        if let Some(entry) = self.lock().entries.get_mut(&id) {
            entry.refs += 1;
        }
    }

    /// Drop one reference. The entry is physically removed only when the
    /// count reaches zero *and* the connection is closing; until then the
    /// ID stays resolvable so it can be reused within the session.
    pub fn release(&self, id: u32) {
        if id < FIRST_DYNAMIC_ID {
            return;
        }
        let mut inner = self.lock();
        let retire = match inner.entries.get_mut(&id) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0 && inner.closing
            }
            None => false,
        };
        if retire {
            inner.retire(id);
        }
    }

    /// Replace the material stored under a reserved ID once authentication
    /// completes (the connection identity starts as a declared principal).
    pub(crate) fn update_material(&self, id: u32, material: IdentityMaterial) {
        let mut inner = self.lock();
        let old_key = match inner.entries.get(&id) {
            Some(entry) => entry.material.key(),
            None => return,
        };
        inner.by_key.remove(&old_key);
        inner.by_key.insert(material.key(), id);
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.material = material;
        }
    }

    /// Begin teardown: refuse new registrations and retire every dynamic
    /// entry that is no longer referenced. Reserved IDs stay resolvable.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closing = true;
        let unreferenced: Vec<u32> = inner
            .entries
            .iter()
            .filter(|(id, e)| **id >= FIRST_DYNAMIC_ID && e.refs == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in unreferenced {
            inner.retire(id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableInner> {
        self.inner.lock().expect("identity table lock poisoned")
    }
}

impl TableInner {
    fn retire(&mut self, id: u32) {
        if let Some(entry) = self.entries.remove(&id) {
            self.by_key.remove(&entry.material.key());
            self.free.push(id);
        }
    }
}

impl std::fmt::Debug for IdentityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("IdentityTable")
            .field("entries", &inner.entries.len())
            .field("closing", &inner.closing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Credential;
    use std::sync::Arc;

    fn named(name: &str) -> IdentityMaterial {
        IdentityMaterial {
            principal: Principal::Named(name.into()),
            mechanism: "plain".into(),
            credential: Credential::None,
        }
    }

    fn table() -> IdentityTable {
        IdentityTable::new(IdentityMaterial {
            principal: Principal::Named("connection-user".into()),
            mechanism: "transport".into(),
            credential: Credential::None,
        })
    }

    #[test]
    fn reserved_ids_always_resolvable() {
        let table = table();
        assert!(table.lookup(CONNECTION_ID).is_some());
        assert!(table.lookup(ANONYMOUS_ID).is_some());
        table.close();
        assert!(table.lookup(CONNECTION_ID).is_some());
        assert!(table.lookup(ANONYMOUS_ID).is_some());
    }

    #[test]
    fn anonymous_material_resolves_to_reserved_id() {
        let table = table();
        let id = table
            .resolve_or_register(IdentityMaterial::anonymous())
            .unwrap();
        assert_eq!(id, ANONYMOUS_ID);
    }

    #[test]
    fn connection_identity_material_resolves_to_zero() {
        let table = table();
        let id = table
            .resolve_or_register(IdentityMaterial {
                principal: Principal::Named("connection-user".into()),
                mechanism: "transport".into(),
                credential: Credential::None,
            })
            .unwrap();
        assert_eq!(id, CONNECTION_ID);
    }

    #[test]
    fn same_principal_reuses_id() {
        let table = table();
        let a = table.resolve_or_register(named("alice")).unwrap();
        let b = table.resolve_or_register(named("alice")).unwrap();
        assert_eq!(a, b);
        let c = table.resolve_or_register(named("bob")).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn release_before_close_keeps_entry_for_reuse() {
        let table = table();
        let a = table.resolve_or_register(named("alice")).unwrap();
        table.release(a);
        // Still resolvable, and re-registration converges on the same ID.
        assert!(table.lookup(a).is_some());
        assert_eq!(table.resolve_or_register(named("alice")).unwrap(), a);
    }

    #[test]
    fn close_retires_unreferenced_dynamic_ids() {
        let table = table();
        let a = table.resolve_or_register(named("alice")).unwrap();
        let b = table.resolve_or_register(named("bob")).unwrap();
        // A live handle keeps bob referenced; alice has none left.
        table.retain(b);
        table.retain(a);
        table.release(a);

        table.close();
        assert!(table.lookup(a).is_none());
        // Still referenced: survives until released.
        assert!(table.lookup(b).is_some());
        table.release(b);
        assert!(table.lookup(b).is_none());

        assert!(matches!(
            table.resolve_or_register(named("carol")),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn concurrent_registration_converges_on_one_id() {
        let table = Arc::new(table());
        let mut joins = Vec::new();
        for _ in 0..16 {
            let table = Arc::clone(&table);
            joins.push(std::thread::spawn(move || {
                table.resolve_or_register(named("alice")).unwrap()
            }));
        }
        let ids: Vec<u32> = joins.into_iter().map(|j| j.join().unwrap()).collect();
        let first = ids[0];
        assert!(ids.iter().all(|&id| id == first));
        assert!(first >= 2);
    }
}
