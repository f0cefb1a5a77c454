//! Name registry: which session currently serves a subdomain or TCP port.
//!
//! Every operation is a single entry-level critical section on a sharded
//! map, so concurrent binds, replaces and removes are linearizable per name.
//! No I/O happens while an entry is locked.

use crate::session::SessionHandle;
use burrow_core::SessionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// How many times a claim retries when the holder changes under it.
const CLAIM_ATTEMPTS: usize = 4;

/// A routable name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Name {
    /// Lower-case subdomain label.
    Subdomain(String),
    /// Public TCP port.
    Port(u16),
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Name::Subdomain(s) => write!(f, "{}", s),
            Name::Port(p) => write!(f, ":{}", p),
        }
    }
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{name} is already bound")]
    Conflict {
        name: Name,
        holder: Arc<SessionHandle>,
    },
    #[error("{0} is not held by the expected session")]
    NotHolder(Name),
    #[error("{0} changed hands too often to claim")]
    Contended(Name),
}

/// Concurrent map from names to the sessions serving them.
#[derive(Default)]
pub struct Registry {
    names: DashMap<Name, Arc<SessionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `session` if it is free.
    ///
    /// A holder that is no longer live (draining or closed but not yet
    /// removed) does not block the bind.
    pub fn bind(&self, name: Name, session: &Arc<SessionHandle>) -> Result<(), RegistryError> {
        match self.names.entry(name) {
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
                Ok(())
            }
            Entry::Occupied(mut entry) => {
                let holder = entry.get();
                if holder.id == session.id {
                    return Ok(());
                }
                if holder.is_live() {
                    return Err(RegistryError::Conflict {
                        name: entry.key().clone(),
                        holder: holder.clone(),
                    });
                }
                debug!(
                    "Binding {} over stale session {}",
                    entry.key(),
                    holder.id.short()
                );
                entry.insert(session.clone());
                Ok(())
            }
        }
    }

    /// Swap the holder of `name` from `old` to `new`, returning the previous
    /// holder. Fails unless `old` is the current holder.
    pub fn replace(
        &self,
        name: &Name,
        old: SessionId,
        new: &Arc<SessionHandle>,
    ) -> Result<Arc<SessionHandle>, RegistryError> {
        match self.names.get_mut(name) {
            Some(mut holder) if holder.id == old => Ok(std::mem::replace(&mut *holder, new.clone())),
            _ => Err(RegistryError::NotHolder(name.clone())),
        }
    }

    /// Current holder of `name`.
    pub fn lookup(&self, name: &Name) -> Option<Arc<SessionHandle>> {
        self.names.get(name).map(|holder| holder.clone())
    }

    /// Remove `name` only if `session` still holds it.
    pub fn remove(&self, name: &Name, session: SessionId) -> bool {
        self.names
            .remove_if(name, |_, holder| holder.id == session)
            .is_some()
    }

    /// Bind `name`, displacing a live holder that has the same identity.
    ///
    /// Returns the displaced session, which the caller must drain.
    pub fn claim(
        &self,
        name: Name,
        session: &Arc<SessionHandle>,
    ) -> Result<Option<Arc<SessionHandle>>, RegistryError> {
        for _ in 0..CLAIM_ATTEMPTS {
            match self.bind(name.clone(), session) {
                Ok(()) => return Ok(None),
                Err(RegistryError::Conflict { holder, .. })
                    if holder.identity == session.identity =>
                {
                    match self.replace(&name, holder.id, session) {
                        Ok(previous) => return Ok(Some(previous)),
                        // Holder changed between bind and replace.
                        Err(_) => continue,
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(RegistryError::Contended(name))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{test_session, TeardownReason};

    fn alice() -> Name {
        Name::Subdomain("alice".to_string())
    }

    #[test]
    fn test_bind_and_lookup() {
        let registry = Registry::new();
        let (s1, _) = test_session(1, "tok-alice", "alice");

        registry.bind(alice(), &s1).unwrap();
        assert_eq!(registry.lookup(&alice()).unwrap().id, s1.id);
        assert!(registry.lookup(&Name::Port(20000)).is_none());

        // Binding twice by the same session is a no-op.
        registry.bind(alice(), &s1).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_bind_conflict_with_live_holder() {
        let registry = Registry::new();
        let (s1, _) = test_session(1, "tok-alice", "alice");
        let (s2, _) = test_session(2, "tok-bob", "alice");

        registry.bind(alice(), &s1).unwrap();
        match registry.bind(alice(), &s2) {
            Err(RegistryError::Conflict { holder, .. }) => assert_eq!(holder.id, s1.id),
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_bind_over_stale_holder() {
        let registry = Registry::new();
        let (s1, _) = test_session(1, "tok-alice", "alice");
        let (s2, _) = test_session(2, "tok-bob", "alice");

        registry.bind(alice(), &s1).unwrap();
        s1.begin_drain(TeardownReason::HeartbeatTimeout);

        registry.bind(alice(), &s2).unwrap();
        assert_eq!(registry.lookup(&alice()).unwrap().id, s2.id);
    }

    #[test]
    fn test_replace_is_compare_and_swap() {
        let registry = Registry::new();
        let (s1, _) = test_session(1, "tok-alice", "alice");
        let (s2, _) = test_session(1, "tok-alice", "alice");
        let (s3, _) = test_session(1, "tok-alice", "alice");

        registry.bind(alice(), &s1).unwrap();
        let previous = registry.replace(&alice(), s1.id, &s2).unwrap();
        assert_eq!(previous.id, s1.id);

        // s1 is no longer the holder, so a stale replace fails.
        assert!(matches!(
            registry.replace(&alice(), s1.id, &s3),
            Err(RegistryError::NotHolder(_))
        ));
        assert_eq!(registry.lookup(&alice()).unwrap().id, s2.id);
    }

    #[test]
    fn test_remove_only_by_holder() {
        let registry = Registry::new();
        let (s1, _) = test_session(1, "tok-alice", "alice");
        let (s2, _) = test_session(1, "tok-alice", "alice");

        registry.bind(alice(), &s1).unwrap();
        registry.replace(&alice(), s1.id, &s2).unwrap();

        // The displaced session's cleanup must not unbind its successor.
        assert!(!registry.remove(&alice(), s1.id));
        assert_eq!(registry.lookup(&alice()).unwrap().id, s2.id);

        assert!(registry.remove(&alice(), s2.id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_claim_displaces_same_identity() {
        let registry = Registry::new();
        let (s1, _) = test_session(1, "tok-alice", "alice");
        let (s2, _) = test_session(1, "tok-alice", "alice");
        let (other, _) = test_session(7, "tok-mallory", "alice");

        assert!(registry.claim(alice(), &s1).unwrap().is_none());
        let displaced = registry.claim(alice(), &s2).unwrap().unwrap();
        assert_eq!(displaced.id, s1.id);

        assert!(matches!(
            registry.claim(alice(), &other),
            Err(RegistryError::Conflict { .. })
        ));
        assert_eq!(registry.lookup(&alice()).unwrap().id, s2.id);
    }

    #[test]
    fn test_concurrent_binds_have_one_winner() {
        let registry = Arc::new(Registry::new());
        let sessions: Vec<_> = (0..16)
            .map(|i| test_session(i, &format!("tok-{}", i), "contested"))
            .collect();

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = sessions
                .iter()
                .map(|(session, _)| {
                    let registry = registry.clone();
                    scope.spawn(move || {
                        registry
                            .bind(Name::Subdomain("contested".to_string()), session)
                            .is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });

        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }
}
