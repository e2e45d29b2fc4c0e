use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use crate::authentication::Credential;
use crate::flow::ConnectionId;


/// The per-connection record of the last accepted credential.
///
/// Every entry is tagged with the generation of the configuration it was validated
/// against. Entries of other generations are treated as absent, so a reconfiguration
/// invalidates the whole cache at once even before [`AuthCache::clear`] reclaims them.
#[derive(Default)]
pub struct AuthCache {
    entries: DashMap<ConnectionId, CachedCredential>,
}

#[derive(Clone)]
struct CachedCredential {
    credential: Credential,
    generation: u64,
}

impl AuthCache {
    pub fn new() -> Self {
        Default::default()
    }

    /// Get the credential accepted on the connection under the configuration `generation`
    pub fn get(&self, conn: ConnectionId, generation: u64) -> Option<Credential> {
        self.entries.get(&conn)
            .filter(|e| e.generation == generation)
            .map(|e| e.credential.clone())
    }

    /// Record the credential unless the connection already has one of the same or a newer
    /// generation. Returns the credential which stays in the cache.
    pub fn insert(&self, conn: ConnectionId, generation: u64, credential: Credential) -> Credential {
        match self.entries.entry(conn) {
            Entry::Occupied(mut e) => {
                if generation > e.get().generation {
                    e.insert(CachedCredential { credential, generation });
                }
                e.get().credential.clone()
            }
            Entry::Vacant(e) => {
                e.insert(CachedCredential { credential: credential.clone(), generation });
                credential
            }
        }
    }

    /// Forget the connection, e.g. once it is closed
    pub fn remove(&self, conn: ConnectionId) -> bool {
        self.entries.remove(&conn).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;

    #[test]
    fn first_insert_wins() {
        let cache = AuthCache::new();
        let conn = ConnectionId::new(1);
        assert_eq!(Credential::new("a", "1"), cache.insert(conn, 0, Credential::new("a", "1")));
        assert_eq!(Credential::new("a", "1"), cache.insert(conn, 0, Credential::new("b", "2")));
        assert_eq!(Some(Credential::new("a", "1")), cache.get(conn, 0));
    }

    #[test]
    fn other_generation_is_a_miss() {
        let cache = AuthCache::new();
        let conn = ConnectionId::new(1);
        cache.insert(conn, 0, Credential::new("a", "1"));
        assert_eq!(None, cache.get(conn, 1));

        assert_eq!(Credential::new("b", "2"), cache.insert(conn, 1, Credential::new("b", "2")));
        assert_eq!(Some(Credential::new("b", "2")), cache.get(conn, 1));
        assert_eq!(None, cache.get(conn, 0));
    }

    #[test]
    fn late_insert_keeps_newer_generation() {
        let cache = AuthCache::new();
        let conn = ConnectionId::new(1);
        cache.insert(conn, 2, Credential::new("new", "2"));

        assert_eq!(Credential::new("new", "2"), cache.insert(conn, 1, Credential::new("stale", "1")));
        assert_eq!(Some(Credential::new("new", "2")), cache.get(conn, 2));
        assert_eq!(None, cache.get(conn, 1));
    }

    #[test]
    fn connections_are_independent() {
        let cache = AuthCache::new();
        cache.insert(ConnectionId::new(1), 0, Credential::new("a", "1"));
        assert_eq!(None, cache.get(ConnectionId::new(2), 0));

        assert!(cache.remove(ConnectionId::new(1)));
        assert!(!cache.remove(ConnectionId::new(1)));
        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_inserts_keep_one_entry_per_connection() {
        let cache = Arc::new(AuthCache::new());
        let handles: Vec<_> = (0..8_u64)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for conn in 0..100 {
                        cache.insert(ConnectionId::new(conn), 0, Credential::new(format!("user{}", i), "x"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(100, cache.len());
        let winner = cache.get(ConnectionId::new(0), 0).unwrap();
        assert_eq!(winner, cache.insert(ConnectionId::new(0), 0, Credential::new("late", "x")));
    }
}
