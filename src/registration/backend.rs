use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::Result;

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Stored,
    /// The record changed since it was read; the caller must re-read and
    /// retry with the fresh CAS token.
    Contention,
}

/// Shared key-value store holding serialized registration records.
///
/// `get` returns the record bytes together with the CAS token to present on
/// the next write. `set` succeeds only if the presented token still matches
/// the stored one (token 0 asserts the key does not exist yet). Records are
/// never deleted, only written with a TTL; the store reclaims them itself.
pub trait StoreBackend: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<(Vec<u8>, u64)>>;

    fn set(
        &self,
        namespace: &str,
        key: &str,
        data: &[u8],
        cas: u64,
        ttl: Duration,
    ) -> Result<SetOutcome>;
}

/// In-process backend with real CAS and TTL semantics. Used by tests and by
/// single-node deployments that do not share registration state.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), StoredEntry>>,
}

struct StoredEntry {
    data: Vec<u8>,
    cas: u64,
    expires_at: Instant,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), StoredEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StoreBackend for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let mut entries = self.lock();
        let map_key = (namespace.to_string(), key.to_string());
        let now = Instant::now();

        let expired = entries
            .get(&map_key)
            .is_some_and(|entry| entry.expires_at <= now);
        if expired {
            entries.remove(&map_key);
            return Ok(None);
        }

        Ok(entries
            .get(&map_key)
            .map(|entry| (entry.data.clone(), entry.cas)))
    }

    fn set(
        &self,
        namespace: &str,
        key: &str,
        data: &[u8],
        cas: u64,
        ttl: Duration,
    ) -> Result<SetOutcome> {
        let mut entries = self.lock();
        let map_key = (namespace.to_string(), key.to_string());
        let now = Instant::now();

        let expired = entries
            .get(&map_key)
            .is_some_and(|entry| entry.expires_at <= now);
        if expired {
            entries.remove(&map_key);
        }

        let next_cas = match entries.get(&map_key) {
            None if cas == 0 => 1,
            None => return Ok(SetOutcome::Contention),
            Some(entry) if entry.cas == cas => entry.cas + 1,
            Some(_) => return Ok(SetOutcome::Contention),
        };

        entries.insert(
            map_key,
            StoredEntry {
                data: data.to_vec(),
                cas: next_cas,
                expires_at: now + ttl,
            },
        );
        Ok(SetOutcome::Stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn missing_key_reads_as_none() {
        let store = MemoryStore::new();
        assert_eq!(store.get("reg", "sip:alice@example.com").unwrap(), None);
    }

    #[test]
    fn cas_tokens_increase_on_every_store() {
        let store = MemoryStore::new();
        assert_eq!(
            store.set("reg", "k", b"one", 0, TTL).unwrap(),
            SetOutcome::Stored
        );
        let (data, cas1) = store.get("reg", "k").unwrap().unwrap();
        assert_eq!(data, b"one");

        assert_eq!(
            store.set("reg", "k", b"two", cas1, TTL).unwrap(),
            SetOutcome::Stored
        );
        let (_, cas2) = store.get("reg", "k").unwrap().unwrap();
        assert!(cas2 > cas1);
    }

    #[test]
    fn stale_cas_is_contention() {
        let store = MemoryStore::new();
        store.set("reg", "k", b"one", 0, TTL).unwrap();
        let (_, cas) = store.get("reg", "k").unwrap().unwrap();
        store.set("reg", "k", b"two", cas, TTL).unwrap();

        assert_eq!(
            store.set("reg", "k", b"three", cas, TTL).unwrap(),
            SetOutcome::Contention
        );
    }

    #[test]
    fn zero_cas_on_existing_key_is_contention() {
        let store = MemoryStore::new();
        store.set("reg", "k", b"one", 0, TTL).unwrap();
        assert_eq!(
            store.set("reg", "k", b"two", 0, TTL).unwrap(),
            SetOutcome::Contention
        );
    }

    #[test]
    fn entries_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set("reg", "k", b"one", 0, Duration::from_millis(10))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.get("reg", "k").unwrap(), None);
        // The key can be recreated with a zero token.
        assert_eq!(
            store.set("reg", "k", b"two", 0, TTL).unwrap(),
            SetOutcome::Stored
        );
    }

    #[test]
    fn namespaces_are_disjoint() {
        let store = MemoryStore::new();
        store.set("reg", "k", b"reg", 0, TTL).unwrap();
        assert_eq!(store.get("other", "k").unwrap(), None);
    }
}
