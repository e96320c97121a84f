//! Registration state: the Address-of-Record data model and the
//! compare-and-swap store that persists it.

mod backend;
mod codec;

pub use backend::{MemoryStore, SetOutcome, StoreBackend};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::{Error, Result};

const NAMESPACE: &str = "reg";

/// One reachable contact registered under an AoR.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Binding {
    /// Contact URI the endpoint can be reached on.
    pub uri: String,
    /// Call-ID of the REGISTER that created or last refreshed the binding.
    pub call_id: String,
    pub cseq: u32,
    /// Expiry as seconds since the UNIX epoch.
    pub expires: u32,
    pub priority: u32,
    /// Contact header parameters, in arrival order.
    pub params: Vec<(String, String)>,
    /// Path header values recorded from the REGISTER, in arrival order.
    pub path_headers: Vec<String>,
}

/// Registration state for one Address-of-Record: the bindings keyed by
/// binding identifier, plus the CAS token the record was read with. A token
/// of zero means the AoR has never been persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AoR {
    bindings: BTreeMap<String, Binding>,
    cas: u64,
}

impl AoR {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    /// Fetches the binding with this identifier, creating an empty one if it
    /// does not exist yet.
    pub fn get_binding(&mut self, binding_id: &str) -> &mut Binding {
        self.bindings.entry(binding_id.to_string()).or_default()
    }

    /// Removes the binding with this identifier, if any.
    pub fn remove_binding(&mut self, binding_id: &str) {
        self.bindings.remove(binding_id);
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&String, &Binding)> {
        self.bindings.iter()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Store of AoR records in the shared backend. All mutation happens on the
/// worker thread owning the in-flight handle; cross-process coordination is
/// the backend's CAS protocol, so there is no local locking here.
pub struct RegistrationStore {
    backend: Arc<dyn StoreBackend>,
}

impl RegistrationStore {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// Retrieves the registration data for an AoR, fabricating an empty
    /// record (CAS 0) if the backend has none. A record that fails to
    /// decode is audit-logged and treated as absent, keeping the stored CAS
    /// token so the next write replaces the corrupt blob.
    pub fn get_aor(&self, aor_id: &str) -> Result<AoR> {
        debug!(aor = %aor_id, "reading registration record");
        match self.backend.get(NAMESPACE, aor_id)? {
            Some((data, cas)) => match codec::deserialize_aor(&data) {
                Ok(mut aor) => {
                    aor.cas = cas;
                    debug!(aor = %aor_id, cas, bindings = aor.binding_count(), "record found");
                    Ok(aor)
                }
                Err(err) => {
                    warn!(aor = %aor_id, cas, error = %err, "corrupt registration record, treating as empty");
                    Ok(AoR {
                        bindings: BTreeMap::new(),
                        cas,
                    })
                }
            },
            None => {
                debug!(aor = %aor_id, "no record, fabricating empty AoR");
                Ok(AoR::new())
            }
        }
    }

    /// Writes the registration data for an AoR conditionally on its CAS
    /// token. Expired bindings are purged first; the record's TTL is the
    /// latest remaining expiry. Returns `Ok(false)` on contention, in which
    /// case the caller must re-read and retry.
    ///
    /// A record with no remaining bindings is still written, with an
    /// effectively immediate expiry, because the backend does not guarantee
    /// CAS semantics on delete.
    pub fn set_aor(&self, aor_id: &str, aor: &mut AoR) -> Result<bool> {
        self.set_aor_at(aor_id, aor, epoch_now())
    }

    fn set_aor_at(&self, aor_id: &str, aor: &mut AoR, now: u32) -> Result<bool> {
        let max_expires = Self::expire_bindings(aor, now);

        // Serialized expiries are 32-bit signed in the record format;
        // anything past that horizon is refused rather than wrapped.
        if let Some((binding_id, binding)) = aor
            .bindings()
            .find(|(_, binding)| binding.expires > i32::MAX as u32)
        {
            return Err(Error::store(format!(
                "binding {} expiry {} is beyond the representable horizon",
                binding_id, binding.expires
            )));
        }

        let data = codec::serialize_aor(aor)?;
        let ttl = Duration::from_secs(u64::from(max_expires.saturating_sub(now)));
        debug!(aor = %aor_id, cas = aor.cas, expiry = max_expires, "writing registration record");

        match self.backend.set(NAMESPACE, aor_id, &data, aor.cas, ttl)? {
            SetOutcome::Stored => Ok(true),
            SetOutcome::Contention => {
                debug!(aor = %aor_id, cas = aor.cas, "registration write contended");
                Ok(false)
            }
        }
    }

    /// Purges bindings whose expiry has passed and returns the latest
    /// remaining expiry, or `now` if none remain.
    pub fn expire_bindings(aor: &mut AoR, now: u32) -> u32 {
        let mut max_expires = now;
        aor.bindings.retain(|_, binding| {
            if binding.expires <= now {
                return false;
            }
            if binding.expires > max_expires {
                max_expires = binding.expires;
            }
            true
        });
        max_expires
    }
}

pub(crate) fn epoch_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (RegistrationStore, Arc<MemoryStore>) {
        let backend = Arc::new(MemoryStore::new());
        (RegistrationStore::new(backend.clone()), backend)
    }

    fn add_binding(aor: &mut AoR, id: &str, expires: u32) {
        let binding = aor.get_binding(id);
        binding.uri = id.to_string();
        binding.call_id = "cid".to_string();
        binding.cseq = 1;
        binding.expires = expires;
    }

    #[test]
    fn missing_aor_reads_as_empty_with_zero_cas() {
        let (store, _) = store();
        let aor = store.get_aor("sip:alice@example.com").unwrap();
        assert!(aor.is_empty());
        assert_eq!(aor.cas(), 0);
    }

    #[test]
    fn register_and_read_back() {
        let (store, _) = store();
        let now = epoch_now();

        let mut aor = store.get_aor("sip:alice@example.com").unwrap();
        add_binding(&mut aor, "sip:alice@1.2.3.4;transport=tcp", now + 3600);
        assert!(store.set_aor("sip:alice@example.com", &mut aor).unwrap());

        let read_back = store.get_aor("sip:alice@example.com").unwrap();
        assert_eq!(read_back.binding_count(), 1);
        let (_, binding) = read_back.bindings().next().unwrap();
        assert_eq!(binding.expires, now + 3600);
        assert!(read_back.cas() > 0);
    }

    #[test]
    fn expire_bindings_purges_and_reports_latest() {
        let now = 1_700_000_000;
        let mut aor = AoR::new();
        add_binding(&mut aor, "b1", now - 1);
        add_binding(&mut aor, "b2", now + 600);

        let max = RegistrationStore::expire_bindings(&mut aor, now);
        assert_eq!(max, now + 600);
        assert_eq!(aor.binding_count(), 1);
        assert!(aor.bindings.contains_key("b2"));
    }

    #[test]
    fn expire_bindings_is_idempotent() {
        let now = 1_700_000_000;
        let mut aor = AoR::new();
        add_binding(&mut aor, "b1", now - 1);
        add_binding(&mut aor, "b2", now + 600);

        RegistrationStore::expire_bindings(&mut aor, now);
        let snapshot = aor.clone();
        let max = RegistrationStore::expire_bindings(&mut aor, now);
        assert_eq!(max, now + 600);
        assert_eq!(aor, snapshot);
    }

    #[test]
    fn expire_bindings_on_empty_aor_returns_now() {
        let now = 1_700_000_000;
        let mut aor = AoR::new();
        assert_eq!(RegistrationStore::expire_bindings(&mut aor, now), now);
    }

    #[test]
    fn contended_write_returns_false_and_retry_succeeds() {
        let (store, _) = store();
        let now = epoch_now();
        let aor_id = "sip:alice@example.com";

        let mut seed = AoR::new();
        add_binding(&mut seed, "b0", now + 600);
        assert!(store.set_aor(aor_id, &mut seed).unwrap());

        // Two workers read the same version.
        let mut worker_a = store.get_aor(aor_id).unwrap();
        let mut worker_b = store.get_aor(aor_id).unwrap();
        assert_eq!(worker_a.cas(), worker_b.cas());

        add_binding(&mut worker_b, "b-from-b", now + 700);
        assert!(store.set_aor(aor_id, &mut worker_b).unwrap());

        // A's write loses and must re-read.
        add_binding(&mut worker_a, "b-from-a", now + 800);
        assert!(!store.set_aor(aor_id, &mut worker_a).unwrap());

        let mut retry = store.get_aor(aor_id).unwrap();
        add_binding(&mut retry, "b-from-a", now + 800);
        assert!(store.set_aor(aor_id, &mut retry).unwrap());

        let final_state = store.get_aor(aor_id).unwrap();
        assert_eq!(final_state.binding_count(), 3);
    }

    #[test]
    fn cas_tokens_never_decrease() {
        let (store, _) = store();
        let now = epoch_now();
        let aor_id = "sip:alice@example.com";
        let mut last_cas = 0;

        for round in 0..3 {
            let mut aor = store.get_aor(aor_id).unwrap();
            assert!(aor.cas() >= last_cas);
            add_binding(&mut aor, "b", now + 600 + round);
            assert!(store.set_aor(aor_id, &mut aor).unwrap());
            let observed = store.get_aor(aor_id).unwrap().cas();
            assert!(observed > last_cas);
            last_cas = observed;
        }
    }

    #[test]
    fn write_with_no_bindings_is_an_immediate_expiry_write() {
        let (store, backend) = store();
        let now = epoch_now();
        let aor_id = "sip:alice@example.com";

        let mut aor = AoR::new();
        add_binding(&mut aor, "b", now + 600);
        assert!(store.set_aor(aor_id, &mut aor).unwrap());

        let mut emptied = store.get_aor(aor_id).unwrap();
        emptied.get_binding("b").expires = 0;
        assert!(store.set_aor(aor_id, &mut emptied).unwrap());
        assert!(emptied.is_empty());

        // The backend still performed a conditional write, not a delete.
        assert_eq!(backend.get(NAMESPACE, aor_id).unwrap(), None);
    }

    #[test]
    fn expiry_beyond_2038_is_refused() {
        let (store, _) = store();
        let mut aor = AoR::new();
        add_binding(&mut aor, "b", i32::MAX as u32 + 1);
        assert!(matches!(
            store.set_aor("sip:alice@example.com", &mut aor),
            Err(Error::Store(_))
        ));
    }

    #[test]
    fn corrupt_record_is_treated_as_empty_but_keeps_cas() {
        let (store, backend) = store();
        backend
            .set(NAMESPACE, "sip:alice@example.com", b"\xff\xff", 0, Duration::from_secs(60))
            .unwrap();

        let aor = store.get_aor("sip:alice@example.com").unwrap();
        assert!(aor.is_empty());
        assert!(aor.cas() > 0);

        // The kept token lets the next write replace the corrupt blob.
        let mut fresh = aor;
        add_binding(&mut fresh, "b", epoch_now() + 600);
        assert!(store.set_aor("sip:alice@example.com", &mut fresh).unwrap());
    }
}
