//! A single peer-to-peer key store: the hot cache and consumption queue for
//! PSKs shared with one other site (spec §4.3). Grounded in
//! `KeyManagement/KeyStores/KeyStoreFactory.h`'s `keyStoreCacheLimit`
//! (default 100000) and the `GetNewKey`/`MarkKeyInUse` split it implies
//! between "not yet claimed" and "claimed by a caller" keys.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use qkd_backing_store::{BackingStore, BackingStoreError};
use qkd_types::{KeyId, Psk, SiteId};

use crate::error::KeyStoreError;

pub const DEFAULT_CACHE_LIMIT: u64 = 100_000;

/// Notified when a new key becomes available for a site, so an application
/// consumer doesn't have to poll. Only the id is announced — bytes are
/// fetched explicitly via [`KeyStore::get_new_key`] or
/// [`KeyStore::get_shared_key`], so a sink never has to be trusted with key
/// material just to be told something arrived.
pub trait KeyPublisherSink: Send + Sync {
    fn publish_key(&self, site: &SiteId, key_id: KeyId);
}

struct KeyStoreInner {
    cache: BTreeMap<KeyId, Psk>,
    cache_order: VecDeque<KeyId>,
    available: VecDeque<KeyId>,
    in_use: HashSet<KeyId>,
}

pub struct KeyStore {
    site: SiteId,
    backing: Arc<dyn BackingStore>,
    cache_limit: u64,
    inner: Mutex<KeyStoreInner>,
    publishers: Mutex<Vec<Arc<dyn KeyPublisherSink>>>,
}

impl KeyStore {
    pub fn new(site: SiteId, backing: Arc<dyn BackingStore>) -> Self {
        Self::with_cache_limit(site, backing, DEFAULT_CACHE_LIMIT)
    }

    pub fn with_cache_limit(site: SiteId, backing: Arc<dyn BackingStore>, cache_limit: u64) -> Self {
        Self {
            site,
            backing,
            cache_limit,
            inner: Mutex::new(KeyStoreInner {
                cache: BTreeMap::new(),
                cache_order: VecDeque::new(),
                available: VecDeque::new(),
                in_use: HashSet::new(),
            }),
            publishers: Mutex::new(Vec::new()),
        }
    }

    pub fn site(&self) -> &SiteId {
        &self.site
    }

    pub fn add_publisher(&self, sink: Arc<dyn KeyPublisherSink>) {
        self.publishers.lock().unwrap().push(sink);
    }

    /// Persists a newly-negotiated key and makes it available for claim.
    pub fn add_key(&self, key_id: KeyId, psk: Psk) -> Result<(), KeyStoreError> {
        let mut batch = vec![(key_id, psk.clone())];
        self.backing.store_keys(&self.site, &mut batch)?;
        if !batch.is_empty() {
            return Err(KeyStoreError::BackingStore(BackingStoreError::Conflict(
                key_id.to_string(),
            )));
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.cache.insert(key_id, psk);
            inner.cache_order.push_back(key_id);
            while inner.cache_order.len() as u64 > self.cache_limit {
                if let Some(oldest) = inner.cache_order.pop_front() {
                    inner.cache.remove(&oldest);
                }
            }
            inner.available.push_back(key_id);
        }

        for publisher in self.publishers.lock().unwrap().iter() {
            publisher.publish_key(&self.site, key_id);
        }
        Ok(())
    }

    /// Claims and consumes the lowest-numbered available key (spec §4.3
    /// `GetNewKey`): atomically reserved and removed from the backing store
    /// in the same critical section that updates the hot cache, so cache
    /// and backing store never disagree about which ids are still live, and
    /// a `Consumed` record is physically gone rather than merely marked.
    pub fn get_new_key(&self) -> Result<(KeyId, Psk), KeyStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key_id = self.backing.reserve_key(&self.site)?;
        let psk = match inner.cache.get(&key_id).cloned() {
            Some(psk) => psk,
            None => self.backing.get_key(&self.site, key_id)?,
        };
        self.backing.remove_key(&self.site, key_id)?;
        inner.cache.remove(&key_id);
        inner.cache_order.retain(|id| *id != key_id);
        inner.available.retain(|id| *id != key_id);
        inner.in_use.remove(&key_id);
        Ok((key_id, psk))
    }

    /// Claims the next locally-cached key without consuming it in the
    /// backing store — the soft reservation the multi-hop protocol uses
    /// (spec §4.3.1) so a failed chain can release hops already claimed.
    /// Returns `None` immediately if no key is currently available.
    pub fn claim_available_key(&self) -> Option<(KeyId, Psk)> {
        let mut inner = self.inner.lock().unwrap();
        let key_id = inner.available.pop_front()?;
        inner.in_use.insert(key_id);
        let psk = inner.cache.get(&key_id).cloned()?;
        Some((key_id, psk))
    }

    pub fn mark_key_in_use(&self, key_id: KeyId) -> Result<(), KeyStoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_use.contains(&key_id) {
            return Err(KeyStoreError::AlreadyInUse(key_id.to_string()));
        }
        inner.available.retain(|id| *id != key_id);
        inner.in_use.insert(key_id);
        Ok(())
    }

    /// Returns a key's bytes regardless of claim state, loading from the
    /// backing store on a cache miss.
    pub fn get_shared_key(&self, key_id: KeyId) -> Result<Psk, KeyStoreError> {
        {
            let inner = self.inner.lock().unwrap();
            if let Some(psk) = inner.cache.get(&key_id) {
                return Ok(psk.clone());
            }
        }
        let psk = self
            .backing
            .get_key(&self.site, key_id)
            .map_err(|_| KeyStoreError::NotFound(key_id.to_string()))?;
        let mut inner = self.inner.lock().unwrap();
        inner.cache.insert(key_id, psk.clone());
        inner.cache_order.push_back(key_id);
        while inner.cache_order.len() as u64 > self.cache_limit {
            if let Some(oldest) = inner.cache_order.pop_front() {
                inner.cache.remove(&oldest);
            }
        }
        Ok(psk)
    }

    /// Rolls a soft claim made by [`claim_available_key`](Self::claim_available_key)
    /// back: the key returns to the front of the available queue so the
    /// next caller gets it before any newer key. Has no effect on a key
    /// already consumed via [`get_new_key`](Self::get_new_key) — that
    /// record no longer exists to roll back to.
    pub fn release_key(&self, key_id: KeyId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_use.remove(&key_id) {
            inner.available.push_front(key_id);
        }
    }

    pub fn available_count(&self) -> usize {
        self.inner.lock().unwrap().available.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qkd_backing_store::SqliteBackingStore;

    fn store() -> KeyStore {
        let backing = Arc::new(SqliteBackingStore::open_in_memory().unwrap());
        KeyStore::with_cache_limit(SiteId::parse("tcp://site-a:7000").unwrap(), backing, 3)
    }

    #[test]
    fn get_new_key_consumes_in_fifo_order() {
        let store = store();
        for id in 1..=3u64 {
            store.add_key(KeyId::new(id), Psk::new(vec![id as u8; 16]).unwrap()).unwrap();
        }
        let (first, _) = store.get_new_key().unwrap();
        assert_eq!(first, KeyId::new(1));
        let (second, _) = store.get_new_key().unwrap();
        assert_eq!(second, KeyId::new(2));
    }

    #[test]
    fn get_new_key_fails_when_empty() {
        let store = store();
        assert!(store.get_new_key().is_err());
    }

    #[test]
    fn get_new_key_physically_removes_the_record() {
        let store = store();
        store.add_key(KeyId::new(1), Psk::new(vec![9; 16]).unwrap()).unwrap();
        let (key_id, _) = store.get_new_key().unwrap();
        assert!(store.get_shared_key(key_id).is_err());
    }

    #[test]
    fn mark_key_in_use_rejects_double_claim() {
        let store = store();
        store.add_key(KeyId::new(1), Psk::new(vec![1; 16]).unwrap()).unwrap();
        store.mark_key_in_use(KeyId::new(1)).unwrap();
        assert!(store.mark_key_in_use(KeyId::new(1)).is_err());
    }

    #[test]
    fn release_key_makes_a_soft_claim_available_again() {
        let store = store();
        store.add_key(KeyId::new(1), Psk::new(vec![1; 16]).unwrap()).unwrap();
        let (key_id, _) = store.claim_available_key().unwrap();
        store.release_key(key_id);
        assert_eq!(store.available_count(), 1);
        assert!(store.claim_available_key().is_some());
    }

    #[test]
    fn cache_evicts_fifo_beyond_limit() {
        let store = store(); // cache_limit = 3
        for id in 1..=5u64 {
            store.add_key(KeyId::new(id), Psk::new(vec![id as u8; 16]).unwrap()).unwrap();
        }
        // key 1 and 2 were evicted from the hot cache, but still durable
        assert!(store.get_shared_key(KeyId::new(1)).is_ok());
        assert!(store.get_shared_key(KeyId::new(5)).is_ok());
    }

    struct RecordingSink {
        seen: Mutex<Vec<KeyId>>,
    }

    impl KeyPublisherSink for RecordingSink {
        fn publish_key(&self, _site: &SiteId, key_id: KeyId) {
            self.seen.lock().unwrap().push(key_id);
        }
    }

    #[test]
    fn publisher_is_notified_on_add() {
        let store = store();
        let sink = Arc::new(RecordingSink { seen: Mutex::new(Vec::new()) });
        store.add_publisher(sink.clone());
        store.add_key(KeyId::new(1), Psk::new(vec![1; 16]).unwrap()).unwrap();
        assert_eq!(sink.seen.lock().unwrap().as_slice(), &[KeyId::new(1)]);
    }
}
