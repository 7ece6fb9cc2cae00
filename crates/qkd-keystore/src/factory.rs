//! Creates and caches one [`KeyStore`] per peer site, and combines keys
//! across a multi-hop [`PhysicalPath`] of trusted-node relays (spec §4.3).
//!
//! Grounded in `KeyManagement/KeyStores/KeyStoreFactory.h`'s
//! `GetKeyStore`/`DoCombinedKey`: one factory per site agent process, a
//! lazily-created store per destination, and a combine operation that
//! walks a chain of hops XOR-ing each leg's key into a running total.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use qkd_backing_store::BackingStore;
use qkd_types::{HopPair, KeyId, PhysicalPath, Psk, SiteId};

use crate::error::KeyStoreError;
use crate::keystore::KeyStore;

/// The other end of a hop: fetches and reserves keys on a remote site the
/// way `GetNewKey`/`MarkKeyInUse` do locally, over whatever transport the
/// caller's site agent uses.
pub trait KeyPeer: Send + Sync {
    fn get_new_key(&self, site: &SiteId) -> Result<(KeyId, Psk), KeyStoreError>;
    fn release_key(&self, site: &SiteId, key_id: KeyId);
}

pub struct KeyStoreFactory {
    backing: Arc<dyn BackingStore>,
    site_address: Mutex<Option<SiteId>>,
    stores: Mutex<HashMap<SiteId, Arc<KeyStore>>>,
    cache_limit: u64,
}

impl KeyStoreFactory {
    pub fn new(backing: Arc<dyn BackingStore>) -> Self {
        Self {
            backing,
            site_address: Mutex::new(None),
            stores: Mutex::new(HashMap::new()),
            cache_limit: crate::keystore::DEFAULT_CACHE_LIMIT,
        }
    }

    pub fn set_site_address(&self, site: SiteId) {
        *self.site_address.lock().unwrap() = Some(site);
    }

    pub fn set_key_store_cache_limit(&mut self, limit: u64) {
        self.cache_limit = limit;
    }

    /// Gets (creating if absent) the key store for a destination site.
    pub fn get_key_store(&self, destination: &SiteId) -> Arc<KeyStore> {
        let mut stores = self.stores.lock().unwrap();
        stores
            .entry(destination.clone())
            .or_insert_with(|| {
                Arc::new(KeyStore::with_cache_limit(
                    destination.clone(),
                    self.backing.clone(),
                    self.cache_limit,
                ))
            })
            .clone()
    }

    /// Builds a key usable between the two ends of `path` by claiming one
    /// fresh key per hop and XOR-ing them together (spec §4.3). If any hop
    /// past the first fails, every key already claimed on earlier hops is
    /// released rather than left stranded as "in use" for a key that was
    /// never actually handed out.
    pub fn build_combined_key(
        &self,
        path: &PhysicalPath,
        peer: &dyn KeyPeer,
    ) -> Result<Psk, KeyStoreError> {
        let mut claimed: Vec<(SiteId, KeyId)> = Vec::new();
        let mut combined: Option<Psk> = None;

        let result = (|| {
            for hop in path {
                let site = hop_site(hop)?;
                let (key_id, psk) = self.claim_for_hop(&site, peer)?;
                claimed.push((site, key_id));
                combined = Some(match combined.take() {
                    None => psk,
                    Some(acc) => acc.xor(&psk)?,
                });
            }
            combined.ok_or_else(|| KeyStoreError::NoKeyAvailable("path has no hops".into()))
        })();

        if result.is_err() {
            for (site, key_id) in claimed {
                self.release_for_hop(&site, key_id, peer);
            }
        }

        result
    }

    /// Soft-claims a key for one hop of the chain (spec §4.3.1: "each site
    /// reserves locally before responding"). Uses the reversible reservation
    /// rather than [`KeyStore::get_new_key`]'s hard consumption, since a
    /// later hop's failure must be able to release this one back.
    fn claim_for_hop(&self, site: &SiteId, peer: &dyn KeyPeer) -> Result<(KeyId, Psk), KeyStoreError> {
        let local_site = self.site_address.lock().unwrap().clone();
        if local_site.as_ref() == Some(site) {
            let store = self.get_key_store(site);
            store
                .claim_available_key()
                .ok_or_else(|| KeyStoreError::NoKeyAvailable(site.to_string()))
        } else {
            peer.get_new_key(site)
        }
    }

    fn release_for_hop(&self, site: &SiteId, key_id: KeyId, peer: &dyn KeyPeer) {
        let local_site = self.site_address.lock().unwrap().clone();
        if local_site.as_ref() == Some(site) {
            self.get_key_store(site).release_key(key_id);
        } else {
            peer.release_key(site, key_id);
        }
    }
}

fn hop_site(hop: &HopPair) -> Result<SiteId, KeyStoreError> {
    hop.second
        .as_ref()
        .map(|endpoint| endpoint.site.clone())
        .ok_or_else(|| KeyStoreError::NoKeyAvailable("hop is missing its far endpoint".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use qkd_backing_store::SqliteBackingStore;
    use qkd_types::{Endpoint, HopPair};
    use std::sync::Mutex as StdMutex;

    struct FlakyPeer {
        fail_site: SiteId,
        released: StdMutex<Vec<(SiteId, KeyId)>>,
    }

    impl KeyPeer for FlakyPeer {
        fn get_new_key(&self, site: &SiteId) -> Result<(KeyId, Psk), KeyStoreError> {
            if *site == self.fail_site {
                Err(KeyStoreError::NoKeyAvailable(site.to_string()))
            } else {
                Ok((KeyId::new(1), Psk::new(vec![0x11; 16]).unwrap()))
            }
        }

        fn release_key(&self, site: &SiteId, key_id: KeyId) {
            self.released.lock().unwrap().push((site.clone(), key_id));
        }
    }

    fn factory() -> KeyStoreFactory {
        let backing = Arc::new(SqliteBackingStore::open_in_memory().unwrap());
        KeyStoreFactory::new(backing)
    }

    fn endpoint(host: &str) -> Endpoint {
        Endpoint::new(SiteId::parse(&format!("tcp://{host}:7000")).unwrap(), "dev-0")
    }

    #[test]
    fn combines_two_hops_with_xor() {
        let factory = factory();
        let site_a = SiteId::parse("tcp://site-a:7000").unwrap();
        factory.set_site_address(site_a.clone());
        let store_b = factory.get_key_store(&SiteId::parse("tcp://site-b:7000").unwrap());
        // seed a local-side key for hop 1 ("site-a" is local)
        let local_store = factory.get_key_store(&site_a);
        local_store.add_key(KeyId::new(1), Psk::new(vec![0xAA; 16]).unwrap()).unwrap();
        drop(store_b);

        let peer = FlakyPeer {
            fail_site: SiteId::parse("tcp://nowhere:1").unwrap(),
            released: StdMutex::new(Vec::new()),
        };

        let path: PhysicalPath = vec![HopPair::new(endpoint("origin"), Endpoint::new(site_a.clone(), "dev-0"))];
        let combined = factory.build_combined_key(&path, &peer).unwrap();
        assert_eq!(combined.as_bytes(), &[0xAA; 16]);
    }

    #[test]
    fn rolls_back_earlier_hops_on_later_failure() {
        let factory = factory();
        let far_site = SiteId::parse("tcp://site-c:7000").unwrap();
        let peer = FlakyPeer {
            fail_site: far_site.clone(),
            released: StdMutex::new(Vec::new()),
        };

        let path: PhysicalPath = vec![
            HopPair::new(endpoint("origin"), endpoint("site-b")),
            HopPair::new(endpoint("site-b"), Endpoint::new(far_site.clone(), "dev-0")),
        ];

        let err = factory.build_combined_key(&path, &peer).unwrap_err();
        assert!(matches!(err, KeyStoreError::NoKeyAvailable(_)));
        assert_eq!(peer.released.lock().unwrap().len(), 1);
    }
}
