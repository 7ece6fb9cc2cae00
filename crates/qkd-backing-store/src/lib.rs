//! PSK persistence behind one trait, with SQLite, PKCS#11, and YubiHSM2
//! implementations selected by URL (spec §4.2).

mod error;
mod factory;
mod fnv;
mod pkcs11;
mod sqlite;
mod yubihsm_store;

pub use error::BackingStoreError;
pub use factory::BackingStoreFactory;
pub use pkcs11::Pkcs11BackingStore;
pub use sqlite::SqliteBackingStore;
pub use yubihsm_store::YubiHsm2BackingStore;

use qkd_types::{KeyId, Psk, SiteId};

/// Key counts for one destination, as returned by [`BackingStore::get_counts`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyCounts {
    pub available: u64,
    /// `None` for backends with no fixed capacity (e.g. a database file).
    pub capacity_remaining: Option<u64>,
}

/// Durable storage for PSKs, scoped per destination site, implemented by a
/// site's chosen key-material backend. Every operation takes the
/// destination explicitly: an id is only unique within one destination's id
/// space, not across the whole store (spec §3, §4.2).
///
/// Implementations must be safe to call from multiple threads: the key
/// store issues calls from whichever RPC handler thread is active.
pub trait BackingStore: Send + Sync {
    /// Stores a batch of keys for `dest`. A duplicate id is a per-item
    /// failure, not a whole-batch failure: on return, `keys` holds only the
    /// entries that were *not* stored (e.g. because their id already
    /// existed), so the caller may retry them under fresh ids.
    fn store_keys(&self, dest: &SiteId, keys: &mut Vec<(KeyId, Psk)>) -> Result<(), BackingStoreError>;

    /// Fetches a key's bytes regardless of its reservation state.
    fn get_key(&self, dest: &SiteId, id: KeyId) -> Result<Psk, BackingStoreError>;

    /// Fetches a key by id, or — when `id` is the `0` sentinel — the
    /// lowest-numbered available key. Returns the id actually resolved.
    fn find_key(&self, dest: &SiteId, id: KeyId) -> Result<(KeyId, Psk), BackingStoreError>;

    fn key_exists(&self, dest: &SiteId, id: KeyId) -> Result<bool, BackingStoreError>;

    /// Atomically transitions the lowest-numbered `Available` key to
    /// `Reserved` and returns its id. This is the atomicity primitive behind
    /// at-most-once delivery (spec §4.3): two concurrent callers must never
    /// receive the same id.
    fn reserve_key(&self, dest: &SiteId) -> Result<KeyId, BackingStoreError>;

    /// Atomically reads and deletes a key, clearing any reservation on it.
    fn remove_key(&self, dest: &SiteId, id: KeyId) -> Result<Psk, BackingStoreError>;

    /// Batch form of [`remove_key`](Self::remove_key): all-or-nothing.
    fn remove_keys(&self, dest: &SiteId, ids: &[KeyId]) -> Result<Vec<Psk>, BackingStoreError>;

    fn get_counts(&self, dest: &SiteId) -> Result<KeyCounts, BackingStoreError>;

    /// The smallest unused id for `dest`; monotonic, so it always exceeds
    /// the largest id this destination has ever seen, even after deletes.
    fn get_next_key_id(&self, dest: &SiteId) -> Result<KeyId, BackingStoreError>;
}
