//! SQLite-backed PSK storage, the default backing store for a site with no
//! HSM (spec §4.2). Grounded in the plain `rusqlite::Connection` usage seen
//! across the retrieved example manifests: one connection per store, guarded
//! by a `Mutex` since `Connection` is `Send` but not `Sync`.
//!
//! Two tables: `links` holds one row per destination site (`link_id` is an
//! FNV-1a hash of the site string, used only to index `keys` — collisions
//! across distinct sites are an accepted trade-off of a non-cryptographic
//! hash used purely for grouping, not a uniqueness guarantee) plus the
//! monotonic `next_key_id` counter; `keys` holds the per-destination id
//! space with an `in_use` flag standing in for `Available`/`Reserved`.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use qkd_types::{KeyId, Psk, SiteId};

use crate::error::BackingStoreError;
use crate::fnv::fnv1a;
use crate::{BackingStore, KeyCounts};

pub struct SqliteBackingStore {
    conn: Mutex<Connection>,
}

impl SqliteBackingStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackingStoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, BackingStoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, BackingStoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS links (
                link_id      INTEGER PRIMARY KEY,
                site         TEXT NOT NULL UNIQUE,
                next_key_id  INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS keys (
                link_id    INTEGER NOT NULL,
                id         INTEGER NOT NULL,
                value      BLOB NOT NULL,
                in_use     INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (link_id, id)
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Finds or creates the `links` row for `site`, returning its `link_id`.
    fn link_id(conn: &Connection, site: &SiteId) -> Result<i64, BackingStoreError> {
        let site_str = site.to_string();
        let link_id = fnv1a(site_str.as_bytes()) as i64;
        conn.execute(
            "INSERT OR IGNORE INTO links (link_id, site, next_key_id) VALUES (?1, ?2, 1)",
            params![link_id, site_str],
        )?;
        Ok(link_id)
    }

    fn decode(bytes: Vec<u8>) -> Result<Psk, BackingStoreError> {
        Psk::new(bytes).map_err(|e| BackingStoreError::Integrity(e.to_string()))
    }
}

impl BackingStore for SqliteBackingStore {
    fn store_keys(&self, dest: &SiteId, keys: &mut Vec<(KeyId, Psk)>) -> Result<(), BackingStoreError> {
        let conn = self.conn.lock().unwrap();
        let link_id = Self::link_id(&conn, dest)?;
        let mut remaining = Vec::new();
        for (id, psk) in keys.drain(..) {
            let rows = conn.execute(
                "INSERT OR IGNORE INTO keys (link_id, id, value, in_use) VALUES (?1, ?2, ?3, 0)",
                params![link_id, id.get() as i64, psk.as_bytes()],
            )?;
            if rows == 0 {
                remaining.push((id, psk));
            }
        }
        *keys = remaining;
        Ok(())
    }

    fn get_key(&self, dest: &SiteId, id: KeyId) -> Result<Psk, BackingStoreError> {
        let conn = self.conn.lock().unwrap();
        let link_id = Self::link_id(&conn, dest)?;
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM keys WHERE link_id = ?1 AND id = ?2",
                params![link_id, id.get() as i64],
                |row| row.get(0),
            )
            .optional()?;
        let bytes = bytes.ok_or_else(|| BackingStoreError::NotFound(id.to_string()))?;
        Self::decode(bytes)
    }

    fn find_key(&self, dest: &SiteId, id: KeyId) -> Result<(KeyId, Psk), BackingStoreError> {
        let conn = self.conn.lock().unwrap();
        let link_id = Self::link_id(&conn, dest)?;
        let row: Option<(i64, Vec<u8>)> = if id.get() == 0 {
            conn.query_row(
                "SELECT id, value FROM keys WHERE link_id = ?1 AND in_use = 0 ORDER BY id LIMIT 1",
                params![link_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        } else {
            conn.query_row(
                "SELECT id, value FROM keys WHERE link_id = ?1 AND id = ?2",
                params![link_id, id.get() as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };
        let (found_id, bytes) = row.ok_or_else(|| BackingStoreError::NotFound(id.to_string()))?;
        let psk = Self::decode(bytes)?;
        Ok((KeyId::new(found_id as u64), psk))
    }

    fn key_exists(&self, dest: &SiteId, id: KeyId) -> Result<bool, BackingStoreError> {
        let conn = self.conn.lock().unwrap();
        let link_id = Self::link_id(&conn, dest)?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM keys WHERE link_id = ?1 AND id = ?2",
                params![link_id, id.get() as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    fn reserve_key(&self, dest: &SiteId) -> Result<KeyId, BackingStoreError> {
        let conn = self.conn.lock().unwrap();
        let link_id = Self::link_id(&conn, dest)?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM keys WHERE link_id = ?1 AND in_use = 0 ORDER BY id LIMIT 1",
                params![link_id],
                |row| row.get(0),
            )
            .optional()?;
        let id = id.ok_or_else(|| BackingStoreError::Unavailable(dest.to_string()))?;
        conn.execute(
            "UPDATE keys SET in_use = 1 WHERE link_id = ?1 AND id = ?2",
            params![link_id, id],
        )?;
        Ok(KeyId::new(id as u64))
    }

    fn remove_key(&self, dest: &SiteId, id: KeyId) -> Result<Psk, BackingStoreError> {
        let conn = self.conn.lock().unwrap();
        let link_id = Self::link_id(&conn, dest)?;
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM keys WHERE link_id = ?1 AND id = ?2",
                params![link_id, id.get() as i64],
                |row| row.get(0),
            )
            .optional()?;
        let bytes = bytes.ok_or_else(|| BackingStoreError::NotFound(id.to_string()))?;
        conn.execute(
            "DELETE FROM keys WHERE link_id = ?1 AND id = ?2",
            params![link_id, id.get() as i64],
        )?;
        Self::decode(bytes)
    }

    fn remove_keys(&self, dest: &SiteId, ids: &[KeyId]) -> Result<Vec<Psk>, BackingStoreError> {
        let conn = self.conn.lock().unwrap();
        let link_id = Self::link_id(&conn, dest)?;
        let mut values = Vec::with_capacity(ids.len());
        for id in ids {
            let bytes: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT value FROM keys WHERE link_id = ?1 AND id = ?2",
                    params![link_id, id.get() as i64],
                    |row| row.get(0),
                )
                .optional()?;
            let bytes = bytes.ok_or_else(|| BackingStoreError::NotFound(id.to_string()))?;
            values.push(Self::decode(bytes)?);
        }
        for id in ids {
            conn.execute(
                "DELETE FROM keys WHERE link_id = ?1 AND id = ?2",
                params![link_id, id.get() as i64],
            )?;
        }
        Ok(values)
    }

    fn get_counts(&self, dest: &SiteId) -> Result<KeyCounts, BackingStoreError> {
        let conn = self.conn.lock().unwrap();
        let link_id = Self::link_id(&conn, dest)?;
        let available: i64 = conn.query_row(
            "SELECT COUNT(*) FROM keys WHERE link_id = ?1 AND in_use = 0",
            params![link_id],
            |row| row.get(0),
        )?;
        Ok(KeyCounts {
            available: available as u64,
            capacity_remaining: None,
        })
    }

    fn get_next_key_id(&self, dest: &SiteId) -> Result<KeyId, BackingStoreError> {
        let conn = self.conn.lock().unwrap();
        let link_id = Self::link_id(&conn, dest)?;
        let next: i64 = conn.query_row(
            "SELECT next_key_id FROM links WHERE link_id = ?1",
            params![link_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "UPDATE links SET next_key_id = ?2 WHERE link_id = ?1",
            params![link_id, next + 1],
        )?;
        Ok(KeyId::new(next as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qkd_types::SiteId;

    fn store() -> SqliteBackingStore {
        SqliteBackingStore::open_in_memory().unwrap()
    }

    fn site_a() -> SiteId {
        SiteId::parse("tcp://site-a:7000").unwrap()
    }

    fn site_b() -> SiteId {
        SiteId::parse("tcp://site-b:7000").unwrap()
    }

    #[test]
    fn round_trips_a_key() {
        let store = store();
        let psk = Psk::new(vec![0xAB; 32]).unwrap();
        let mut keys = vec![(KeyId::new(1), psk.clone())];
        store.store_keys(&site_a(), &mut keys).unwrap();
        assert!(keys.is_empty());
        let loaded = store.get_key(&site_a(), KeyId::new(1)).unwrap();
        assert_eq!(loaded.as_bytes(), psk.as_bytes());
    }

    #[test]
    fn same_id_is_independent_across_destinations() {
        let store = store();
        let psk_a = Psk::new(vec![1; 16]).unwrap();
        let psk_b = Psk::new(vec![2; 16]).unwrap();
        store.store_keys(&site_a(), &mut vec![(KeyId::new(1), psk_a.clone())]).unwrap();
        store.store_keys(&site_b(), &mut vec![(KeyId::new(1), psk_b.clone())]).unwrap();
        assert_eq!(store.get_key(&site_a(), KeyId::new(1)).unwrap().as_bytes(), psk_a.as_bytes());
        assert_eq!(store.get_key(&site_b(), KeyId::new(1)).unwrap().as_bytes(), psk_b.as_bytes());
    }

    #[test]
    fn store_keys_leaves_duplicates_in_the_vec() {
        let store = store();
        let psk = Psk::new(vec![1; 16]).unwrap();
        store.store_keys(&site_a(), &mut vec![(KeyId::new(1), psk.clone())]).unwrap();
        let mut retry = vec![(KeyId::new(1), psk.clone()), (KeyId::new(2), psk.clone())];
        store.store_keys(&site_a(), &mut retry).unwrap();
        assert_eq!(retry, vec![(KeyId::new(1), psk)]);
    }

    #[test]
    fn remove_key_then_get_key_not_found() {
        let store = store();
        let psk = Psk::new(vec![2; 16]).unwrap();
        store.store_keys(&site_a(), &mut vec![(KeyId::new(7), psk)]).unwrap();
        store.remove_key(&site_a(), KeyId::new(7)).unwrap();
        assert!(store.get_key(&site_a(), KeyId::new(7)).is_err());
    }

    #[test]
    fn reserve_key_picks_lowest_available_and_excludes_it_next_time() {
        let store = store();
        let psk = Psk::new(vec![3; 16]).unwrap();
        store
            .store_keys(&site_a(), &mut vec![
                (KeyId::new(5), psk.clone()),
                (KeyId::new(1), psk.clone()),
                (KeyId::new(3), psk.clone()),
            ])
            .unwrap();
        let first = store.reserve_key(&site_a()).unwrap();
        assert_eq!(first, KeyId::new(1));
        let second = store.reserve_key(&site_a()).unwrap();
        assert_eq!(second, KeyId::new(3));
    }

    #[test]
    fn reserve_key_fails_when_nothing_available() {
        let store = store();
        let err = store.reserve_key(&site_a()).unwrap_err();
        assert!(matches!(err, BackingStoreError::Unavailable(_)));
    }

    #[test]
    fn remove_key_clears_a_reservation() {
        let store = store();
        let psk = Psk::new(vec![4; 16]).unwrap();
        store.store_keys(&site_a(), &mut vec![(KeyId::new(1), psk)]).unwrap();
        store.reserve_key(&site_a()).unwrap();
        store.remove_key(&site_a(), KeyId::new(1)).unwrap();
        assert!(!store.key_exists(&site_a(), KeyId::new(1)).unwrap());
    }

    #[test]
    fn find_key_zero_sentinel_returns_lowest_available() {
        let store = store();
        let psk = Psk::new(vec![5; 16]).unwrap();
        store
            .store_keys(&site_a(), &mut vec![(KeyId::new(9), psk.clone()), (KeyId::new(2), psk.clone())])
            .unwrap();
        let (found, _) = store.find_key(&site_a(), KeyId::new(0)).unwrap();
        assert_eq!(found, KeyId::new(2));
    }

    #[test]
    fn get_next_key_id_is_monotonic_across_deletes() {
        let store = store();
        let psk = Psk::new(vec![6; 16]).unwrap();
        let first = store.get_next_key_id(&site_a()).unwrap();
        store.store_keys(&site_a(), &mut vec![(first, psk)]).unwrap();
        store.remove_key(&site_a(), first).unwrap();
        let second = store.get_next_key_id(&site_a()).unwrap();
        assert!(second > first);
    }

    #[test]
    fn get_counts_reflects_reservations() {
        let store = store();
        let psk = Psk::new(vec![7; 16]).unwrap();
        store
            .store_keys(&site_a(), &mut vec![(KeyId::new(1), psk.clone()), (KeyId::new(2), psk)])
            .unwrap();
        store.reserve_key(&site_a()).unwrap();
        let counts = store.get_counts(&site_a()).unwrap();
        assert_eq!(counts.available, 1);
        assert_eq!(counts.capacity_remaining, None);
    }
}
