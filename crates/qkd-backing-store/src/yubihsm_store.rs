//! YubiHSM2-backed PSK storage (spec §4.2, §6). PSKs are stored as opaque
//! data objects; the device addresses objects by a 16-bit id and carries no
//! free-form metadata, so this store keeps an in-memory map from
//! `(destination, KeyId)` to the allocated device id, an in-memory
//! reservation set (lost on restart — the device itself cannot represent
//! "reserved"), and the set of device ids already handed out.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use yubihsm::object::{Id as ObjectId, Label};
use yubihsm::{Capability, Client, Connector, Credentials, Domain};

use qkd_types::{KeyId, Psk, SiteId};

use crate::error::BackingStoreError;
use crate::{BackingStore, KeyCounts};

fn yubihsm_err(context: &str, err: impl std::fmt::Display) -> BackingStoreError {
    BackingStoreError::YubiHsm(format!("{context}: {err}"))
}

struct Reservations {
    by_dest_id: HashMap<(SiteId, KeyId), ObjectId>,
    reserved: HashSet<(SiteId, KeyId)>,
    used_object_ids: HashSet<ObjectId>,
}

pub struct YubiHsm2BackingStore {
    client: Client,
    reservations: Mutex<Reservations>,
}

impl YubiHsm2BackingStore {
    pub fn open(connector: Connector, credentials: Credentials) -> Result<Self, BackingStoreError> {
        let client = Client::open(connector, credentials, true)
            .map_err(|e| yubihsm_err("open session", e))?;
        Ok(Self {
            client,
            reservations: Mutex::new(Reservations {
                by_dest_id: HashMap::new(),
                reserved: HashSet::new(),
                used_object_ids: HashSet::new(),
            }),
        })
    }

    fn allocate_object_id(reservations: &mut Reservations) -> Result<ObjectId, BackingStoreError> {
        for candidate in 1..=0xFFFEu16 {
            if !reservations.used_object_ids.contains(&candidate) {
                reservations.used_object_ids.insert(candidate);
                return Ok(candidate);
            }
        }
        Err(BackingStoreError::Unavailable("no free object ids".into()))
    }

    fn label(dest: &SiteId, id: KeyId) -> Result<Label, BackingStoreError> {
        Label::from_bytes(format!("{dest}#{id}").as_bytes()).map_err(|e| yubihsm_err("build label", e))
    }
}

impl BackingStore for YubiHsm2BackingStore {
    fn store_keys(&self, dest: &SiteId, keys: &mut Vec<(KeyId, Psk)>) -> Result<(), BackingStoreError> {
        let mut remaining = Vec::new();
        for (id, psk) in keys.drain(..) {
            let mut reservations = self.reservations.lock().unwrap();
            if reservations.by_dest_id.contains_key(&(dest.clone(), id)) {
                remaining.push((id, psk));
                continue;
            }
            let object_id = Self::allocate_object_id(&mut reservations)?;
            let label = Self::label(dest, id)?;
            drop(reservations);

            self.client
                .put_opaque(
                    object_id,
                    label,
                    Domain::at(1).into_iter().collect(),
                    Capability::all(),
                    yubihsm::object::ObjectAlgorithm::OpaqueData,
                    psk.as_bytes().to_vec(),
                )
                .map_err(|e| yubihsm_err("put_opaque", e))?;

            self.reservations
                .lock()
                .unwrap()
                .by_dest_id
                .insert((dest.clone(), id), object_id);
        }
        *keys = remaining;
        Ok(())
    }

    fn get_key(&self, dest: &SiteId, id: KeyId) -> Result<Psk, BackingStoreError> {
        let object_id = {
            let reservations = self.reservations.lock().unwrap();
            *reservations
                .by_dest_id
                .get(&(dest.clone(), id))
                .ok_or_else(|| BackingStoreError::NotFound(id.to_string()))?
        };
        let bytes = self
            .client
            .get_opaque(object_id)
            .map_err(|e| yubihsm_err("get_opaque", e))?;
        Psk::new(bytes).map_err(|e| BackingStoreError::Integrity(e.to_string()))
    }

    fn find_key(&self, dest: &SiteId, id: KeyId) -> Result<(KeyId, Psk), BackingStoreError> {
        if id.get() != 0 {
            return Ok((id, self.get_key(dest, id)?));
        }
        let candidate = {
            let reservations = self.reservations.lock().unwrap();
            reservations
                .by_dest_id
                .keys()
                .filter(|(site, key_id)| site == dest && !reservations.reserved.contains(&(site.clone(), *key_id)))
                .map(|(_, key_id)| *key_id)
                .min()
        };
        let id = candidate.ok_or_else(|| BackingStoreError::Unavailable(dest.to_string()))?;
        Ok((id, self.get_key(dest, id)?))
    }

    fn key_exists(&self, dest: &SiteId, id: KeyId) -> Result<bool, BackingStoreError> {
        let reservations = self.reservations.lock().unwrap();
        Ok(reservations.by_dest_id.contains_key(&(dest.clone(), id)))
    }

    fn reserve_key(&self, dest: &SiteId) -> Result<KeyId, BackingStoreError> {
        let mut reservations = self.reservations.lock().unwrap();
        let candidate = reservations
            .by_dest_id
            .keys()
            .filter(|(site, id)| site == dest && !reservations.reserved.contains(&(site.clone(), *id)))
            .map(|(_, id)| *id)
            .min()
            .ok_or_else(|| BackingStoreError::Unavailable(dest.to_string()))?;
        reservations.reserved.insert((dest.clone(), candidate));
        Ok(candidate)
    }

    fn remove_key(&self, dest: &SiteId, id: KeyId) -> Result<Psk, BackingStoreError> {
        let object_id = {
            let mut reservations = self.reservations.lock().unwrap();
            let object_id = reservations
                .by_dest_id
                .remove(&(dest.clone(), id))
                .ok_or_else(|| BackingStoreError::NotFound(id.to_string()))?;
            reservations.reserved.remove(&(dest.clone(), id));
            reservations.used_object_ids.remove(&object_id);
            object_id
        };
        let bytes = self
            .client
            .get_opaque(object_id)
            .map_err(|e| yubihsm_err("get_opaque", e))?;
        self.client
            .delete_object(object_id, yubihsm::object::Type::Opaque)
            .map_err(|e| yubihsm_err("delete_object", e))?;
        Psk::new(bytes).map_err(|e| BackingStoreError::Integrity(e.to_string()))
    }

    fn remove_keys(&self, dest: &SiteId, ids: &[KeyId]) -> Result<Vec<Psk>, BackingStoreError> {
        let mut values = Vec::with_capacity(ids.len());
        for id in ids {
            values.push(self.remove_key(dest, *id)?);
        }
        Ok(values)
    }

    fn get_counts(&self, dest: &SiteId) -> Result<KeyCounts, BackingStoreError> {
        let reservations = self.reservations.lock().unwrap();
        let available = reservations
            .by_dest_id
            .keys()
            .filter(|(site, id)| site == dest && !reservations.reserved.contains(&(site.clone(), *id)))
            .count() as u64;
        Ok(KeyCounts {
            available,
            capacity_remaining: Some(0xFFFE - reservations.used_object_ids.len() as u64),
        })
    }

    fn get_next_key_id(&self, dest: &SiteId) -> Result<KeyId, BackingStoreError> {
        let reservations = self.reservations.lock().unwrap();
        let max_seen = reservations
            .by_dest_id
            .keys()
            .filter(|(site, _)| site == dest)
            .map(|(_, id)| id.get())
            .max()
            .unwrap_or(0);
        Ok(KeyId::new(max_seen + 1))
    }
}
