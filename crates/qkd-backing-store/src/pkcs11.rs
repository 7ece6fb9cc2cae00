//! HSM-backed PSK storage over PKCS#11 (spec §4.2, §6). Each PSK is stored
//! as a secret-key object: `CKA_LABEL` carries the destination site string
//! so keys for different peers never collide in the same id space,
//! `CKA_ID` the key id as raw big-endian bytes so it can be looked up
//! without a label scan, `CKA_VALUE` the PSK bytes, and `CKA_APPLICATION` a
//! reservation sentinel string (`"available"`/`"reserved"`) standing in for
//! the spec's `START_DATE` convention — the device has no boolean attribute
//! cheap enough to repurpose, and the generic application string is the
//! least surprising substitute.

use std::sync::Mutex;

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::types::AuthPin;

use qkd_types::{KeyId, Psk, SiteId};
use qkd_uri::{Pkcs11Url, PinSource};

use crate::error::BackingStoreError;
use crate::{BackingStore, KeyCounts};

fn pkcs11_err(context: &str, err: impl std::fmt::Display) -> BackingStoreError {
    BackingStoreError::Pkcs11(format!("{context}: {err}"))
}

const RESERVED_MARK: &[u8] = b"reserved";
const AVAILABLE_MARK: &[u8] = b"available";

pub struct Pkcs11BackingStore {
    // kept alive for the lifetime of `session`, which borrows it internally
    _context: Pkcs11,
    session: Mutex<Session>,
}

impl Pkcs11BackingStore {
    pub fn open(module_path: &str, url: &Pkcs11Url) -> Result<Self, BackingStoreError> {
        let context = Pkcs11::new(module_path).map_err(|e| pkcs11_err("load module", e))?;
        context
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| pkcs11_err("initialize", e))?;

        let slots = context
            .get_slots_with_token()
            .map_err(|e| pkcs11_err("enumerate slots", e))?;
        let slot = if let Some(slot_id) = url.slot_id {
            slots
                .into_iter()
                .find(|s| u64::from(s.id()) == slot_id)
                .ok_or_else(|| BackingStoreError::Pkcs11(format!("no slot with id {slot_id}")))?
        } else {
            slots
                .into_iter()
                .next()
                .ok_or_else(|| BackingStoreError::Pkcs11("no token present".into()))?
        };

        let session = context
            .open_rw_session(slot)
            .map_err(|e| pkcs11_err("open session", e))?;

        if let Some(PinSource::Value(pin)) = &url.pin {
            session
                .login(UserType::User, Some(&AuthPin::new(pin.clone())))
                .map_err(|e| pkcs11_err("login", e))?;
        }

        Ok(Self {
            _context: context,
            session: Mutex::new(session),
        })
    }

    fn find_one(session: &Session, dest: &SiteId, id: KeyId) -> Result<Option<ObjectHandle>, BackingStoreError> {
        let template = vec![
            Attribute::Label(dest.to_string().into_bytes()),
            Attribute::Id(id.get().to_be_bytes().to_vec()),
        ];
        let handles = session
            .find_objects(&template)
            .map_err(|e| pkcs11_err("find_objects", e))?;
        Ok(handles.into_iter().next())
    }

    fn find_all(session: &Session, dest: &SiteId) -> Result<Vec<ObjectHandle>, BackingStoreError> {
        let template = vec![
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::Label(dest.to_string().into_bytes()),
        ];
        session
            .find_objects(&template)
            .map_err(|e| pkcs11_err("find_objects", e))
    }

    fn handle_id(session: &Session, handle: ObjectHandle) -> Result<KeyId, BackingStoreError> {
        let attrs = session
            .get_attributes(handle, &[AttributeType::Id])
            .map_err(|e| pkcs11_err("get_attributes", e))?;
        let bytes = attrs
            .into_iter()
            .find_map(|a| match a {
                Attribute::Id(bytes) => Some(bytes),
                _ => None,
            })
            .ok_or_else(|| BackingStoreError::Pkcs11("object has no CKA_ID".into()))?;
        let array = <[u8; 8]>::try_from(bytes.as_slice())
            .map_err(|_| BackingStoreError::Integrity("CKA_ID is not 8 bytes".into()))?;
        Ok(KeyId::new(u64::from_be_bytes(array)))
    }

    fn handle_value(session: &Session, handle: ObjectHandle) -> Result<Psk, BackingStoreError> {
        let attrs = session
            .get_attributes(handle, &[AttributeType::Value])
            .map_err(|e| pkcs11_err("get_attributes", e))?;
        let value = attrs
            .into_iter()
            .find_map(|a| match a {
                Attribute::Value(bytes) => Some(bytes),
                _ => None,
            })
            .ok_or_else(|| BackingStoreError::Pkcs11("object has no CKA_VALUE".into()))?;
        Psk::new(value).map_err(|e| BackingStoreError::Integrity(e.to_string()))
    }

    fn is_reserved(session: &Session, handle: ObjectHandle) -> Result<bool, BackingStoreError> {
        let attrs = session
            .get_attributes(handle, &[AttributeType::Application])
            .map_err(|e| pkcs11_err("get_attributes", e))?;
        Ok(attrs
            .into_iter()
            .any(|a| matches!(a, Attribute::Application(mark) if mark == RESERVED_MARK)))
    }
}

impl BackingStore for Pkcs11BackingStore {
    fn store_keys(&self, dest: &SiteId, keys: &mut Vec<(KeyId, Psk)>) -> Result<(), BackingStoreError> {
        let session = self.session.lock().unwrap();
        let mut remaining = Vec::new();
        for (id, psk) in keys.drain(..) {
            if Self::find_one(&session, dest, id)?.is_some() {
                remaining.push((id, psk));
                continue;
            }
            let template = vec![
                Attribute::Class(ObjectClass::SECRET_KEY),
                Attribute::Token(true),
                Attribute::Private(true),
                Attribute::Label(dest.to_string().into_bytes()),
                Attribute::Id(id.get().to_be_bytes().to_vec()),
                Attribute::Value(psk.as_bytes().to_vec()),
                Attribute::Application(AVAILABLE_MARK.to_vec()),
            ];
            session
                .create_object(&template)
                .map_err(|e| pkcs11_err("create_object", e))?;
        }
        *keys = remaining;
        Ok(())
    }

    fn get_key(&self, dest: &SiteId, id: KeyId) -> Result<Psk, BackingStoreError> {
        let session = self.session.lock().unwrap();
        let handle = Self::find_one(&session, dest, id)?
            .ok_or_else(|| BackingStoreError::NotFound(id.to_string()))?;
        Self::handle_value(&session, handle)
    }

    fn find_key(&self, dest: &SiteId, id: KeyId) -> Result<(KeyId, Psk), BackingStoreError> {
        let session = self.session.lock().unwrap();
        if id.get() != 0 {
            let handle = Self::find_one(&session, dest, id)?
                .ok_or_else(|| BackingStoreError::NotFound(id.to_string()))?;
            return Ok((id, Self::handle_value(&session, handle)?));
        }
        let mut best: Option<(KeyId, ObjectHandle)> = None;
        for handle in Self::find_all(&session, dest)? {
            if Self::is_reserved(&session, handle)? {
                continue;
            }
            let candidate_id = Self::handle_id(&session, handle)?;
            let replace = match &best {
                None => true,
                Some((best_id, _)) => candidate_id < *best_id,
            };
            if replace {
                best = Some((candidate_id, handle));
            }
        }
        let (found_id, handle) = best.ok_or_else(|| BackingStoreError::Unavailable(dest.to_string()))?;
        Ok((found_id, Self::handle_value(&session, handle)?))
    }

    fn key_exists(&self, dest: &SiteId, id: KeyId) -> Result<bool, BackingStoreError> {
        let session = self.session.lock().unwrap();
        Ok(Self::find_one(&session, dest, id)?.is_some())
    }

    fn reserve_key(&self, dest: &SiteId) -> Result<KeyId, BackingStoreError> {
        let session = self.session.lock().unwrap();
        for handle in Self::find_all(&session, dest)? {
            if Self::is_reserved(&session, handle)? {
                continue;
            }
            let id = Self::handle_id(&session, handle)?;
            session
                .update_attributes(handle, &[Attribute::Application(RESERVED_MARK.to_vec())])
                .map_err(|e| pkcs11_err("update_attributes", e))?;
            return Ok(id);
        }
        Err(BackingStoreError::Unavailable(dest.to_string()))
    }

    fn remove_key(&self, dest: &SiteId, id: KeyId) -> Result<Psk, BackingStoreError> {
        let session = self.session.lock().unwrap();
        let handle = Self::find_one(&session, dest, id)?
            .ok_or_else(|| BackingStoreError::NotFound(id.to_string()))?;
        let value = Self::handle_value(&session, handle)?;
        session
            .destroy_object(handle)
            .map_err(|e| pkcs11_err("destroy_object", e))?;
        Ok(value)
    }

    fn remove_keys(&self, dest: &SiteId, ids: &[KeyId]) -> Result<Vec<Psk>, BackingStoreError> {
        let session = self.session.lock().unwrap();
        let mut handles = Vec::with_capacity(ids.len());
        let mut values = Vec::with_capacity(ids.len());
        for id in ids {
            let handle = Self::find_one(&session, dest, *id)?
                .ok_or_else(|| BackingStoreError::NotFound(id.to_string()))?;
            values.push(Self::handle_value(&session, handle)?);
            handles.push(handle);
        }
        for handle in handles {
            session
                .destroy_object(handle)
                .map_err(|e| pkcs11_err("destroy_object", e))?;
        }
        Ok(values)
    }

    fn get_counts(&self, dest: &SiteId) -> Result<KeyCounts, BackingStoreError> {
        let session = self.session.lock().unwrap();
        let mut available = 0u64;
        for handle in Self::find_all(&session, dest)? {
            if !Self::is_reserved(&session, handle)? {
                available += 1;
            }
        }
        Ok(KeyCounts {
            available,
            capacity_remaining: None,
        })
    }

    fn get_next_key_id(&self, dest: &SiteId) -> Result<KeyId, BackingStoreError> {
        let session = self.session.lock().unwrap();
        let mut max_seen = 0u64;
        for handle in Self::find_all(&session, dest)? {
            let id = Self::handle_id(&session, handle)?;
            max_seen = max_seen.max(id.get());
        }
        Ok(KeyId::new(max_seen + 1))
    }
}
