//! Picks a backing store implementation from a URL (spec §4.2, §6):
//! `sqlite:///var/lib/qkd/site-a.db`, a `pkcs11:` token locator, or
//! `yubihsm2://host:port?auth-key-id=1&password=...`.

use qkd_uri::{Pkcs11Url, Uri};
use yubihsm::{Connector, Credentials, UsbConfig};

use crate::error::BackingStoreError;
use crate::pkcs11::Pkcs11BackingStore;
use crate::sqlite::SqliteBackingStore;
use crate::yubihsm_store::YubiHsm2BackingStore;
use crate::BackingStore;

pub struct BackingStoreFactory;

impl BackingStoreFactory {
    pub fn from_url(url: &str) -> Result<Box<dyn BackingStore>, BackingStoreError> {
        let uri = Uri::parse(url).map_err(|e| BackingStoreError::InvalidUrl(e.to_string()))?;
        match uri.scheme.as_deref() {
            Some("sqlite") => {
                let path = uri.host_and_port().map(|hp| format!("{hp}{}", uri.path)).unwrap_or(uri.path.clone());
                Ok(Box::new(SqliteBackingStore::open(path)?))
            }
            Some("pkcs11") => {
                let pkcs11_url =
                    Pkcs11Url::parse(url).map_err(|e| BackingStoreError::InvalidUrl(e.to_string()))?;
                let module_path = pkcs11_url
                    .module_path
                    .clone()
                    .unwrap_or_else(|| pkcs11_url.module_name.clone());
                Ok(Box::new(Pkcs11BackingStore::open(&module_path, &pkcs11_url)?))
            }
            Some("yubihsm2") => {
                let auth_key_id: u16 = uri
                    .first_query_param("auth-key-id")
                    .ok_or_else(|| BackingStoreError::InvalidUrl("yubihsm2 url requires auth-key-id".into()))?
                    .parse()
                    .map_err(|_| BackingStoreError::InvalidUrl("auth-key-id must be a u16".into()))?;
                let password = uri
                    .first_query_param("password")
                    .ok_or_else(|| BackingStoreError::InvalidUrl("yubihsm2 url requires password".into()))?;
                let credentials = Credentials::from_password(auth_key_id, password.as_bytes());

                let connector = match uri.host.as_deref() {
                    Some("usb") | None => Connector::usb(&UsbConfig::default()),
                    Some(host) => {
                        let port = uri.port.unwrap_or(12345);
                        Connector::http(&yubihsm::connector::HttpConfig {
                            addr: host.to_owned(),
                            port,
                            timeout_ms: 5_000,
                        })
                    }
                };

                Ok(Box::new(YubiHsm2BackingStore::open(connector, credentials)?))
            }
            other => Err(BackingStoreError::InvalidUrl(format!(
                "unsupported backing store scheme: {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_scheme() {
        let err = BackingStoreFactory::from_url("redis://localhost:6379").unwrap_err();
        assert!(matches!(err, BackingStoreError::InvalidUrl(_)));
    }

    #[test]
    fn opens_sqlite_from_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site-a.db");
        let url = format!("sqlite://{}", path.display());
        let store = BackingStoreFactory::from_url(&url).unwrap();
        let dest = qkd_types::SiteId::parse("tcp://site-b:7000").unwrap();
        assert_eq!(store.get_counts(&dest).unwrap().available, 0);
    }
}
