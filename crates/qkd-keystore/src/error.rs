use thiserror::Error;

use qkd_backing_store::BackingStoreError;
use qkd_types::QkdError;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("no key available for site {0}")]
    NoKeyAvailable(String),
    #[error("key {0} is already marked in use")]
    AlreadyInUse(String),
    #[error("key {0} not found")]
    NotFound(String),
    #[error(transparent)]
    BackingStore(#[from] BackingStoreError),
    #[error("peer error: {0}")]
    Peer(String),
}

impl From<KeyStoreError> for QkdError {
    fn from(err: KeyStoreError) -> Self {
        match err {
            KeyStoreError::NoKeyAvailable(msg) => QkdError::unavailable(msg),
            KeyStoreError::AlreadyInUse(msg) => QkdError::conflict(msg),
            KeyStoreError::NotFound(msg) => QkdError::not_found(msg),
            KeyStoreError::BackingStore(inner) => inner.into(),
            KeyStoreError::Peer(msg) => QkdError::transport(msg),
        }
    }
}
