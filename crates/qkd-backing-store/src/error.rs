use thiserror::Error;

use qkd_types::QkdError;

#[derive(Debug, Error)]
pub enum BackingStoreError {
    #[error("key {0} not found in backing store")]
    NotFound(String),
    #[error("key {0} already present in backing store")]
    Conflict(String),
    /// No `Available` key to reserve, or a fixed-capacity backend is full.
    #[error("no key available: {0}")]
    Unavailable(String),
    /// Stored bytes failed to decode as a valid PSK — truncation or
    /// corruption in the backend, never a caller-input error.
    #[error("stored key material is invalid: {0}")]
    Integrity(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("pkcs#11 error: {0}")]
    Pkcs11(String),
    #[error("yubihsm error: {0}")]
    YubiHsm(String),
    #[error("invalid backing store url: {0}")]
    InvalidUrl(String),
}

impl From<BackingStoreError> for QkdError {
    fn from(err: BackingStoreError) -> Self {
        match err {
            BackingStoreError::NotFound(msg) => QkdError::not_found(msg),
            BackingStoreError::Conflict(msg) => QkdError::conflict(msg),
            BackingStoreError::Unavailable(msg) => QkdError::unavailable(msg),
            BackingStoreError::Integrity(msg) => QkdError::integrity(msg),
            BackingStoreError::InvalidUrl(msg) => QkdError::invalid_parameters(msg),
            other => QkdError::fatal(other.to_string()),
        }
    }
}
