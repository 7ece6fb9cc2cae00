use thiserror::Error;

use qkd_keystore::KeyStoreError;
use qkd_types::QkdError;

#[derive(Debug, Error)]
pub enum SiteAgentError {
    #[error("device {0} is not registered")]
    UnknownDevice(String),
    #[error("device {0} is already in use")]
    DeviceInUse(String),
    #[error("hop is missing an endpoint for this site")]
    IncompleteHop,
    #[error("session controller failed: {0}")]
    SessionFailed(String),
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
}

impl From<SiteAgentError> for QkdError {
    fn from(err: SiteAgentError) -> Self {
        match err {
            SiteAgentError::UnknownDevice(msg) => QkdError::not_found(msg),
            SiteAgentError::DeviceInUse(msg) => QkdError::conflict(msg),
            SiteAgentError::IncompleteHop => QkdError::invalid_parameters("hop is missing an endpoint"),
            SiteAgentError::SessionFailed(msg) => QkdError::transport(msg),
            SiteAgentError::KeyStore(inner) => inner.into(),
        }
    }
}
