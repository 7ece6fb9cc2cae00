use thiserror::Error;

use qkd_types::QkdError;

#[derive(Debug, Error)]
pub enum GatingError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error(transparent)]
    Peer(#[from] QkdError),
}

impl From<GatingError> for QkdError {
    fn from(err: GatingError) -> Self {
        match err {
            GatingError::InvalidParameters(msg) => QkdError::invalid_parameters(msg),
            GatingError::Peer(inner) => inner,
        }
    }
}
