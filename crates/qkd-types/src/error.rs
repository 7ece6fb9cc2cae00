//! Shared error taxonomy (spec §7) returned at every component boundary.
//!
//! Lower-level crates define their own scoped error enums and convert into
//! this one at the point they cross into a caller-facing operation, the same
//! way the teacher's service crates wrap `NetworkingError`/`CryptoError` into
//! a single `ServiceError` with `#[error(transparent)]`.

use thiserror::Error;

/// Error taxonomy shared by every RPC-facing operation in the workspace.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QkdError {
    /// Bad configuration values: numeric zero where positive required,
    /// out-of-range ratios.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    /// Key id absent, peer unknown, device id unregistered.
    #[error("not found: {0}")]
    NotFound(String),
    /// No keys currently available, peer unreachable, device in use.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Duplicate key id on store, device already owned.
    #[error("conflict: {0}")]
    Conflict(String),
    /// RPC/network failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// CRC mismatch, corrupt frame.
    #[error("integrity error: {0}")]
    Integrity(String),
    /// Backing store unrecoverable I/O; process should terminate.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl QkdError {
    pub fn invalid_parameters(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}
