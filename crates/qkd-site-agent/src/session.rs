//! A device's session lifecycle once a hop has a device assigned to it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session already active")]
    AlreadyActive,
    #[error("session controller failure: {0}")]
    Failed(String),
}

/// Drives one hop's device through connection to the peer and key
/// generation. The site initiating the hop calls `start_as_initiator` with
/// the responder's session address; the responding site calls
/// `start_as_responder` and returns its own address for the initiator to
/// dial.
pub trait SessionController: Send {
    fn start_as_initiator(&mut self, remote_session_address: &str) -> Result<(), SessionError>;
    fn start_as_responder(&mut self) -> Result<String, SessionError>;
    fn stop(&mut self) -> Result<(), SessionError>;
}
