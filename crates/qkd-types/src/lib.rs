//! Shared data model and error taxonomy for the QKD site agent workspace.
//!
//! Every other crate in this workspace depends on `qkd-types` for its core
//! vocabulary, the way `pqcnet-contracts` depends on its own shared types
//! crate: one place to define `Qubit`, `Psk`, id newtypes, and `QkdError`
//! rather than each crate growing its own incompatible copies.

mod detection;
mod error;
mod ids;
mod path;
mod psk;
mod qubit;
mod site;

pub use detection::{DetectionReport, QubitByIndex};
pub use error::QkdError;
pub use ids::{BinId, KeyId, SlotId};
pub use path::{Endpoint, HopPair, PhysicalPath};
pub use psk::{Psk, VALID_PSK_LENGTHS};
pub use qubit::{Basis, Qubit};
pub use site::SiteId;
