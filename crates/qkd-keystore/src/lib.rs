//! Per-peer PSK cache, publication to local consumers, and multi-hop XOR
//! key combination across a chain of trusted-node relays (spec §4.3).

mod error;
mod factory;
mod keystore;

pub use error::KeyStoreError;
pub use factory::{KeyPeer, KeyStoreFactory};
pub use keystore::{KeyPublisherSink, KeyStore, DEFAULT_CACHE_LIMIT};
