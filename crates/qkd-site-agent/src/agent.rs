//! The site agent itself (spec §4.4): owns this site's devices, drives hop
//! setup across a physical path, and fans out link status to subscribers.
//!
//! Grounded in `KeyManagement/Sites/SiteAgent.h`: `otherSites`/`SiteState`
//! becomes `link_states`, `StartLeftSide`/`StartRightSide`/`PrepHop` become
//! `start_node`/`prep_hop`, and the status callback map keyed by an
//! incrementing counter becomes a map of per-subscriber `mpsc::Sender`s —
//! each subscriber gets its own FIFO rather than one callback list iterated
//! under a single lock.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use qkd_keystore::KeyStoreFactory;
use qkd_types::{PhysicalPath, SiteId};

use crate::device::DeviceFactory;
use crate::error::SiteAgentError;
use crate::session::SessionController;
use crate::types::{LinkState, LinkStatusUpdate, SiteDetails};

/// How this site reaches the far side of a hop to ready its device before
/// this side starts its own. No concrete transport is implied — a binary
/// wires this trait up to whatever RPC client it uses.
pub trait SiteAgentPeer: Send + Sync {
    fn prep_hop(&self, site: &SiteId, device_id: &str, origin: &SiteId) -> Result<String, SiteAgentError>;
}

pub trait SiteAgentApi {
    /// Readies a local device for an incoming hop from `origin`, returning
    /// an address the initiator can use to reach this side's session.
    fn prep_hop(&self, device_id: &str, origin: &SiteId) -> Result<String, SiteAgentError>;
    /// Starts every hop in `path` whose near side is this site.
    fn start_node(&self, path: &PhysicalPath) -> Result<(), SiteAgentError>;
    /// Tears down every hop in `path` that touches this site.
    fn end_key_exchange(&self, path: &PhysicalPath) -> Result<(), SiteAgentError>;
}

pub trait SiteDetailsApi {
    fn get_site_details(&self) -> SiteDetails;
    fn subscribe_link_status(&self) -> mpsc::Receiver<LinkStatusUpdate>;
}

pub struct SiteAgent {
    site: SiteId,
    device_ids: Vec<String>,
    device_factory: Arc<DeviceFactory>,
    keystore_factory: Arc<KeyStoreFactory>,
    peer: Arc<dyn SiteAgentPeer>,
    sessions: Mutex<HashMap<String, Box<dyn SessionController>>>,
    link_states: Mutex<HashMap<SiteId, LinkState>>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<LinkStatusUpdate>>>,
    next_subscriber_id: Mutex<u64>,
}

impl SiteAgent {
    pub fn new(
        site: SiteId,
        device_ids: Vec<String>,
        device_factory: Arc<DeviceFactory>,
        keystore_factory: Arc<KeyStoreFactory>,
        peer: Arc<dyn SiteAgentPeer>,
    ) -> Self {
        keystore_factory.set_site_address(site.clone());
        Self {
            site,
            device_ids,
            device_factory,
            keystore_factory,
            peer,
            sessions: Mutex::new(HashMap::new()),
            link_states: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: Mutex::new(0),
        }
    }

    pub fn keystore_factory(&self) -> &Arc<KeyStoreFactory> {
        &self.keystore_factory
    }

    pub fn address_is_this_site(&self, address: &SiteId) -> bool {
        *address == self.site
    }

    fn send_status_update(&self, destination: SiteId, state: LinkState, message: Option<String>) {
        self.link_states.lock().unwrap().insert(destination.clone(), state);
        let update = LinkStatusUpdate {
            destination,
            state,
            message,
        };
        self.subscribers
            .lock()
            .unwrap()
            .retain(|_, sender| sender.send(update.clone()).is_ok());
    }

    fn start_hop_as_initiator(&self, first_device_id: &str, remote_site: &SiteId, remote_device_id: &str) -> Result<(), SiteAgentError> {
        self.send_status_update(remote_site.clone(), LinkState::Connecting, None);

        let remote_session_address = match self.peer.prep_hop(remote_site, remote_device_id, &self.site) {
            Ok(addr) => addr,
            Err(e) => {
                self.send_status_update(remote_site.clone(), LinkState::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        let device = match self.device_factory.claim_device(first_device_id) {
            Ok(device) => device,
            Err(e) => {
                self.send_status_update(remote_site.clone(), LinkState::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        let mut controller = device.create_session_controller();
        match controller.start_as_initiator(&remote_session_address) {
            Ok(()) => {
                self.sessions.lock().unwrap().insert(first_device_id.to_owned(), controller);
                self.send_status_update(remote_site.clone(), LinkState::Connected, None);
                Ok(())
            }
            Err(e) => {
                self.device_factory.release_device(first_device_id);
                self.send_status_update(remote_site.clone(), LinkState::Error, Some(e.to_string()));
                Err(SiteAgentError::SessionFailed(e.to_string()))
            }
        }
    }
}

impl SiteAgentApi for SiteAgent {
    fn prep_hop(&self, device_id: &str, origin: &SiteId) -> Result<String, SiteAgentError> {
        let device = self.device_factory.claim_device(device_id)?;
        self.send_status_update(origin.clone(), LinkState::Connecting, None);
        let mut controller = device.create_session_controller();
        match controller.start_as_responder() {
            Ok(session_address) => {
                self.sessions.lock().unwrap().insert(device_id.to_owned(), controller);
                self.send_status_update(origin.clone(), LinkState::Connected, None);
                Ok(session_address)
            }
            Err(e) => {
                self.device_factory.release_device(device_id);
                self.send_status_update(origin.clone(), LinkState::Error, Some(e.to_string()));
                Err(SiteAgentError::SessionFailed(e.to_string()))
            }
        }
    }

    fn start_node(&self, path: &PhysicalPath) -> Result<(), SiteAgentError> {
        for hop in path {
            let first = hop.first.as_ref().ok_or(SiteAgentError::IncompleteHop)?;
            if first.site != self.site {
                continue;
            }
            let second = hop.second.as_ref().ok_or(SiteAgentError::IncompleteHop)?;
            self.start_hop_as_initiator(&first.device_id, &second.site, &second.device_id)?;
        }
        Ok(())
    }

    fn end_key_exchange(&self, path: &PhysicalPath) -> Result<(), SiteAgentError> {
        for hop in path {
            for endpoint in [hop.first.as_ref(), hop.second.as_ref()].into_iter().flatten() {
                if endpoint.site != self.site {
                    continue;
                }
                if let Some(mut controller) = self.sessions.lock().unwrap().remove(&endpoint.device_id) {
                    let _ = controller.stop();
                }
                self.device_factory.release_device(&endpoint.device_id);
                self.send_status_update(endpoint.site.clone(), LinkState::Inactive, None);
            }
        }
        Ok(())
    }
}

impl SiteDetailsApi for SiteAgent {
    fn get_site_details(&self) -> SiteDetails {
        SiteDetails {
            site: self.site.clone(),
            device_ids: self.device_ids.clone(),
        }
    }

    fn subscribe_link_status(&self) -> mpsc::Receiver<LinkStatusUpdate> {
        let (tx, rx) = mpsc::channel();
        let mut next_id = self.next_subscriber_id.lock().unwrap();
        self.subscribers.lock().unwrap().insert(*next_id, tx);
        *next_id += 1;
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::QkdDevice;
    use crate::session::SessionError;
    use qkd_backing_store::SqliteBackingStore;
    use std::sync::Mutex as StdMutex;

    struct FakeController;
    impl SessionController for FakeController {
        fn start_as_initiator(&mut self, _remote_session_address: &str) -> Result<(), SessionError> {
            Ok(())
        }
        fn start_as_responder(&mut self) -> Result<String, SessionError> {
            Ok("responder-addr".into())
        }
        fn stop(&mut self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    struct FakeDevice(&'static str);
    impl QkdDevice for FakeDevice {
        fn device_id(&self) -> &str {
            self.0
        }
        fn create_session_controller(&self) -> Box<dyn SessionController> {
            Box::new(FakeController)
        }
    }

    struct FakePeer {
        addr: String,
    }
    impl SiteAgentPeer for FakePeer {
        fn prep_hop(&self, _site: &SiteId, _device_id: &str, _origin: &SiteId) -> Result<String, SiteAgentError> {
            Ok(self.addr.clone())
        }
    }

    fn agent() -> SiteAgent {
        let site = SiteId::parse("tcp://site-a:7000").unwrap();
        let devices = Arc::new(DeviceFactory::new());
        devices.register_device(Arc::new(FakeDevice("dev-0")));
        let backing = Arc::new(SqliteBackingStore::open_in_memory().unwrap());
        let keystores = Arc::new(KeyStoreFactory::new(backing));
        let peer = Arc::new(FakePeer { addr: "site-b-session".into() });
        SiteAgent::new(site, vec!["dev-0".into()], devices, keystores, peer)
    }

    #[test]
    fn start_node_only_acts_on_hops_owned_by_this_site() {
        let agent = agent();
        let site_a = SiteId::parse("tcp://site-a:7000").unwrap();
        let site_b = SiteId::parse("tcp://site-b:7000").unwrap();
        let path: PhysicalPath = vec![qkd_types::HopPair::new(
            qkd_types::Endpoint::new(site_a, "dev-0"),
            qkd_types::Endpoint::new(site_b.clone(), "dev-1"),
        )];
        agent.start_node(&path).unwrap();
        assert_eq!(*agent.link_states.lock().unwrap().get(&site_b).unwrap(), LinkState::Connected);
    }

    #[test]
    fn link_status_updates_arrive_in_order_per_subscriber() {
        let agent = agent();
        let rx = agent.subscribe_link_status();
        let site_a = SiteId::parse("tcp://site-a:7000").unwrap();
        let site_b = SiteId::parse("tcp://site-b:7000").unwrap();
        let path: PhysicalPath = vec![qkd_types::HopPair::new(
            qkd_types::Endpoint::new(site_a, "dev-0"),
            qkd_types::Endpoint::new(site_b, "dev-1"),
        )];
        agent.start_node(&path).unwrap();

        let first = rx.recv().unwrap();
        assert_eq!(first.state, LinkState::Connecting);
        let second = rx.recv().unwrap();
        assert_eq!(second.state, LinkState::Connected);
    }

    #[test]
    fn address_is_this_site_matches_own_address() {
        let agent = agent();
        assert!(agent.address_is_this_site(&SiteId::parse("tcp://site-a:7000").unwrap()));
        assert!(!agent.address_is_this_site(&SiteId::parse("tcp://site-z:7000").unwrap()));
    }

    #[test]
    fn unused_import_guard() {
        let _ = StdMutex::new(0);
    }
}
