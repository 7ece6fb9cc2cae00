//! Device ownership (spec §4.4). Grounded in `DeviceFactory`/`IQKDDevice`
//! from the original's `SiteAgent.h`: one registry of known devices, a
//! subset of which are currently claimed for an active hop.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::SiteAgentError;
use crate::session::SessionController;

/// One QKD transmitter/receiver this site can offer for a hop.
pub trait QkdDevice: Send + Sync {
    fn device_id(&self) -> &str;
    fn create_session_controller(&self) -> Box<dyn SessionController>;
}

struct Registry {
    all_devices: HashMap<String, Arc<dyn QkdDevice>>,
    unused_devices: HashSet<String>,
}

/// Tracks which devices exist and which are currently idle. `all_devices`
/// and `unused_devices` live under one lock so a claim and a registration
/// can never interleave into an inconsistent view.
pub struct DeviceFactory {
    registry: Mutex<Registry>,
}

impl DeviceFactory {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                all_devices: HashMap::new(),
                unused_devices: HashSet::new(),
            }),
        }
    }

    pub fn register_device(&self, device: Arc<dyn QkdDevice>) {
        let mut registry = self.registry.lock().unwrap();
        let id = device.device_id().to_owned();
        registry.unused_devices.insert(id.clone());
        registry.all_devices.insert(id, device);
    }

    /// Claims a specific device for a hop, failing if it's already in use.
    pub fn claim_device(&self, device_id: &str) -> Result<Arc<dyn QkdDevice>, SiteAgentError> {
        let mut registry = self.registry.lock().unwrap();
        if !registry.all_devices.contains_key(device_id) {
            return Err(SiteAgentError::UnknownDevice(device_id.to_owned()));
        }
        if !registry.unused_devices.remove(device_id) {
            return Err(SiteAgentError::DeviceInUse(device_id.to_owned()));
        }
        Ok(registry.all_devices.get(device_id).unwrap().clone())
    }

    pub fn release_device(&self, device_id: &str) {
        let mut registry = self.registry.lock().unwrap();
        if registry.all_devices.contains_key(device_id) {
            registry.unused_devices.insert(device_id.to_owned());
        }
    }

    pub fn unused_device_count(&self) -> usize {
        self.registry.lock().unwrap().unused_devices.len()
    }
}

impl Default for DeviceFactory {
    fn default() -> Self {
        Self::new()
    }
}
