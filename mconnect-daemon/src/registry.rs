//! Devices seen on the network

use mconnect_protocol::Discovery;
use std::collections::HashMap;
use tracing::{debug, info};

/// Devices discovered so far, keyed by device id
#[derive(Debug)]
pub struct DeviceRegistry {
    /// Our own id, our announcements echo back on the broadcast address
    own_id: String,

    devices: HashMap<String, Discovery>,
}

impl DeviceRegistry {
    pub fn new(own_id: impl Into<String>) -> Self {
        Self {
            own_id: own_id.into(),
            devices: HashMap::new(),
        }
    }

    /// Record a discovery, returns `true` the first time a device is seen
    ///
    /// Repeated announcements of a known device keep the first entry.
    pub fn record(&mut self, discovery: Discovery) -> bool {
        let device_id = &discovery.identity.device_id;

        if *device_id == self.own_id {
            return false;
        }
        if self.devices.contains_key(device_id) {
            debug!("Device {} announced again from {}", device_id, discovery.from);
            return false;
        }

        info!(
            "New device: {} ({}) type={} at {}",
            discovery.identity.device_name,
            device_id,
            discovery.identity.device_type,
            discovery.from
        );
        self.devices.insert(device_id.clone(), discovery);
        true
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Discovery> {
        self.devices.values()
    }
}
