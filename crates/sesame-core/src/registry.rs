//! Caller-owned device registry
//!
//! Maps [`DeviceIdentity`] to whatever the caller keeps per device (usually a
//! [`SesameDevice`](crate::client::SesameDevice)). Scan results are routed through
//! [`DeviceRegistry::observe`], which drops payloads that are not Sesame
//! advertisements.

use hashbrown::HashMap;
use tracing::debug;

use crate::advertisement::{Advertisement, RawAdvertisement};
use crate::types::{BleAddress, DeviceIdentity};

/// Explicit set of known devices
#[derive(Debug)]
pub struct DeviceRegistry<D> {
    devices: HashMap<DeviceIdentity, D>,
}

impl<D> Default for DeviceRegistry<D> {
    fn default() -> Self {
        Self {
            devices: HashMap::new(),
        }
    }
}

impl<D> DeviceRegistry<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device, returning the one it replaces
    pub fn insert(&mut self, identity: DeviceIdentity, device: D) -> Option<D> {
        self.devices.insert(identity, device)
    }

    pub fn remove(&mut self, identity: &DeviceIdentity) -> Option<D> {
        self.devices.remove(identity)
    }

    pub fn get(&self, identity: &DeviceIdentity) -> Option<&D> {
        self.devices.get(identity)
    }

    pub fn get_mut(&mut self, identity: &DeviceIdentity) -> Option<&mut D> {
        self.devices.get_mut(identity)
    }

    pub fn contains(&self, identity: &DeviceIdentity) -> bool {
        self.devices.contains_key(identity)
    }

    /// Look a device up by link address alone
    pub fn find_by_address(&self, address: &BleAddress) -> Option<(&DeviceIdentity, &D)> {
        self.devices
            .iter()
            .find(|(identity, _)| identity.address == *address)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceIdentity, &D)> {
        self.devices.iter()
    }

    /// Parse a scan result; malformed payloads are dropped
    pub fn observe(&self, raw: &RawAdvertisement) -> Option<Advertisement> {
        match raw.parse() {
            Ok(advertisement) => Some(advertisement),
            Err(e) => {
                debug!("Dropping advertisement from {}: {}", raw.address, e);
                None
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::AdvertisedLockState;

    fn create_test_raw(address: BleAddress, data: Vec<u8>) -> RawAdvertisement {
        RawAdvertisement {
            address,
            local_name: None,
            manufacturer_data: data,
            rssi: None,
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut registry = DeviceRegistry::new();
        let address = BleAddress::new([1, 2, 3, 4, 5, 6]);
        let identity = DeviceIdentity::new(address);

        assert!(registry.insert(identity, "front door").is_none());
        assert_eq!(registry.insert(identity, "back door"), Some("front door"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find_by_address(&address).map(|(_, d)| *d), Some("back door"));

        *registry.get_mut(&identity).unwrap() = "garage";
        assert_eq!(registry.get(&identity), Some(&"garage"));
        assert_eq!(registry.remove(&identity), Some("garage"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_observe_drops_malformed() {
        let registry: DeviceRegistry<()> = DeviceRegistry::new();
        let address = BleAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

        assert!(registry
            .observe(&create_test_raw(address, vec![0xA1, 0x00]))
            .is_none());

        let mut data = vec![0xA1, 0x00];
        data.extend_from_slice(address.as_bytes());
        data.push(0x01);
        let advertisement = registry.observe(&create_test_raw(address, data)).unwrap();
        assert_eq!(advertisement.identity.address, address);
        assert_eq!(advertisement.lock_state, AdvertisedLockState::Locked);
    }
}
