//! Advertisement parsing
//!
//! Manufacturer data layout (9 bytes):
//!
//! | offset | size | field                         |
//! |--------|------|-------------------------------|
//! | 0      | 1    | `0xA1` vendor tag             |
//! | 1      | 1    | product tag                   |
//! | 2      | 6    | device hardware address       |
//! | 8      | 1    | status flags                  |
//!
//! Status flags: `0x01` locked, `0x02` unlocked, `0x04` battery critical,
//! `0x40` setup required.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{BleAddress, DeviceIdentity, ProductModel};
use crate::{Result, SesameError};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Leading byte of every Sesame manufacturer payload
pub const ADVERTISEMENT_TAG: u8 = 0xA1;
/// Exact manufacturer payload length
pub const ADVERTISEMENT_LEN: usize = 9;

const FLAG_LOCKED: u8 = 0x01;
const FLAG_UNLOCKED: u8 = 0x02;
const FLAG_BATTERY_CRITICAL: u8 = 0x04;
const FLAG_SETUP_REQUIRED: u8 = 0x40;

/// Prefix of the UUID a WiFi module derives from its hardware address
const WIFI_MODULE_UUID_PREFIX: [u8; 10] = [0x00, 0x00, 0x00, 0x00, 0x05, 0x5a, 0xfd, 0x81, 0x00, 0x01];

// ----------------------------------------------------------------------------
// Types
// ----------------------------------------------------------------------------

/// Raw scan result handed over by a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAdvertisement {
    pub address: BleAddress,
    pub local_name: Option<String>,
    pub manufacturer_data: Vec<u8>,
    pub rssi: Option<i16>,
}

/// Coarse lock state advertised without a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdvertisedLockState {
    Locked,
    Unlocked,
    Unknown,
}

/// Decoded status byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementFlags {
    pub locked: bool,
    pub unlocked: bool,
    pub battery_critical: bool,
    pub setup_required: bool,
}

impl AdvertisementFlags {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            locked: byte & FLAG_LOCKED != 0,
            unlocked: byte & FLAG_UNLOCKED != 0,
            battery_critical: byte & FLAG_BATTERY_CRITICAL != 0,
            setup_required: byte & FLAG_SETUP_REQUIRED != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut byte = 0;
        if self.locked {
            byte |= FLAG_LOCKED;
        }
        if self.unlocked {
            byte |= FLAG_UNLOCKED;
        }
        if self.battery_critical {
            byte |= FLAG_BATTERY_CRITICAL;
        }
        if self.setup_required {
            byte |= FLAG_SETUP_REQUIRED;
        }
        byte
    }

    pub fn lock_state(&self) -> AdvertisedLockState {
        match (self.locked, self.unlocked) {
            (true, false) => AdvertisedLockState::Locked,
            (false, true) => AdvertisedLockState::Unlocked,
            _ => AdvertisedLockState::Unknown,
        }
    }
}

/// Parsed advertisement snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub identity: DeviceIdentity,
    pub product: ProductModel,
    /// Hardware address embedded in the payload
    pub hardware_address: BleAddress,
    pub flags: AdvertisementFlags,
    pub lock_state: AdvertisedLockState,
    pub rssi: Option<i16>,
}

impl Advertisement {
    /// Whether vendor setup has been completed
    pub fn is_registered(&self) -> bool {
        !self.flags.setup_required
    }
}

// ----------------------------------------------------------------------------
// Parsing
// ----------------------------------------------------------------------------

/// Decode manufacturer data seen from `address`
pub fn parse_advertisement(address: BleAddress, data: &[u8]) -> Result<Advertisement> {
    if data.len() != ADVERTISEMENT_LEN {
        return Err(SesameError::malformed_advertisement(format!(
            "expected {} bytes, got {}",
            ADVERTISEMENT_LEN,
            data.len()
        )));
    }
    if data[0] != ADVERTISEMENT_TAG {
        return Err(SesameError::malformed_advertisement(format!(
            "unexpected tag {:#04x}",
            data[0]
        )));
    }
    let product = ProductModel::from_tag(data[1]).ok_or_else(|| {
        SesameError::malformed_advertisement(format!("unknown product tag {:#04x}", data[1]))
    })?;

    let mut hardware = [0u8; 6];
    hardware.copy_from_slice(&data[2..8]);
    let hardware_address = BleAddress::new(hardware);
    let flags = AdvertisementFlags::from_byte(data[8]);

    let identity = match product {
        ProductModel::WifiModule2 => {
            DeviceIdentity::with_device_id(address, wifi_module_uuid(&hardware_address))
        }
        _ => DeviceIdentity::new(address),
    };

    Ok(Advertisement {
        identity,
        product,
        hardware_address,
        flags,
        lock_state: flags.lock_state(),
        rssi: None,
    })
}

impl RawAdvertisement {
    /// Decode the scan result, recovering the device UUID from the local name
    pub fn parse(&self) -> Result<Advertisement> {
        let mut advertisement = parse_advertisement(self.address, &self.manufacturer_data)?;
        advertisement.rssi = self.rssi;
        if advertisement.identity.device_id.is_none() {
            advertisement.identity.device_id =
                self.local_name.as_deref().and_then(device_uuid_from_name);
        }
        Ok(advertisement)
    }
}

/// Devices advertise their UUID as unpadded base64 in the local name
pub fn device_uuid_from_name(name: &str) -> Option<Uuid> {
    let bytes = STANDARD_NO_PAD.decode(name.trim().trim_end_matches('=')).ok()?;
    Uuid::from_slice(&bytes).ok()
}

fn wifi_module_uuid(hardware_address: &BleAddress) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[..10].copy_from_slice(&WIFI_MODULE_UUID_PREFIX);
    bytes[10..].copy_from_slice(hardware_address.as_bytes());
    Uuid::from_bytes(bytes)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_address() -> BleAddress {
        BleAddress::new([0xC1, 0xA2, 0xB3, 0xC4, 0xD5, 0xE6])
    }

    fn create_test_payload(product: u8, status: u8) -> Vec<u8> {
        let mut data = vec![ADVERTISEMENT_TAG, product];
        data.extend_from_slice(create_test_address().as_bytes());
        data.push(status);
        data
    }

    #[test]
    fn test_locked_lock() {
        let address = create_test_address();
        let adv = parse_advertisement(address, &create_test_payload(0x00, 0x01)).unwrap();
        assert_eq!(adv.identity, DeviceIdentity::new(address));
        assert_eq!(adv.product, ProductModel::Sesame2);
        assert_eq!(adv.lock_state, AdvertisedLockState::Locked);
        assert_eq!(adv.hardware_address, address);
        assert!(adv.is_registered());
    }

    #[test]
    fn test_flag_combinations() {
        let address = create_test_address();
        let adv = parse_advertisement(address, &create_test_payload(0x02, 0x46)).unwrap();
        assert_eq!(adv.product, ProductModel::SesameBot);
        assert_eq!(adv.lock_state, AdvertisedLockState::Unlocked);
        assert!(adv.flags.battery_critical);
        assert!(!adv.is_registered());
        assert_eq!(adv.flags.to_byte(), 0x46);

        let both = parse_advertisement(address, &create_test_payload(0x00, 0x03)).unwrap();
        assert_eq!(both.lock_state, AdvertisedLockState::Unknown);
    }

    #[test]
    fn test_malformed_payloads() {
        let address = create_test_address();
        for data in [
            vec![0xA1, 0x00],
            vec![],
            {
                let mut d = create_test_payload(0x00, 0x01);
                d[0] = 0xA2;
                d
            },
            create_test_payload(0x09, 0x01),
            {
                let mut d = create_test_payload(0x00, 0x01);
                d.push(0);
                d
            },
        ] {
            assert!(matches!(
                parse_advertisement(address, &data),
                Err(SesameError::MalformedAdvertisement { .. })
            ));
        }
    }

    #[test]
    fn test_device_uuid_from_local_name() {
        let device_id = Uuid::from_u128(0x8a1b2c3d_4e5f_4a6b_8c7d_9e0f1a2b3c4d);
        let raw = RawAdvertisement {
            address: create_test_address(),
            local_name: Some(STANDARD_NO_PAD.encode(device_id.as_bytes())),
            manufacturer_data: create_test_payload(0x00, 0x02),
            rssi: Some(-60),
        };
        let adv = raw.parse().unwrap();
        assert_eq!(adv.identity.device_id, Some(device_id));
        assert_eq!(adv.rssi, Some(-60));

        assert_eq!(device_uuid_from_name("not base64!"), None);
        assert_eq!(device_uuid_from_name("AAAA"), None);
    }

    #[test]
    fn test_wifi_module_uuid() {
        let adv = parse_advertisement(create_test_address(), &create_test_payload(0x01, 0x00)).unwrap();
        assert_eq!(
            adv.identity.device_id.unwrap().to_string(),
            "00000000-055a-fd81-0001-c1a2b3c4d5e6"
        );
        assert_eq!(adv.product.device_kind(), None);
    }
}
