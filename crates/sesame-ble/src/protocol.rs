//! BLE protocol constants and utilities for Sesame devices

use std::collections::HashMap;

use btleplug::api::BDAddr;
use sesame_core::BleAddress;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Sesame BLE service UUID, advertised by every device
pub const SESAME_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FD81_0000_1000_8000_00805F9B34FB);

/// Characteristic the host writes frames to
pub const SESAME_TX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x16860002_A5AE_9856_B6D3_DBB4C676993E);

/// Characteristic the device notifies frames on
pub const SESAME_RX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x16860003_A5AE_9856_B6D3_DBB4C676993E);

/// Bluetooth SIG company identifier of CANDY HOUSE
pub const CANDY_HOUSE_COMPANY_ID: u16 = 0x055A;

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Convert a platform address into the core address type
pub fn to_ble_address(address: BDAddr) -> BleAddress {
    BleAddress::new(address.into_inner())
}

/// Sesame manufacturer payload from an advertisement's manufacturer data map
pub fn sesame_manufacturer_data(manufacturer_data: &HashMap<u16, Vec<u8>>) -> Option<&[u8]> {
    manufacturer_data
        .get(&CANDY_HOUSE_COMPANY_ID)
        .map(Vec::as_slice)
}
