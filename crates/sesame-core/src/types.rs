//! Core types for device identity and time

use core::fmt;
use core::ops::{Add, Sub};
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::SesameError;

// ----------------------------------------------------------------------------
// BLE Address
// ----------------------------------------------------------------------------

/// 6-byte link-layer address of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BleAddress([u8; 6]);

impl BleAddress {
    /// Create an address from raw bytes, most significant byte first
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for BleAddress {
    type Err = SesameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let raw = hex::decode(&cleaned)
            .map_err(|_| SesameError::config_error(format!("invalid address: {}", s)))?;
        let bytes: [u8; 6] = raw
            .as_slice()
            .try_into()
            .map_err(|_| SesameError::config_error(format!("address must be 6 bytes: {}", s)))?;
        Ok(Self(bytes))
    }
}

// ----------------------------------------------------------------------------
// Device Identity
// ----------------------------------------------------------------------------

/// Immutable identity of a device: link address plus vendor UUID when known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub address: BleAddress,
    pub device_id: Option<Uuid>,
}

impl DeviceIdentity {
    pub fn new(address: BleAddress) -> Self {
        Self {
            address,
            device_id: None,
        }
    }

    pub fn with_device_id(address: BleAddress, device_id: Uuid) -> Self {
        Self {
            address,
            device_id: Some(device_id),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device_id {
            Some(id) => write!(f, "{} ({})", self.address, id),
            None => write!(f, "{}", self.address),
        }
    }
}

// ----------------------------------------------------------------------------
// Product Model
// ----------------------------------------------------------------------------

/// Controllable device family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Rotating deadbolt actuator
    Lock,
    /// Push-button actuator
    Bot,
}

/// Product model advertised by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductModel {
    Sesame2,
    WifiModule2,
    SesameBot,
}

impl ProductModel {
    /// Decode the advertised product tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(ProductModel::Sesame2),
            0x01 => Some(ProductModel::WifiModule2),
            0x02 => Some(ProductModel::SesameBot),
            _ => None,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            ProductModel::Sesame2 => 0x00,
            ProductModel::WifiModule2 => 0x01,
            ProductModel::SesameBot => 0x02,
        }
    }

    /// Vendor model identifier
    pub fn model_name(&self) -> &'static str {
        match self {
            ProductModel::Sesame2 => "sesame_2",
            ProductModel::WifiModule2 => "wm_2",
            ProductModel::SesameBot => "ssmbot_1",
        }
    }

    /// Controllable kind, `None` for bridges
    pub fn device_kind(&self) -> Option<DeviceKind> {
        match self {
            ProductModel::Sesame2 => Some(DeviceKind::Lock),
            ProductModel::SesameBot => Some(DeviceKind::Bot),
            ProductModel::WifiModule2 => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(other))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get current wall-clock timestamp
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get milliseconds since Unix epoch
    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
