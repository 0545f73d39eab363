//! Bluetooth Low Energy transport for Sesame devices
//!
//! This crate provides a BLE transport that implements the `Transport` trait from
//! `sesame-core` on top of btleplug.
//!
//! ## Architecture
//!
//! - [`config`] - Transport configuration and settings
//! - [`error`] - Error types specific to BLE transport
//! - [`protocol`] - Sesame GATT identifiers and advertisement helpers
//! - [`transport`] - Main transport implementation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use sesame_ble::{BleTransport, BleTransportConfig};
//! use sesame_core::{DeviceRegistry, KeyMaterial, SesameDevice, SessionConfig, Transport};
//!
//! # async fn example(keys: KeyMaterial) -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(BleTransport::new(BleTransportConfig::new()).await?);
//! let registry: DeviceRegistry<()> = DeviceRegistry::new();
//!
//! let mut scan = transport.scan().await?;
//! while let Some(raw) = scan.next().await {
//!     if let Some(advertisement) = registry.observe(&raw) {
//!         let device = SesameDevice::from_advertisement(
//!             Arc::clone(&transport),
//!             keys,
//!             &advertisement,
//!             SessionConfig::default(),
//!         )?;
//!         device.connect().await?;
//!         device.unlock().await?;
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

// Public API exports
pub use config::BleTransportConfig;
pub use error::BleTransportError;
pub use protocol::{
    CANDY_HOUSE_COMPANY_ID, SESAME_RX_CHARACTERISTIC_UUID, SESAME_SERVICE_UUID,
    SESAME_TX_CHARACTERISTIC_UUID,
};
pub use transport::{BleLink, BleTransport};

// Re-export Transport trait for convenience
pub use sesame_core::transport::Transport;
