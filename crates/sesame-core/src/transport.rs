//! Transport abstraction
//!
//! The engine consumes a GATT-style link through this trait: scanning yields raw
//! advertisements, a connected link accepts frame writes and produces a stream of
//! notified frames. BLE and in-memory implementations live in their own crates.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::advertisement::RawAdvertisement;
use crate::types::BleAddress;
use crate::Result;

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Link-layer capability consumed by [`SesameDevice`](crate::client::SesameDevice)
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Handle to one connected device
    type Link: Clone + Send + Sync + 'static;

    /// Stream advertisements from nearby devices
    async fn scan(&self) -> Result<BoxStream<'static, RawAdvertisement>>;

    /// Open a link to the device at `address`
    async fn connect(&self, address: &BleAddress) -> Result<Self::Link>;

    /// Write one frame to the device
    async fn write(&self, link: &Self::Link, frame: &[u8]) -> Result<()>;

    /// Subscribe to frames notified by the device; the stream ends on link loss
    async fn notifications(&self, link: &Self::Link) -> Result<BoxStream<'static, Vec<u8>>>;

    /// Close the link
    async fn disconnect(&self, link: &Self::Link) -> Result<()>;

    /// Get transport-specific metadata/capabilities
    fn capabilities(&self) -> TransportCapabilities;
}

// ----------------------------------------------------------------------------
// Transport Capabilities
// ----------------------------------------------------------------------------

/// Describes the capabilities and characteristics of a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Transport type identifier
    pub transport_type: TransportType,
    /// Largest frame a single write may carry, header included
    pub max_frame_size: usize,
    /// Whether the transport can scan for advertisements
    pub supports_scan: bool,
}

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransportType {
    /// Bluetooth Low Energy
    Ble,
    /// In-process link (for testing)
    Local,
}
