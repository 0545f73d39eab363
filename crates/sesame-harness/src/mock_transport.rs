//! Mock Transport for Testing
//!
//! Provides an in-memory transport implementation for testing without hardware
//! dependencies. Frames written by the host are handed to a [`SimulatedPeripheral`]
//! and its answers come back on the link's notification stream. Frame loss and
//! corruption are drawn from a seeded generator so runs are reproducible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{self, BoxStream, StreamExt};
use sesame_core::errors::TransportError;
use sesame_core::protocol::fragmentation::SEGMENT_DATA_SIZE;
use sesame_core::protocol::Frames;
use sesame_core::transport::{TransportCapabilities, TransportType};
use sesame_core::{BleAddress, RawAdvertisement, Result, SesameError, Transport};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::peripheral::SimulatedPeripheral;

// ----------------------------------------------------------------------------
// Mock Transport Configuration
// ----------------------------------------------------------------------------

/// Configuration for mock transport behavior
#[derive(Debug, Clone)]
pub struct MockTransportConfig {
    /// Probability a host write never reaches the device (0.0 = never, 1.0 = always)
    pub frame_loss_rate: f64,
    /// Probability a host write arrives with one bit flipped
    pub corruption_rate: f64,
    /// Largest frame accepted by a single write
    pub max_frame_size: usize,
    /// Seed for the loss and corruption generator
    pub seed: u64,
    /// How long a connect takes before the link opens
    pub connect_delay: Duration,
}

impl Default for MockTransportConfig {
    fn default() -> Self {
        Self::ideal()
    }
}

impl MockTransportConfig {
    /// Every frame arrives intact
    pub fn ideal() -> Self {
        Self {
            frame_loss_rate: 0.0,
            corruption_rate: 0.0,
            max_frame_size: SEGMENT_DATA_SIZE + 1,
            seed: 0x5E5A_4E00,
            connect_delay: Duration::ZERO,
        }
    }

    /// Host writes are dropped at `rate`
    pub fn lossy(rate: f64) -> Self {
        Self {
            frame_loss_rate: rate,
            ..Self::ideal()
        }
    }

    /// Host writes are corrupted at `rate`
    pub fn noisy(rate: f64) -> Self {
        Self {
            corruption_rate: rate,
            ..Self::ideal()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Connects stall for `delay`, like an out-of-range device
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }
}

// ----------------------------------------------------------------------------
// Link
// ----------------------------------------------------------------------------

/// Handle to one in-memory connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockLink {
    pub address: BleAddress,
    pub connection_id: u64,
}

/// Frame written by the host, as it left the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFrame {
    pub link: MockLink,
    pub data: Vec<u8>,
}

struct LinkChannel {
    link: MockLink,
    sender: mpsc::UnboundedSender<Vec<u8>>,
    receiver: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

// ----------------------------------------------------------------------------
// Mock Transport Implementation
// ----------------------------------------------------------------------------

/// In-memory transport backed by simulated peripherals
pub struct MockTransport {
    config: MockTransportConfig,
    peripherals: Mutex<HashMap<BleAddress, SimulatedPeripheral>>,
    links: Mutex<HashMap<BleAddress, LinkChannel>>,
    written: Mutex<Vec<WrittenFrame>>,
    rng: Mutex<fastrand::Rng>,
    next_connection_id: AtomicU64,
}

impl MockTransport {
    pub fn new(config: MockTransportConfig) -> Self {
        let rng = fastrand::Rng::with_seed(config.seed);
        Self {
            config,
            peripherals: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            written: Mutex::new(Vec::new()),
            rng: Mutex::new(rng),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &MockTransportConfig {
        &self.config
    }

    /// Place a device in range
    pub async fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        self.peripherals
            .lock()
            .await
            .insert(peripheral.address(), peripheral);
    }

    /// Inspect or reconfigure a device in range
    pub async fn with_peripheral<R>(
        &self,
        address: &BleAddress,
        f: impl FnOnce(&mut SimulatedPeripheral) -> R,
    ) -> Option<R> {
        self.peripherals.lock().await.get_mut(address).map(f)
    }

    /// Have a device publish its current status on its open link
    pub async fn publish_status(&self, address: &BleAddress) -> bool {
        let frames = self
            .with_peripheral(address, SimulatedPeripheral::publish_status)
            .await
            .flatten();
        match frames {
            Some(frames) => self.inject(address, &frames).await,
            None => false,
        }
    }

    /// Deliver raw frames on a device's open link
    pub async fn inject(&self, address: &BleAddress, frames: &Frames) -> bool {
        let links = self.links.lock().await;
        let Some(channel) = links.get(address) else {
            return false;
        };
        frames
            .iter()
            .all(|frame| channel.sender.unbounded_send(frame.clone()).is_ok())
    }

    /// Drop a device's link as if it went out of range
    pub async fn drop_link(&self, address: &BleAddress) -> bool {
        let removed = self.links.lock().await.remove(address);
        if removed.is_some() {
            info!("Mock link to {} dropped", address);
            self.with_peripheral(address, SimulatedPeripheral::on_disconnect)
                .await;
        }
        removed.is_some()
    }

    pub async fn is_connected(&self, address: &BleAddress) -> bool {
        self.links.lock().await.contains_key(address)
    }

    /// Every frame the host has written, oldest first
    pub async fn written_frames(&self) -> Vec<WrittenFrame> {
        self.written.lock().await.clone()
    }

    /// Number of connections opened so far
    pub fn connection_count(&self) -> u64 {
        self.next_connection_id.load(Ordering::SeqCst) - 1
    }

    /// Apply loss and corruption to a host write
    async fn impair(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let mut rng = self.rng.lock().await;
        if rng.f64() < self.config.frame_loss_rate {
            return None;
        }
        let mut frame = frame.to_vec();
        if !frame.is_empty() && rng.f64() < self.config.corruption_rate {
            let bit = rng.usize(..frame.len() * 8);
            frame[bit / 8] ^= 1 << (bit % 8);
        }
        Some(frame)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(MockTransportConfig::default())
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn scan(&self) -> Result<BoxStream<'static, RawAdvertisement>> {
        let advertisements: Vec<RawAdvertisement> = self
            .peripherals
            .lock()
            .await
            .values()
            .map(SimulatedPeripheral::advertisement)
            .collect();
        Ok(stream::iter(advertisements).boxed())
    }

    async fn connect(&self, address: &BleAddress) -> Result<MockLink> {
        if !self.config.connect_delay.is_zero() {
            tokio::time::sleep(self.config.connect_delay).await;
        }
        let mut links = self.links.lock().await;
        if links.contains_key(address) {
            return Err(SesameError::connection_failed(
                address.to_string(),
                "already connected",
            ));
        }
        let initial = self
            .with_peripheral(address, SimulatedPeripheral::on_connect)
            .await
            .ok_or_else(|| TransportError::DeviceNotFound {
                address: address.to_string(),
            })?;

        let link = MockLink {
            address: *address,
            connection_id: self.next_connection_id.fetch_add(1, Ordering::SeqCst),
        };
        let (sender, receiver) = mpsc::unbounded();
        for frame in initial {
            // receiver is alive in the same scope
            let _ = sender.unbounded_send(frame);
        }
        links.insert(
            *address,
            LinkChannel {
                link,
                sender,
                receiver: Some(receiver),
            },
        );
        info!("Mock link {} to {} established", link.connection_id, address);
        Ok(link)
    }

    async fn write(&self, link: &MockLink, frame: &[u8]) -> Result<()> {
        if frame.len() > self.config.max_frame_size {
            return Err(TransportError::WriteFailed {
                reason: format!(
                    "frame of {} bytes exceeds {}",
                    frame.len(),
                    self.config.max_frame_size
                ),
            }
            .into());
        }
        if !self.is_open(link).await {
            return Err(TransportError::WriteFailed {
                reason: format!("link {} is closed", link.connection_id),
            }
            .into());
        }
        self.written.lock().await.push(WrittenFrame {
            link: *link,
            data: frame.to_vec(),
        });

        let Some(delivered) = self.impair(frame).await else {
            debug!("Mock transport dropped frame to {}", link.address);
            return Ok(());
        };
        let responses = self
            .with_peripheral(&link.address, |p| p.handle_frame(&delivered))
            .await
            .unwrap_or_default();
        for frames in responses {
            self.inject(&link.address, &frames).await;
        }
        Ok(())
    }

    async fn notifications(&self, link: &MockLink) -> Result<BoxStream<'static, Vec<u8>>> {
        let mut links = self.links.lock().await;
        let receiver = links
            .get_mut(&link.address)
            .filter(|channel| channel.link == *link)
            .and_then(|channel| channel.receiver.take())
            .ok_or(TransportError::NotificationStreamClosed)?;
        Ok(receiver.boxed())
    }

    async fn disconnect(&self, link: &MockLink) -> Result<()> {
        let mut links = self.links.lock().await;
        if links
            .get(&link.address)
            .is_some_and(|channel| channel.link == *link)
        {
            links.remove(&link.address);
            drop(links);
            self.with_peripheral(&link.address, SimulatedPeripheral::on_disconnect)
                .await;
            info!("Mock link {} to {} closed", link.connection_id, link.address);
        }
        Ok(())
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            transport_type: TransportType::Local,
            max_frame_size: self.config.max_frame_size,
            supports_scan: true,
        }
    }
}

impl MockTransport {
    async fn is_open(&self, link: &MockLink) -> bool {
        self.links
            .lock()
            .await
            .get(&link.address)
            .is_some_and(|channel| channel.link == *link)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_address() -> BleAddress {
        BleAddress::new([0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01])
    }

    #[tokio::test]
    async fn test_connect_publishes_initial() {
        let transport = MockTransport::default();
        let address = create_test_address();
        transport
            .add_peripheral(SimulatedPeripheral::lock(address))
            .await;

        let link = transport.connect(&address).await.unwrap();
        let mut frames = transport.notifications(&link).await.unwrap();
        let initial = frames.next().await.unwrap();
        // plaintext end segment carrying publish/initial
        assert_eq!(initial[0], 0x03);
        assert_eq!(&initial[1..3], &[0x08, 0x0E]);
        assert_eq!(transport.connection_count(), 1);

        transport.disconnect(&link).await.unwrap();
        assert!(frames.next().await.is_none());
        assert!(transport.write(&link, &[0x01]).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let transport = MockTransport::default();
        let err = transport.connect(&create_test_address()).await.unwrap_err();
        assert!(matches!(
            err,
            SesameError::Transport(TransportError::DeviceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_scan_lists_peripherals() {
        let transport = MockTransport::default();
        transport
            .add_peripheral(SimulatedPeripheral::lock(create_test_address()))
            .await;
        transport
            .add_peripheral(SimulatedPeripheral::bot(BleAddress::new([9; 6])))
            .await;

        let advertisements: Vec<_> = transport.scan().await.unwrap().collect().await;
        assert_eq!(advertisements.len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let transport = MockTransport::default();
        let address = create_test_address();
        transport
            .add_peripheral(SimulatedPeripheral::lock(address))
            .await;
        let link = transport.connect(&address).await.unwrap();

        assert!(transport.write(&link, &[0u8; 21]).await.is_err());
        assert!(transport.written_frames().await.is_empty());
    }

    #[test]
    fn test_capabilities_match_config() {
        let transport = MockTransport::default();
        let capabilities = transport.capabilities();
        assert_eq!(capabilities.transport_type, TransportType::Local);
        assert_eq!(capabilities.max_frame_size, SEGMENT_DATA_SIZE + 1);
        assert!(capabilities.supports_scan);
    }

    #[tokio::test]
    async fn test_loss_is_reproducible() {
        async fn delivered(seed: u64) -> Vec<bool> {
            let transport = MockTransport::new(MockTransportConfig::lossy(0.5).with_seed(seed));
            let mut out = Vec::new();
            for _ in 0..32 {
                out.push(transport.impair(&[1, 2, 3]).await.is_some());
            }
            out
        }
        assert_eq!(delivered(7).await, delivered(7).await);
    }
}
