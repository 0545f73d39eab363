//! Main BLE transport implementation
//!
//! Implements the core [`Transport`] trait on btleplug's central role: scans are
//! filtered on the Sesame service, frames are written without response to the TX
//! characteristic and notified on the RX characteristic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{BoxStream, StreamExt};
use sesame_core::transport::{TransportCapabilities, TransportType};
use sesame_core::{BleAddress, RawAdvertisement, Result as SesameResult, Transport};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::BleTransportConfig;
use crate::error::BleTransportError;
use crate::protocol::{
    sesame_manufacturer_data, to_ble_address, SESAME_RX_CHARACTERISTIC_UUID,
    SESAME_SERVICE_UUID, SESAME_TX_CHARACTERISTIC_UUID,
};

type PeripheralCache = Arc<RwLock<HashMap<BleAddress, Peripheral>>>;

// ----------------------------------------------------------------------------
// Link
// ----------------------------------------------------------------------------

/// Connected Sesame peripheral
#[derive(Debug, Clone)]
pub struct BleLink {
    address: BleAddress,
    peripheral: Peripheral,
    tx: Characteristic,
}

impl BleLink {
    pub fn address(&self) -> BleAddress {
        self.address
    }
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// btleplug-backed transport
pub struct BleTransport {
    config: BleTransportConfig,
    adapter: Adapter,
    peripherals: PeripheralCache,
}

impl BleTransport {
    /// Open the configured host adapter
    pub async fn new(config: BleTransportConfig) -> Result<Self, BleTransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleTransportError::ManagerUnavailable(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| BleTransportError::ManagerUnavailable(e.to_string()))?;
        let adapter = adapters
            .get(config.adapter_index)
            .cloned()
            .ok_or(BleTransportError::AdapterNotAvailable {
                index: config.adapter_index,
            })?;

        info!("BLE adapter {} initialized", config.adapter_index);
        Ok(Self {
            config,
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &BleTransportConfig {
        &self.config
    }

    async fn start_scan(&self) -> Result<(), BleTransportError> {
        let scan_filter = ScanFilter {
            services: vec![SESAME_SERVICE_UUID],
        };
        self.adapter
            .start_scan(scan_filter)
            .await
            .map_err(|e| BleTransportError::ScanFailed(e.to_string()))
    }

    /// Find a peripheral by address, scanning until it shows up
    async fn find_peripheral(&self, address: &BleAddress) -> Result<Peripheral, BleTransportError> {
        if let Some(peripheral) = self.peripherals.read().await.get(address) {
            return Ok(peripheral.clone());
        }

        self.start_scan().await?;
        let search = async {
            loop {
                let peripherals = self
                    .adapter
                    .peripherals()
                    .await
                    .map_err(|e| BleTransportError::ScanFailed(e.to_string()))?;
                if let Some(peripheral) = peripherals
                    .into_iter()
                    .find(|p| to_ble_address(p.address()) == *address)
                {
                    return Ok::<_, BleTransportError>(peripheral);
                }
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
        };
        let peripheral = timeout(self.config.scan_timeout, search)
            .await
            .map_err(|_| BleTransportError::PeripheralNotFound {
                address: address.to_string(),
            })??;

        self.peripherals
            .write()
            .await
            .insert(*address, peripheral.clone());
        Ok(peripheral)
    }

    async fn open(&self, address: &BleAddress) -> Result<BleLink, BleTransportError> {
        let peripheral = self.find_peripheral(address).await?;

        match timeout(self.config.connection_timeout, peripheral.connect()).await {
            Ok(Ok(())) => info!("Connected to {}", address),
            Ok(Err(e)) => {
                error!("Failed to connect to {}: {}", address, e);
                return Err(BleTransportError::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                error!("Connection to {} timed out", address);
                return Err(BleTransportError::ConnectionTimeout {
                    timeout_ms: self.config.connection_timeout.as_millis() as u64,
                });
            }
        }

        peripheral
            .discover_services()
            .await
            .map_err(|e| BleTransportError::ServiceDiscoveryFailed(e.to_string()))?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: uuid::Uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| BleTransportError::CharacteristicNotFound {
                    characteristic: uuid.to_string(),
                })
        };
        let tx = find(SESAME_TX_CHARACTERISTIC_UUID)?;
        let rx = find(SESAME_RX_CHARACTERISTIC_UUID)?;

        peripheral
            .subscribe(&rx)
            .await
            .map_err(|e| BleTransportError::SubscriptionFailed(e.to_string()))?;

        Ok(BleLink {
            address: *address,
            peripheral,
            tx,
        })
    }
}

#[async_trait]
impl Transport for BleTransport {
    type Link = BleLink;

    async fn scan(&self) -> SesameResult<BoxStream<'static, RawAdvertisement>> {
        let events = self
            .adapter
            .events()
            .await
            .map_err(|e| BleTransportError::ScanFailed(e.to_string()))?;
        self.start_scan().await?;
        info!("Started BLE scanning for Sesame devices");

        let adapter = self.adapter.clone();
        let cache = Arc::clone(&self.peripherals);
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let cache = Arc::clone(&cache);
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. } => id,
                    _ => return None,
                };
                read_advertisement(&adapter, &cache, &id).await
            }
        });
        Ok(stream.boxed())
    }

    async fn connect(&self, address: &BleAddress) -> SesameResult<BleLink> {
        Ok(self.open(address).await?)
    }

    async fn write(&self, link: &BleLink, frame: &[u8]) -> SesameResult<()> {
        if frame.len() > self.config.max_frame_size {
            return Err(BleTransportError::FrameTooLarge {
                size: frame.len(),
                max_size: self.config.max_frame_size,
            }
            .into());
        }
        link.peripheral
            .write(&link.tx, frame, WriteType::WithoutResponse)
            .await
            .map_err(|e| BleTransportError::WriteFailed(e.to_string()))?;
        debug!("Sent {} to {}", hex::encode(frame), link.address);
        Ok(())
    }

    async fn notifications(&self, link: &BleLink) -> SesameResult<BoxStream<'static, Vec<u8>>> {
        let notifications = link
            .peripheral
            .notifications()
            .await
            .map_err(|e| BleTransportError::NotificationStreamFailed(e.to_string()))?;
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| BleTransportError::NotificationStreamFailed(e.to_string()))?;

        let peripheral_id: PeripheralId = link.peripheral.id();
        let address = link.address;
        let disconnected = async move {
            while let Some(event) = events.next().await {
                if matches!(&event, CentralEvent::DeviceDisconnected(id) if *id == peripheral_id) {
                    warn!("{} disconnected", address);
                    break;
                }
            }
        };

        let frames = notifications
            .filter_map(|data| async move {
                (data.uuid == SESAME_RX_CHARACTERISTIC_UUID).then_some(data.value)
            })
            .take_until(disconnected);
        Ok(frames.boxed())
    }

    async fn disconnect(&self, link: &BleLink) -> SesameResult<()> {
        if let Err(e) = link.peripheral.disconnect().await {
            error!("Failed to disconnect from {}: {}", link.address, e);
        }
        info!("Disconnected from {}", link.address);
        Ok(())
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            transport_type: TransportType::Ble,
            max_frame_size: self.config.max_frame_size,
            supports_scan: true,
        }
    }
}

async fn read_advertisement(
    adapter: &Adapter,
    cache: &PeripheralCache,
    id: &PeripheralId,
) -> Option<RawAdvertisement> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let manufacturer_data = sesame_manufacturer_data(&properties.manufacturer_data)?.to_vec();

    let address = to_ble_address(properties.address);
    cache.write().await.insert(address, peripheral);
    Some(RawAdvertisement {
        address,
        local_name: properties.local_name,
        manufacturer_data,
        rssi: properties.rssi,
    })
}
