//! Error types for BLE transport

use sesame_core::{SesameError, TransportError};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the BLE transport
#[derive(Error, Debug)]
pub enum BleTransportError {
    #[error("Failed to create BLE manager: {0}")]
    ManagerUnavailable(String),

    #[error("BLE adapter {index} not available")]
    AdapterNotAvailable { index: usize },

    #[error("Failed to scan: {0}")]
    ScanFailed(String),

    #[error("Peripheral not found: {address}")]
    PeripheralNotFound { address: String },

    #[error("Failed to connect to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    #[error("Failed to get notifications stream: {0}")]
    NotificationStreamFailed(String),

    #[error("Failed to write to characteristic: {0}")]
    WriteFailed(String),

    #[error("Frame too large: {size} bytes (max: {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },
}

impl From<BleTransportError> for SesameError {
    fn from(err: BleTransportError) -> Self {
        let transport = match err {
            BleTransportError::ManagerUnavailable(_) | BleTransportError::AdapterNotAvailable { .. } => {
                TransportError::Unavailable {
                    reason: err.to_string(),
                }
            }
            BleTransportError::ScanFailed(reason) => TransportError::ScanFailed { reason },
            BleTransportError::PeripheralNotFound { address } => {
                TransportError::DeviceNotFound { address }
            }
            BleTransportError::ConnectionFailed { address, reason } => {
                TransportError::ConnectionFailed { address, reason }
            }
            BleTransportError::ConnectionTimeout { timeout_ms } => TransportError::Timeout {
                duration_ms: timeout_ms,
            },
            BleTransportError::NotificationStreamFailed(_) => {
                TransportError::NotificationStreamClosed
            }
            other => TransportError::WriteFailed {
                reason: other.to_string(),
            },
        };
        SesameError::Transport(transport)
    }
}
