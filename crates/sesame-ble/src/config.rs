//! BLE transport configuration

use std::time::Duration;

use sesame_core::protocol::fragmentation::SEGMENT_DATA_SIZE;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for BLE transport
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BleTransportConfig {
    /// Maximum time to wait for a peripheral to show up when connecting
    pub scan_timeout: Duration,
    /// Maximum time to wait for connection
    pub connection_timeout: Duration,
    /// Which host adapter to use
    pub adapter_index: usize,
    /// Largest frame a single write may carry
    pub max_frame_size: usize,
}

impl Default for BleTransportConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(5),
            adapter_index: 0,
            max_frame_size: SEGMENT_DATA_SIZE + 1, // default ATT payload
        }
    }
}

impl BleTransportConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set scan timeout
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Select the host adapter
    pub fn with_adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }

    /// Set maximum frame size
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = BleTransportConfig::new()
            .with_connection_timeout(Duration::from_secs(8))
            .with_adapter_index(1);
        assert_eq!(config.connection_timeout, Duration::from_secs(8));
        assert_eq!(config.adapter_index, 1);
        assert_eq!(config.max_frame_size, 20);

        let json = serde_json::to_string(&config).unwrap();
        let restored: BleTransportConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, config);
    }
}
