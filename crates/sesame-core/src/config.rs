//! Session Configuration
//!
//! Timeouts and framing limits applied to a single device session.

use core::time::Duration;

use crate::errors::{Result, SesameError};
use crate::protocol::fragmentation::SEGMENT_DATA_SIZE;

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Configuration for a device session
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionConfig {
    /// Maximum time to wait for the transport link
    pub connect_timeout: Duration,
    /// Maximum time from link-up to a verified login
    pub handshake_timeout: Duration,
    /// Maximum time for a command to be confirmed by a status notification
    pub command_timeout: Duration,
    /// Maximum time a partially received message may stay buffered
    pub fragment_timeout: Duration,
    /// Link frame size including the segment header
    pub max_frame_size: usize,
    /// Largest reassembled message accepted
    pub max_message_size: usize,
    /// Label recorded in the device history for commands from this host
    pub history_tag: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            fragment_timeout: Duration::from_secs(2),
            max_frame_size: SEGMENT_DATA_SIZE + 1, // 20 byte ATT payload
            max_message_size: 1024,
            history_tag: "sesame-rs".to_string(),
        }
    }
}

impl SessionConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Short timeouts for tests and simulations
    pub fn testing() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_millis(500),
            fragment_timeout: Duration::from_millis(200),
            ..Self::default()
        }
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set fragment timeout
    pub fn with_fragment_timeout(mut self, timeout: Duration) -> Self {
        self.fragment_timeout = timeout;
        self
    }

    /// Set link frame size
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set history tag
    pub fn with_history_tag(mut self, tag: impl Into<String>) -> Self {
        self.history_tag = tag.into();
        self
    }

    /// Payload bytes carried by each link frame
    pub fn segment_data_size(&self) -> usize {
        self.max_frame_size.saturating_sub(1)
    }

    /// Check limits before a session is built
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size < 2 {
            return Err(SesameError::config_error(
                "max_frame_size must leave room for payload after the header",
            ));
        }
        if self.max_message_size == 0 {
            return Err(SesameError::config_error("max_message_size must be non-zero"));
        }
        for (name, timeout) in [
            ("connect_timeout", self.connect_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("command_timeout", self.command_timeout),
            ("fragment_timeout", self.fragment_timeout),
        ] {
            if timeout.is_zero() {
                return Err(SesameError::config_error(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
