//! Error types for the Sesame protocol engine
//!
//! This module contains all error types used throughout the core crate, including
//! cryptographic errors, packet errors, transport errors, and the main SesameError
//! type that unifies them all.

use core::fmt;

use crate::dispatcher::CommandKind;
use crate::protocol::ResultCode;
use crate::session::StateTransitionError;
use crate::types::DeviceKind;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Specific cryptographic error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptographicError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Invalid key format: {reason}")]
    InvalidKeyFormat { reason: String },
    #[error("Message counter exhausted")]
    CounterExhausted,
}

/// Specific transport error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed to device {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },
    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Write failed: {reason}")]
    WriteFailed { reason: String },
    #[error("Notification stream closed")]
    NotificationStreamClosed,
    #[error("Scan failed: {reason}")]
    ScanFailed { reason: String },
    #[error("Transport is not available: {reason}")]
    Unavailable { reason: String },
    #[error("Device not found: {address}")]
    DeviceNotFound { address: String },
}

/// Specific packet validation error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("Packet payload too small (expected at least {expected}, got {actual})")]
    PayloadTooSmall { expected: usize, actual: usize },
    #[error("Packet payload too large (max {max}, got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },
    #[error("Unknown op code: {op_code}")]
    UnknownOpCode { op_code: u8 },
    #[error("Unknown item code: {item_code}")]
    UnknownItemCode { item_code: u8 },
    #[error("Unknown result code: {result_code}")]
    UnknownResultCode { result_code: u8 },
    #[error("Malformed segment header: {header:#04x}")]
    MalformedHeader { header: u8 },
    #[error("{message}")]
    Generic { message: String },
}

impl From<String> for PacketError {
    fn from(message: String) -> Self {
        PacketError::Generic { message }
    }
}

impl From<&str> for PacketError {
    fn from(message: &str) -> Self {
        PacketError::Generic {
            message: message.to_string(),
        }
    }
}

/// Reason a frame or handshake failed authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Integrity tag did not verify under the expected counter
    TagMismatch,
    /// Device did not complete the login exchange in time
    HandshakeTimeout,
    /// Device answered the login with a non-success result
    LoginRejected(ResultCode),
    /// Login response could not be decoded
    MalformedResponse,
    /// Plaintext application frame after the handshake began
    UnexpectedPlaintext,
    /// Encrypted frame arrived with no session keys
    MissingSessionKeys,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFailure::TagMismatch => write!(f, "integrity tag mismatch"),
            AuthFailure::HandshakeTimeout => write!(f, "handshake timed out"),
            AuthFailure::LoginRejected(code) => write!(f, "login rejected ({:?})", code),
            AuthFailure::MalformedResponse => write!(f, "malformed login response"),
            AuthFailure::UnexpectedPlaintext => write!(f, "unexpected plaintext frame"),
            AuthFailure::MissingSessionKeys => write!(f, "ciphertext without session keys"),
        }
    }
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Core error types for the Sesame protocol engine
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SesameError {
    #[error("Malformed advertisement: {reason}")]
    MalformedAdvertisement { reason: String },

    #[error("Frame truncated: {buffered} bytes discarded")]
    FrameTruncated { buffered: usize },

    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: AuthFailure },

    #[error("Session not ready (state: {state})")]
    NotReady { state: &'static str },

    #[error("Command already in flight: {pending:?}")]
    CommandInFlight { pending: CommandKind },

    #[error("Command {command:?} timed out after {timeout_ms}ms")]
    CommandTimeout { command: CommandKind, timeout_ms: u64 },

    #[error("Disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("Command {command:?} rejected by device: {result:?}")]
    CommandRejected {
        command: CommandKind,
        result: ResultCode,
    },

    #[error("Command {command:?} is not supported by {kind:?} devices")]
    UnsupportedCommand { command: CommandKind, kind: DeviceKind },

    #[error("Current lock state is unknown")]
    StatusUnknown,

    #[error("Device mechanism is not configured")]
    NotConfigured,

    #[error("Device has not completed vendor setup")]
    NotRegistered,

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptographicError),

    #[error("Invalid packet: {0}")]
    InvalidPacket(#[from] PacketError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl SesameError {
    /// Create a malformed advertisement error with a reason
    pub fn malformed_advertisement<T: Into<String>>(reason: T) -> Self {
        SesameError::MalformedAdvertisement {
            reason: reason.into(),
        }
    }

    /// Create an authentication failure
    pub fn auth_failed(reason: AuthFailure) -> Self {
        SesameError::AuthenticationFailed { reason }
    }

    /// Create a disconnected error with a reason
    pub fn disconnected<T: Into<String>>(reason: T) -> Self {
        SesameError::Disconnected {
            reason: reason.into(),
        }
    }

    /// Create an invalid packet error with a message
    pub fn invalid_packet<T: Into<String>>(message: T) -> Self {
        SesameError::InvalidPacket(PacketError::Generic {
            message: message.into(),
        })
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        SesameError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a transport connection failed error
    pub fn connection_failed<A: Into<String>, R: Into<String>>(address: A, reason: R) -> Self {
        SesameError::Transport(TransportError::ConnectionFailed {
            address: address.into(),
            reason: reason.into(),
        })
    }

    /// Create a transport timeout error
    pub fn transport_timeout(duration_ms: u64) -> Self {
        SesameError::Transport(TransportError::Timeout { duration_ms })
    }

    /// Whether this error ends the current session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SesameError::AuthenticationFailed { .. }
                | SesameError::Disconnected { .. }
                | SesameError::Transport(_)
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, SesameError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
