//! Sesame Wire Protocol Module
//!
//! This module contains the binary protocol spoken over the GATT channel:
//! - `constants`: op, item, result and segment codes
//! - `fragmentation`: segment header framing and reassembly
//! - `message`: outbound payloads and inbound notifications
//! - `mech`: mechanical status, settings and login response layouts

pub mod constants;
pub mod fragmentation;
pub mod mech;
pub mod message;

// Re-export code tables
pub use constants::{ItemCode, OpCode, ResultCode, SegmentType};

// Re-export framing types
pub use fragmentation::{Frames, MessageFragmenter, MessageReassembler, ReassembledMessage};

// Re-export message types
pub use message::{Notification, Payload, Publish, Response};

// Re-export mechanical layouts
pub use mech::{
    battery_percentage, BotButtonMode, BotMechSettings, BotMechStatus, HistoryTag,
    LockMechSettings, LockMechStatus, LoginResponse, RawMechSettings, RawMechStatus,
};
