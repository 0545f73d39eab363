//! Sesame Core Protocol Engine
//!
//! This crate implements the host side of the protocol spoken by Sesame smart locks and
//! bots over Bluetooth Low Energy: advertisement parsing, the segmented wire codec,
//! the authenticated login handshake and AES-CCM session cipher, the session state
//! machine, the notification-driven device model and the command dispatcher.
//!
//! The protocol engine itself ([`engine::SesameSession`]) is sans-IO: it consumes
//! link chunks and produces link chunks. [`client::SesameDevice`] drives it over any
//! [`transport::Transport`] implementation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sesame_core::{KeyMaterial, SesameDevice, SessionConfig};
//! # async fn example<T: sesame_core::Transport + 'static>(
//! #     transport: std::sync::Arc<T>,
//! #     advertisement: sesame_core::Advertisement,
//! # ) -> sesame_core::Result<()> {
//! let keys = KeyMaterial::from_hex(
//!     "6df237e72cd41f63cf32451232bee545",
//!     "d422b28bafdc17a9af2a7e778aeb9f9b962da8044d16f0107ad8d2db605b0090\
//!      fded0d7301fff24b3da3fe9126800be1ac046aca8144865f2e245fad32ecce5f",
//! )?;
//! let device = SesameDevice::from_advertisement(transport, keys, &advertisement, SessionConfig::default())?;
//! device.connect().await?;
//! let status = device.lock().await?;
//! println!("locked: {:?}", status.lock_state);
//! # Ok(())
//! # }
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod advertisement;
pub mod client;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API Re-exports
// ----------------------------------------------------------------------------

pub use advertisement::{Advertisement, AdvertisedLockState, AdvertisementFlags, RawAdvertisement};
pub use client::SesameDevice;
pub use config::SessionConfig;
pub use crypto::{KeyMaterial, SessionKeys};
pub use dispatcher::CommandKind;
pub use engine::{SesameSession, SessionOutput};
pub use errors::{
    AuthFailure, CryptographicError, PacketError, Result, SesameError, TransportError,
};
pub use model::{
    DeviceModel, Intention, LockState, MechanicalSettings, MechanicalStatus, StatusSnapshot,
};
pub use protocol::{ItemCode, OpCode, ResultCode};
pub use registry::DeviceRegistry;
pub use session::{SessionEvent, SessionState, StateTransitionError};
pub use transport::Transport;
pub use types::{BleAddress, DeviceIdentity, DeviceKind, ProductModel, Timestamp};
