//! Test harness for the Sesame protocol engine
//!
//! An in-memory [`MockTransport`] wired to [`SimulatedPeripheral`] devices, so the
//! full client can be exercised without a Bluetooth adapter.

pub mod mock_transport;
pub mod peripheral;

pub use mock_transport::{MockLink, MockTransport, MockTransportConfig, WrittenFrame};
pub use peripheral::{PeripheralBehavior, SimulatedPeripheral};

/// Install a fmt subscriber honoring `RUST_LOG`; later calls are no-ops
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
