//! End-to-end sessions between the async client and simulated devices
//!
//! Every test runs the real handshake and cipher over the in-memory transport with
//! short timeouts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sesame_core::model::LockState;
use sesame_core::protocol::ItemCode;
use sesame_core::{
    AuthFailure, BleAddress, CommandKind, DeviceIdentity, DeviceKind, DeviceRegistry, ResultCode,
    SesameDevice, SesameError, SessionConfig, SessionState, Transport,
};
use sesame_harness::{init_test_logging, MockTransport, MockTransportConfig, SimulatedPeripheral};

const LOCK_ADDRESS: BleAddress = BleAddress::new([0xE4, 0x5F, 0x01, 0x00, 0x00, 0x01]);
const BOT_ADDRESS: BleAddress = BleAddress::new([0xE4, 0x5F, 0x01, 0x00, 0x00, 0x02]);

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

async fn create_test_rig(
    peripheral: SimulatedPeripheral,
    config: MockTransportConfig,
) -> (Arc<MockTransport>, SesameDevice<MockTransport>) {
    init_test_logging();
    let address = peripheral.address();
    let kind = peripheral.kind().unwrap();
    let keys = peripheral.key_material().unwrap();

    let transport = Arc::new(MockTransport::new(config));
    transport.add_peripheral(peripheral).await;
    let device = SesameDevice::new(
        Arc::clone(&transport),
        keys,
        DeviceIdentity::new(address),
        kind,
        SessionConfig::testing(),
    )
    .unwrap();
    (transport, device)
}

async fn create_connected_lock(
    peripheral: SimulatedPeripheral,
) -> (Arc<MockTransport>, SesameDevice<MockTransport>) {
    let (transport, device) = create_test_rig(peripheral, MockTransportConfig::ideal()).await;
    device.connect().await.unwrap();
    (transport, device)
}

async fn wait_until_closed(device: &SesameDevice<MockTransport>) {
    let mut state = device.watch_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|state| !state.is_linked()),
    )
    .await
    .unwrap()
    .unwrap();
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_connect_reports_login_status() {
    let (transport, device) =
        create_connected_lock(SimulatedPeripheral::lock(LOCK_ADDRESS).with_locked(true)).await;

    assert!(device.state().is_ready());
    let snapshot = device.current_status().await;
    let status = snapshot.status.unwrap();
    assert_eq!(status.lock_state, LockState::Locked);
    assert_eq!(status.sequence.epoch, 1);
    assert!(!snapshot.stale);
    assert!(snapshot.settings.is_some());
    assert!(transport
        .with_peripheral(&LOCK_ADDRESS, |p| p.is_logged_in())
        .await
        .unwrap());
}

#[tokio::test]
async fn test_wrong_key_times_out() {
    init_test_logging();
    let transport = Arc::new(MockTransport::default());
    transport
        .add_peripheral(SimulatedPeripheral::lock(LOCK_ADDRESS))
        .await;
    let foreign_keys = SimulatedPeripheral::lock(BOT_ADDRESS).key_material().unwrap();
    let device = SesameDevice::new(
        Arc::clone(&transport),
        foreign_keys,
        DeviceIdentity::new(LOCK_ADDRESS),
        DeviceKind::Lock,
        SessionConfig::testing(),
    )
    .unwrap();

    let err = device.connect().await.unwrap_err();
    assert_eq!(err, SesameError::auth_failed(AuthFailure::HandshakeTimeout));
    assert!(!device.state().is_linked());
    assert!(!transport.is_connected(&LOCK_ADDRESS).await);
}

#[tokio::test]
async fn test_silent_login_times_out() {
    let (transport, device) = create_test_rig(
        SimulatedPeripheral::lock(LOCK_ADDRESS).with_silent_login(),
        MockTransportConfig::ideal(),
    )
    .await;

    let err = device.connect().await.unwrap_err();
    assert_eq!(err, SesameError::auth_failed(AuthFailure::HandshakeTimeout));
    assert!(!transport.is_connected(&LOCK_ADDRESS).await);
}

#[tokio::test]
async fn test_corrupted_login_never_completes() {
    let (_transport, device) = create_test_rig(
        SimulatedPeripheral::lock(LOCK_ADDRESS),
        MockTransportConfig::noisy(1.0),
    )
    .await;

    let err = device.connect().await.unwrap_err();
    assert_eq!(err, SesameError::auth_failed(AuthFailure::HandshakeTimeout));
}

#[tokio::test]
async fn test_reconnect_starts_new_epoch() {
    let (transport, device) = create_connected_lock(SimulatedPeripheral::lock(LOCK_ADDRESS)).await;
    device.disconnect().await.unwrap();
    assert!(matches!(device.state(), SessionState::Disconnected { .. }));

    device.connect().await.unwrap();
    let status = device.current_status().await.status.unwrap();
    assert_eq!(status.sequence.epoch, 2);
    assert_eq!(transport.connection_count(), 2);
}

#[tokio::test]
async fn test_reconnect_right_after_link_loss() {
    let (transport, device) = create_connected_lock(SimulatedPeripheral::lock(LOCK_ADDRESS)).await;
    assert!(transport.drop_link(&LOCK_ADDRESS).await);
    let err = device.lock().await.unwrap_err();
    assert!(matches!(
        err,
        SesameError::Disconnected { .. } | SesameError::NotReady { .. }
    ));

    device.connect().await.unwrap();
    assert!(device.state().is_ready());
    // the first link's pump must not tear down the second session
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(device.state().is_ready());
    assert!(transport.is_connected(&LOCK_ADDRESS).await);
    assert_eq!(device.lock().await.unwrap().lock_state, LockState::Locked);
}

#[tokio::test]
async fn test_disconnect_aborts_hanging_connect() {
    init_test_logging();
    let peripheral = SimulatedPeripheral::lock(LOCK_ADDRESS);
    let keys = peripheral.key_material().unwrap();
    let transport = Arc::new(MockTransport::new(
        MockTransportConfig::ideal().with_connect_delay(Duration::from_secs(5)),
    ));
    transport.add_peripheral(peripheral).await;
    let device = Arc::new(
        SesameDevice::new(
            Arc::clone(&transport),
            keys,
            DeviceIdentity::new(LOCK_ADDRESS),
            DeviceKind::Lock,
            SessionConfig::testing().with_connect_timeout(Duration::from_secs(10)),
        )
        .unwrap(),
    );

    let connecting = tokio::spawn({
        let device = Arc::clone(&device);
        async move { device.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_millis(100), device.current_status())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_millis(100), device.disconnect())
        .await
        .unwrap()
        .unwrap();
    let err = tokio::time::timeout(Duration::from_millis(100), connecting)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SesameError::Disconnected { .. }));
    assert!(!device.state().is_linked());
    assert!(!transport.is_connected(&LOCK_ADDRESS).await);
}

#[tokio::test]
async fn test_setup_required_device_is_refused() {
    init_test_logging();
    let peripheral = SimulatedPeripheral::lock(LOCK_ADDRESS).with_setup_required();
    let keys = peripheral.key_material().unwrap();
    let transport = Arc::new(MockTransport::default());
    transport.add_peripheral(peripheral).await;

    let registry: DeviceRegistry<()> = DeviceRegistry::new();
    let raw = transport.scan().await.unwrap().next().await.unwrap();
    let advertisement = registry.observe(&raw).unwrap();
    assert!(!advertisement.is_registered());

    let device = SesameDevice::from_advertisement(
        Arc::clone(&transport),
        keys,
        &advertisement,
        SessionConfig::testing(),
    )
    .unwrap();
    assert_eq!(device.connect().await.unwrap_err(), SesameError::NotRegistered);
    assert_eq!(transport.connection_count(), 0);
}

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_lock_and_unlock() {
    let (transport, device) = create_connected_lock(SimulatedPeripheral::lock(LOCK_ADDRESS)).await;

    let status = device.lock().await.unwrap();
    assert_eq!(status.lock_state, LockState::Locked);
    let status = device.unlock().await.unwrap();
    assert_eq!(status.lock_state, LockState::Unlocked);
    let status = device.toggle().await.unwrap();
    assert_eq!(status.lock_state, LockState::Locked);

    let received = transport
        .with_peripheral(&LOCK_ADDRESS, |p| p.received_commands().to_vec())
        .await
        .unwrap();
    // toggle is resolved on the host into an explicit lock
    assert_eq!(received, [ItemCode::Lock, ItemCode::Unlock, ItemCode::Lock]);
}

#[tokio::test]
async fn test_history_tag_per_command() {
    let (transport, device) = create_connected_lock(SimulatedPeripheral::lock(LOCK_ADDRESS)).await;

    device
        .execute_with_tag(CommandKind::Unlock, "courier")
        .await
        .unwrap();
    device.lock().await.unwrap();

    let history = transport
        .with_peripheral(&LOCK_ADDRESS, |p| p.history().to_vec())
        .await
        .unwrap();
    assert_eq!(history[0], "courier");
    assert_eq!(history[1], SessionConfig::testing().history_tag);
}

#[tokio::test]
async fn test_bot_click() {
    let (transport, device) = create_test_rig(
        SimulatedPeripheral::bot(BOT_ADDRESS),
        MockTransportConfig::ideal(),
    )
    .await;
    device.connect().await.unwrap();

    let before = device.current_status().await.status.unwrap();
    let status = device.click().await.unwrap();
    assert!(status.sequence > before.sequence);
    assert!(status.motor_status.is_some());
    assert_eq!(
        transport
            .with_peripheral(&BOT_ADDRESS, |p| p.received_commands().to_vec())
            .await
            .unwrap(),
        [ItemCode::Click]
    );
}

#[tokio::test]
async fn test_click_unsupported_on_lock() {
    let (transport, device) = create_connected_lock(SimulatedPeripheral::lock(LOCK_ADDRESS)).await;
    let writes = transport.written_frames().await.len();

    let err = device.click().await.unwrap_err();
    assert_eq!(
        err,
        SesameError::UnsupportedCommand {
            command: CommandKind::Click,
            kind: DeviceKind::Lock,
        }
    );
    assert_eq!(transport.written_frames().await.len(), writes);
}

#[tokio::test]
async fn test_command_before_connect_writes_nothing() {
    let (transport, device) = create_test_rig(
        SimulatedPeripheral::lock(LOCK_ADDRESS),
        MockTransportConfig::ideal(),
    )
    .await;

    let err = device.lock().await.unwrap_err();
    assert!(matches!(err, SesameError::NotReady { .. }));
    assert!(transport.written_frames().await.is_empty());
}

#[tokio::test]
async fn test_rejected_command() {
    let (_transport, device) = create_connected_lock(
        SimulatedPeripheral::lock(LOCK_ADDRESS).with_command_result(ResultCode::Busy),
    )
    .await;

    let err = device.unlock().await.unwrap_err();
    assert_eq!(
        err,
        SesameError::CommandRejected {
            command: CommandKind::Unlock,
            result: ResultCode::Busy,
        }
    );
    assert!(device.state().is_ready());
}

#[tokio::test]
async fn test_stalled_command_times_out_and_blocks_second() {
    let (_transport, device) =
        create_connected_lock(SimulatedPeripheral::lock(LOCK_ADDRESS).with_stalled_motor()).await;
    let device = Arc::new(device);

    let first = tokio::spawn({
        let device = Arc::clone(&device);
        async move { device.lock().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = device.unlock().await.unwrap_err();
    assert_eq!(
        err,
        SesameError::CommandInFlight {
            pending: CommandKind::Lock
        }
    );

    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        SesameError::CommandTimeout {
            command: CommandKind::Lock,
            ..
        }
    ));
    // a timed-out command leaves the session usable
    assert!(device.state().is_ready());
}

#[tokio::test]
async fn test_link_loss_fails_pending_command() {
    let (transport, device) =
        create_connected_lock(SimulatedPeripheral::lock(LOCK_ADDRESS).with_stalled_motor()).await;
    let device = Arc::new(device);

    let pending = tokio::spawn({
        let device = Arc::clone(&device);
        async move { device.lock().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(transport.drop_link(&LOCK_ADDRESS).await);

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, SesameError::Disconnected { .. }));
    wait_until_closed(&device).await;
    assert!(!device.current_status().await.stale);
}

// ----------------------------------------------------------------------------
// Status Updates
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_unsolicited_status_reaches_subscribers() {
    let (transport, device) = create_connected_lock(SimulatedPeripheral::lock(LOCK_ADDRESS)).await;
    let calls = Arc::new(AtomicUsize::new(0));
    device
        .on_status_changed({
            let calls = Arc::clone(&calls);
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
    let mut updates = device.subscribe();

    transport
        .with_peripheral(&LOCK_ADDRESS, |p| p.set_locked(true))
        .await;
    assert!(transport.publish_status(&LOCK_ADDRESS).await);

    let status = tokio::time::timeout(Duration::from_secs(1), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.lock_state, LockState::Locked);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        device.current_status().await.status.unwrap().lock_state,
        LockState::Locked
    );
}

#[tokio::test]
async fn test_tampered_status_marks_stale() {
    let (transport, device) = create_connected_lock(SimulatedPeripheral::lock(LOCK_ADDRESS)).await;
    let before = device.current_status().await.status.unwrap();

    let tampered = transport
        .with_peripheral(&LOCK_ADDRESS, |p| p.tampered_status())
        .await
        .flatten()
        .unwrap();
    assert!(transport.inject(&LOCK_ADDRESS, &tampered).await);
    wait_until_closed(&device).await;

    let snapshot = device.current_status().await;
    assert!(snapshot.stale);
    assert_eq!(snapshot.status.unwrap(), before);
    assert!(matches!(
        device.lock().await.unwrap_err(),
        SesameError::NotReady { .. }
    ));

    // a fresh login clears the stale flag
    device.connect().await.unwrap();
    assert!(!device.current_status().await.stale);
}

#[tokio::test]
async fn test_replayed_status_ends_session() {
    let (transport, device) = create_connected_lock(SimulatedPeripheral::lock(LOCK_ADDRESS)).await;
    let mut updates = device.subscribe();

    let frames = transport
        .with_peripheral(&LOCK_ADDRESS, |p| p.publish_status())
        .await
        .flatten()
        .unwrap();
    assert!(transport.inject(&LOCK_ADDRESS, &frames).await);
    tokio::time::timeout(Duration::from_secs(1), updates.recv())
        .await
        .unwrap()
        .unwrap();

    transport.inject(&LOCK_ADDRESS, &frames).await;
    wait_until_closed(&device).await;
    assert!(device.current_status().await.stale);
}
