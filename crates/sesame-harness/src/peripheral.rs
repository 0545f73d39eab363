//! Simulated Sesame peripheral
//!
//! Plays the device half of the protocol: publishes its token on connect, verifies
//! the login request, answers with an encrypted login response and executes lock
//! commands, publishing a status report after each movement. Behavior can be
//! degraded per test (silent login, stalled motor, rejected commands).

use rand_core::{OsRng, RngCore};
use sesame_core::advertisement::ADVERTISEMENT_TAG;
use sesame_core::crypto::{accept_login, generate_token, EcdhKeyPair, SECRET_KEY_LEN, TOKEN_LEN};
use sesame_core::protocol::mech::TARGET_IDLE;
use sesame_core::protocol::{
    BotButtonMode, BotMechSettings, BotMechStatus, Frames, HistoryTag, ItemCode,
    LockMechSettings, LockMechStatus, LoginResponse, MessageFragmenter, MessageReassembler,
    Notification, OpCode, Payload, RawMechSettings, RawMechStatus, ResultCode, SegmentType,
};
use sesame_core::{
    AdvertisementFlags, BleAddress, DeviceKind, KeyMaterial, ProductModel, RawAdvertisement,
    Result, SessionKeys, Timestamp,
};
use std::time::Duration;
use tracing::{debug, warn};

/// Calibrated positions reported by simulated locks
const LOCK_POSITION: i16 = -17;
const UNLOCK_POSITION: i16 = 284;
/// About 5.9 V on a lock, 2.9 V on a bot
const BATTERY_RAW: u16 = 840;

// ----------------------------------------------------------------------------
// Behavior
// ----------------------------------------------------------------------------

/// How the simulated firmware reacts to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralBehavior {
    /// Answer a valid login request
    pub answer_login: bool,
    /// Move and publish a status report after an accepted command
    pub execute_commands: bool,
    /// Result code sent in command responses
    pub command_result: ResultCode,
}

impl Default for PeripheralBehavior {
    fn default() -> Self {
        Self {
            answer_login: true,
            execute_commands: true,
            command_result: ResultCode::Success,
        }
    }
}

// ----------------------------------------------------------------------------
// Simulated Peripheral
// ----------------------------------------------------------------------------

/// Device-side protocol state for one lock or bot
pub struct SimulatedPeripheral {
    address: BleAddress,
    product: ProductModel,
    secret_key: [u8; SECRET_KEY_LEN],
    device_keys: EcdhKeyPair,
    behavior: PeripheralBehavior,
    locked: bool,
    setup_required: bool,
    token: [u8; TOKEN_LEN],
    session_keys: Option<SessionKeys>,
    fragmenter: MessageFragmenter,
    reassembler: MessageReassembler,
    received_commands: Vec<ItemCode>,
    history: Vec<String>,
}

impl SimulatedPeripheral {
    pub fn lock(address: BleAddress) -> Self {
        Self::new(address, ProductModel::Sesame2)
    }

    pub fn bot(address: BleAddress) -> Self {
        Self::new(address, ProductModel::SesameBot)
    }

    /// Create a device with a freshly issued key pair
    pub fn new(address: BleAddress, product: ProductModel) -> Self {
        let mut secret_key = [0u8; SECRET_KEY_LEN];
        OsRng.fill_bytes(&mut secret_key);
        Self {
            address,
            product,
            secret_key,
            device_keys: EcdhKeyPair::generate(&mut OsRng),
            behavior: PeripheralBehavior::default(),
            locked: false,
            setup_required: false,
            token: [0u8; TOKEN_LEN],
            session_keys: None,
            fragmenter: MessageFragmenter::for_ble(),
            reassembler: MessageReassembler::new(Duration::from_secs(1), 1024),
            received_commands: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn with_behavior(mut self, behavior: PeripheralBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    /// Advertise the vendor setup flag
    pub fn with_setup_required(mut self) -> Self {
        self.setup_required = true;
        self
    }

    /// Verify logins but never answer them
    pub fn with_silent_login(mut self) -> Self {
        self.behavior.answer_login = false;
        self
    }

    /// Acknowledge commands but never move
    pub fn with_stalled_motor(mut self) -> Self {
        self.behavior.execute_commands = false;
        self
    }

    pub fn with_command_result(mut self, result: ResultCode) -> Self {
        self.behavior.command_result = result;
        self
    }

    pub fn address(&self) -> BleAddress {
        self.address
    }

    pub fn kind(&self) -> Option<DeviceKind> {
        self.product.device_kind()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Move the mechanism by hand, as a user turning the thumb-turn would
    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn is_logged_in(&self) -> bool {
        self.session_keys.is_some()
    }

    /// Commands received over authenticated sessions, oldest first
    pub fn received_commands(&self) -> &[ItemCode] {
        &self.received_commands
    }

    /// History labels attached to received commands, in order
    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Key material the vendor app would hand to the host
    pub fn key_material(&self) -> Result<KeyMaterial> {
        KeyMaterial::new(self.secret_key, *self.device_keys.public_key_bytes())
    }

    /// Current manufacturer advertisement
    pub fn advertisement(&self) -> RawAdvertisement {
        let flags = AdvertisementFlags {
            locked: self.locked,
            unlocked: !self.locked,
            battery_critical: false,
            setup_required: self.setup_required,
        };
        let mut manufacturer_data = vec![ADVERTISEMENT_TAG, self.product.tag()];
        manufacturer_data.extend_from_slice(self.address.as_bytes());
        manufacturer_data.push(flags.to_byte());

        RawAdvertisement {
            address: self.address,
            local_name: None,
            manufacturer_data,
            rssi: Some(-60),
        }
    }

    // ------------------------------------------------------------------------
    // Link Events
    // ------------------------------------------------------------------------

    /// Start a connection; returns the plaintext token publication
    pub fn on_connect(&mut self) -> Frames {
        self.session_keys = None;
        self.reassembler.discard();
        self.token = generate_token();
        let initial = Notification::publish(ItemCode::Initial, self.token.to_vec());
        self.fragmenter
            .fragment_message(&initial.to_bytes(), SegmentType::Plaintext)
    }

    pub fn on_disconnect(&mut self) {
        self.session_keys = None;
        self.reassembler.discard();
    }

    /// Consume one frame written by the host; returns the messages to notify
    pub fn handle_frame(&mut self, frame: &[u8]) -> Vec<Frames> {
        let message = match self.reassembler.add_segment(frame, Timestamp::now()) {
            Ok(Some(message)) => message,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("Peripheral {} dropping segment: {}", self.address, e);
                return Vec::new();
            }
        };

        match message.segment_type {
            SegmentType::Plaintext => self.handle_login(&message.data).into_iter().collect(),
            SegmentType::Ciphertext => {
                let Some(keys) = self.session_keys.as_mut() else {
                    warn!("Peripheral {} got ciphertext before login", self.address);
                    return Vec::new();
                };
                match keys.decrypt(&message.data) {
                    Ok(plaintext) => self.handle_command(&plaintext),
                    Err(e) => {
                        warn!("Peripheral {} rejecting frame: {}", self.address, e);
                        Vec::new()
                    }
                }
            }
        }
    }

    /// Encrypted status publication, if a session is up
    pub fn publish_status(&mut self) -> Option<Frames> {
        let status = Notification::publish(ItemCode::MechStatus, self.status_bytes().to_vec());
        self.encrypt(&status)
    }

    /// Status publication with one ciphertext bit flipped
    pub fn tampered_status(&mut self) -> Option<Frames> {
        let status = Notification::publish(ItemCode::MechStatus, self.status_bytes().to_vec());
        let mut ciphertext = self.session_keys.as_mut()?.encrypt(&status.to_bytes()).ok()?;
        if let Some(last) = ciphertext.last_mut() {
            *last ^= 0x01;
        }
        Some(
            self.fragmenter
                .fragment_message(&ciphertext, SegmentType::Ciphertext),
        )
    }

    // ------------------------------------------------------------------------
    // Protocol Handling
    // ------------------------------------------------------------------------

    fn handle_login(&mut self, data: &[u8]) -> Option<Frames> {
        let payload = Payload::from_bytes(data).ok()?;
        if payload.op_code() != OpCode::Sync || payload.item_code() != ItemCode::Login {
            debug!("Peripheral {} ignoring plaintext {:?}", self.address, payload.item_code());
            return None;
        }
        let keys = match accept_login(&self.secret_key, &self.device_keys, self.token, payload.data()) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Peripheral {} rejecting login: {}", self.address, e);
                return None;
            }
        };
        self.session_keys = Some(keys);
        if !self.behavior.answer_login {
            return None;
        }

        let login = LoginResponse {
            device_time: (Timestamp::now().as_millis() / 1000) as u32,
            settings: self.settings_bytes(),
            status: self.status_bytes(),
        };
        let response = Notification::response(
            ItemCode::Login,
            OpCode::Sync,
            ResultCode::Success,
            login.to_bytes(),
        );
        self.encrypt(&response)
    }

    fn handle_command(&mut self, plaintext: &[u8]) -> Vec<Frames> {
        let payload = match Payload::from_bytes(plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Peripheral {} got malformed payload: {}", self.address, e);
                return Vec::new();
            }
        };
        let item = payload.item_code();
        if !matches!(
            item,
            ItemCode::Lock | ItemCode::Unlock | ItemCode::Toggle | ItemCode::Click
        ) {
            debug!("Peripheral {} ignoring {:?}", self.address, item);
            return Vec::new();
        }
        self.received_commands.push(item);
        match HistoryTag::from_bytes(payload.data()) {
            Ok(tag) => self.history.push(tag.label().to_string()),
            Err(e) => debug!("Peripheral {} got untagged {:?}: {}", self.address, item, e),
        }

        let result = self.behavior.command_result;
        let response = Notification::response(item, payload.op_code(), result, Vec::new());
        let mut notifications: Vec<Frames> = self.encrypt(&response).into_iter().collect();

        if result.is_success() && self.behavior.execute_commands {
            match item {
                ItemCode::Lock => self.locked = true,
                ItemCode::Unlock => self.locked = false,
                ItemCode::Toggle => self.locked = !self.locked,
                _ => {}
            }
            notifications.extend(self.publish_status());
        }
        notifications
    }

    fn encrypt(&mut self, notification: &Notification) -> Option<Frames> {
        let keys = self.session_keys.as_mut()?;
        match keys.encrypt(&notification.to_bytes()) {
            Ok(ciphertext) => Some(
                self.fragmenter
                    .fragment_message(&ciphertext, SegmentType::Ciphertext),
            ),
            Err(e) => {
                warn!("Peripheral {} cannot encrypt: {}", self.address, e);
                None
            }
        }
    }

    fn status_bytes(&self) -> RawMechStatus {
        match self.kind() {
            Some(DeviceKind::Bot) => BotMechStatus {
                battery_raw: BATTERY_RAW,
                motor_status: 0,
                in_lock_range: self.locked,
                in_unlock_range: !self.locked,
                battery_critical: false,
            }
            .to_bytes(),
            _ => LockMechStatus {
                battery_raw: BATTERY_RAW,
                target: TARGET_IDLE,
                position: if self.locked { LOCK_POSITION } else { UNLOCK_POSITION },
                retcode: 0,
                in_lock_range: self.locked,
                in_unlock_range: !self.locked,
                battery_critical: false,
            }
            .to_bytes(),
        }
    }

    fn settings_bytes(&self) -> RawMechSettings {
        match self.kind() {
            Some(DeviceKind::Bot) => BotMechSettings {
                reversed: false,
                lock_sec: 3,
                unlock_sec: 3,
                click_lock_sec: 1,
                click_hold_sec: 1,
                click_unlock_sec: 1,
                button_mode: BotButtonMode::Click,
            }
            .to_bytes(),
            _ => LockMechSettings {
                lock_position: LOCK_POSITION,
                unlock_position: UNLOCK_POSITION,
            }
            .to_bytes(),
        }
    }
}

impl std::fmt::Debug for SimulatedPeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedPeripheral")
            .field("address", &self.address)
            .field("product", &self.product)
            .field("locked", &self.locked)
            .field("logged_in", &self.is_logged_in())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
