//! Mechanical status, settings and login response layouts

use serde::{Deserialize, Serialize};

use crate::{PacketError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Encoded mechanical status length
pub const MECH_STATUS_LEN: usize = 8;
/// Encoded mechanical settings length
pub const MECH_SETTINGS_LEN: usize = 12;
/// Encoded login response length
pub const LOGIN_RESPONSE_LEN: usize = 28;
/// Encoded history tag length
pub const HISTORY_TAG_LEN: usize = 22;

/// Target value reported by an idle lock
pub const TARGET_IDLE: i16 = i16::MIN;

const FLAG_LOCK_RANGE: u8 = 0x02;
const FLAG_UNLOCK_RANGE: u8 = 0x04;
const FLAG_BATTERY_CRITICAL: u8 = 0x20;

const VOLTAGE_CURVE: [f32; 10] = [6.0, 5.8, 5.7, 5.6, 5.4, 5.2, 5.1, 5.0, 4.8, 4.6];
const PERCENT_CURVE: [f32; 10] = [100.0, 50.0, 40.0, 32.0, 21.0, 13.0, 10.0, 7.0, 3.0, 0.0];

pub type RawMechStatus = [u8; MECH_STATUS_LEN];
pub type RawMechSettings = [u8; MECH_SETTINGS_LEN];

fn require(data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(PacketError::PayloadTooSmall {
            expected,
            actual: data.len(),
        }
        .into());
    }
    Ok(())
}

fn flags(in_lock_range: bool, in_unlock_range: bool, battery_critical: bool) -> u8 {
    let mut flags = 0;
    if in_lock_range {
        flags |= FLAG_LOCK_RANGE;
    }
    if in_unlock_range {
        flags |= FLAG_UNLOCK_RANGE;
    }
    if battery_critical {
        flags |= FLAG_BATTERY_CRITICAL;
    }
    flags
}

// ----------------------------------------------------------------------------
// Battery
// ----------------------------------------------------------------------------

/// Remaining charge for a 6 V pack, interpolated along the discharge curve
pub fn battery_percentage(voltage: f32) -> u8 {
    if voltage >= VOLTAGE_CURVE[0] {
        return 100;
    }
    if voltage <= VOLTAGE_CURVE[VOLTAGE_CURVE.len() - 1] {
        return 0;
    }
    for i in 0..VOLTAGE_CURVE.len() - 1 {
        let (upper, lower) = (VOLTAGE_CURVE[i], VOLTAGE_CURVE[i + 1]);
        if voltage <= upper && voltage > lower {
            let fraction = (voltage - lower) / (upper - lower);
            let pct = PERCENT_CURVE[i + 1] + fraction * (PERCENT_CURVE[i] - PERCENT_CURVE[i + 1]);
            return pct as u8;
        }
    }
    0
}

// ----------------------------------------------------------------------------
// Lock
// ----------------------------------------------------------------------------

/// Mechanical status reported by a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMechStatus {
    pub battery_raw: u16,
    pub target: i16,
    pub position: i16,
    pub retcode: u8,
    pub in_lock_range: bool,
    pub in_unlock_range: bool,
    pub battery_critical: bool,
}

impl LockMechStatus {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        require(data, MECH_STATUS_LEN)?;
        Ok(Self {
            battery_raw: u16::from_le_bytes([data[0], data[1]]),
            target: i16::from_le_bytes([data[2], data[3]]),
            position: i16::from_le_bytes([data[4], data[5]]),
            retcode: data[6],
            in_lock_range: data[7] & FLAG_LOCK_RANGE != 0,
            in_unlock_range: data[7] & FLAG_UNLOCK_RANGE != 0,
            battery_critical: data[7] & FLAG_BATTERY_CRITICAL != 0,
        })
    }

    pub fn to_bytes(&self) -> RawMechStatus {
        let mut raw = [0u8; MECH_STATUS_LEN];
        raw[0..2].copy_from_slice(&self.battery_raw.to_le_bytes());
        raw[2..4].copy_from_slice(&self.target.to_le_bytes());
        raw[4..6].copy_from_slice(&self.position.to_le_bytes());
        raw[6] = self.retcode;
        raw[7] = flags(self.in_lock_range, self.in_unlock_range, self.battery_critical);
        raw
    }

    pub fn battery_voltage(&self) -> f32 {
        self.battery_raw as f32 * 7.2 / 1023.0
    }

    pub fn battery_percentage(&self) -> u8 {
        battery_percentage(self.battery_voltage())
    }

    pub fn is_idle(&self) -> bool {
        self.target == TARGET_IDLE
    }
}

/// Calibrated lock and unlock positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMechSettings {
    pub lock_position: i16,
    pub unlock_position: i16,
}

impl LockMechSettings {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        require(data, 4)?;
        Ok(Self {
            lock_position: i16::from_le_bytes([data[0], data[1]]),
            unlock_position: i16::from_le_bytes([data[2], data[3]]),
        })
    }

    pub fn to_bytes(&self) -> RawMechSettings {
        let mut raw = [0u8; MECH_SETTINGS_LEN];
        raw[0..2].copy_from_slice(&self.lock_position.to_le_bytes());
        raw[2..4].copy_from_slice(&self.unlock_position.to_le_bytes());
        raw
    }

    /// Calibrated iff the two positions differ
    pub fn is_configured(&self) -> bool {
        self.lock_position != self.unlock_position
    }
}

// ----------------------------------------------------------------------------
// Bot
// ----------------------------------------------------------------------------

/// Mechanical status reported by a bot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotMechStatus {
    pub battery_raw: u16,
    pub motor_status: u8,
    pub in_lock_range: bool,
    pub in_unlock_range: bool,
    pub battery_critical: bool,
}

impl BotMechStatus {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        require(data, MECH_STATUS_LEN)?;
        Ok(Self {
            battery_raw: u16::from_le_bytes([data[0], data[1]]),
            motor_status: data[4],
            in_lock_range: data[7] & FLAG_LOCK_RANGE != 0,
            in_unlock_range: data[7] & FLAG_UNLOCK_RANGE != 0,
            battery_critical: data[7] & FLAG_BATTERY_CRITICAL != 0,
        })
    }

    pub fn to_bytes(&self) -> RawMechStatus {
        let mut raw = [0u8; MECH_STATUS_LEN];
        raw[0..2].copy_from_slice(&self.battery_raw.to_le_bytes());
        raw[4] = self.motor_status;
        raw[7] = flags(self.in_lock_range, self.in_unlock_range, self.battery_critical);
        raw
    }

    /// Bots run on a 3 V cell
    pub fn battery_voltage(&self) -> f32 {
        self.battery_raw as f32 * 3.6 / 1023.0
    }

    pub fn battery_percentage(&self) -> u8 {
        battery_percentage(self.battery_voltage() * 2.0)
    }
}

/// Action bound to the bot's physical button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BotButtonMode {
    Click,
    Toggle,
    Other(u8),
}

impl From<u8> for BotButtonMode {
    fn from(value: u8) -> Self {
        match value {
            0 => BotButtonMode::Click,
            1 => BotButtonMode::Toggle,
            other => BotButtonMode::Other(other),
        }
    }
}

impl From<BotButtonMode> for u8 {
    fn from(mode: BotButtonMode) -> u8 {
        match mode {
            BotButtonMode::Click => 0,
            BotButtonMode::Toggle => 1,
            BotButtonMode::Other(other) => other,
        }
    }
}

/// Arm timings and direction of a bot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotMechSettings {
    pub reversed: bool,
    pub lock_sec: u8,
    pub unlock_sec: u8,
    pub click_lock_sec: u8,
    pub click_hold_sec: u8,
    pub click_unlock_sec: u8,
    pub button_mode: BotButtonMode,
}

impl BotMechSettings {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        require(data, 7)?;
        Ok(Self {
            reversed: data[0] == 1,
            lock_sec: data[1],
            unlock_sec: data[2],
            click_lock_sec: data[3],
            click_hold_sec: data[4],
            click_unlock_sec: data[5],
            button_mode: BotButtonMode::from(data[6]),
        })
    }

    pub fn to_bytes(&self) -> RawMechSettings {
        let mut raw = [0u8; MECH_SETTINGS_LEN];
        raw[0] = u8::from(self.reversed);
        raw[1] = self.lock_sec;
        raw[2] = self.unlock_sec;
        raw[3] = self.click_lock_sec;
        raw[4] = self.click_hold_sec;
        raw[5] = self.click_unlock_sec;
        raw[6] = self.button_mode.into();
        raw
    }
}

// ----------------------------------------------------------------------------
// Login Response
// ----------------------------------------------------------------------------

/// Body of a successful login response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginResponse {
    /// Device clock, seconds since Unix epoch
    pub device_time: u32,
    pub settings: RawMechSettings,
    pub status: RawMechStatus,
}

impl LoginResponse {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        require(data, LOGIN_RESPONSE_LEN)?;
        let mut settings = [0u8; MECH_SETTINGS_LEN];
        settings.copy_from_slice(&data[8..20]);
        let mut status = [0u8; MECH_STATUS_LEN];
        status.copy_from_slice(&data[20..28]);
        Ok(Self {
            device_time: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            settings,
            status,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(LOGIN_RESPONSE_LEN);
        bytes.extend_from_slice(&self.device_time.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(&self.settings);
        bytes.extend_from_slice(&self.status);
        bytes
    }
}

// ----------------------------------------------------------------------------
// History Tag
// ----------------------------------------------------------------------------

/// Label stored in the device history alongside an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryTag([u8; HISTORY_TAG_LEN]);

impl HistoryTag {
    /// Length byte, up to 21 bytes of UTF-8 cut on a character boundary, zero padding
    pub fn new(label: &str) -> Self {
        let max_body = HISTORY_TAG_LEN - 1;
        let mut end = label.len().min(max_body);
        while !label.is_char_boundary(end) {
            end -= 1;
        }
        let body = &label.as_bytes()[..end];

        let mut raw = [0u8; HISTORY_TAG_LEN];
        raw[0] = body.len() as u8;
        raw[1..=body.len()].copy_from_slice(body);
        Self(raw)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        require(data, HISTORY_TAG_LEN)?;
        let mut raw = [0u8; HISTORY_TAG_LEN];
        raw.copy_from_slice(&data[..HISTORY_TAG_LEN]);
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; HISTORY_TAG_LEN] {
        &self.0
    }

    /// Label text; empty if the body is not UTF-8
    pub fn label(&self) -> &str {
        let len = usize::from(self.0[0]).min(HISTORY_TAG_LEN - 1);
        core::str::from_utf8(&self.0[1..=len]).unwrap_or("")
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(hex_str: &str) -> Vec<u8> {
        hex::decode(hex_str).unwrap()
    }

    #[test]
    fn test_lock_status_locked() {
        let status = LockMechStatus::from_bytes(&decode("60030080f3ff0002")).unwrap();
        assert_eq!(status.battery_percentage(), 100);
        assert!((status.battery_voltage() - 6.0809).abs() < 0.001);
        assert_eq!(status.position, -13);
        assert_eq!(status.target, TARGET_IDLE);
        assert!(status.is_idle());
        assert!(status.in_lock_range);
        assert!(!status.in_unlock_range);
        assert_eq!(hex::encode(status.to_bytes()), "60030080f3ff0002");
    }

    #[test]
    fn test_lock_status_unlocked() {
        let status = LockMechStatus::from_bytes(&decode("5c030503e3020004")).unwrap();
        assert_eq!(status.position, 739);
        assert_eq!(status.target, 773);
        assert!(!status.in_lock_range);
        assert!(status.in_unlock_range);
    }

    #[test]
    fn test_battery_curve() {
        let low = LockMechStatus::from_bytes(&decode("30030080f3ff0002")).unwrap();
        assert_eq!(low.battery_percentage(), 44);
        let empty = LockMechStatus::from_bytes(&decode("48020080f3ff0002")).unwrap();
        assert_eq!(empty.battery_percentage(), 0);
        assert_eq!(battery_percentage(6.5), 100);
        assert_eq!(battery_percentage(5.5), 26);
    }

    #[test]
    fn test_lock_settings() {
        let settings = LockMechSettings::from_bytes(&decode("efff1c0159ff85008600b201")).unwrap();
        assert_eq!(settings.lock_position, -17);
        assert_eq!(settings.unlock_position, 284);
        assert!(settings.is_configured());
        assert!(!LockMechSettings::from_bytes(&[0; 4]).unwrap().is_configured());
    }

    #[test]
    fn test_bot_status() {
        let locked = BotMechStatus::from_bytes(&decode("5503000000000102")).unwrap();
        assert_eq!(locked.battery_percentage(), 100);
        assert!((locked.battery_voltage() - 3.0017).abs() < 0.001);
        assert!(locked.in_lock_range);
        assert_eq!(locked.motor_status, 0);

        let low = BotMechStatus::from_bytes(&decode("3003000000000102")).unwrap();
        assert_eq!(low.battery_percentage(), 44);
        let empty = BotMechStatus::from_bytes(&decode("4802000000000102")).unwrap();
        assert_eq!(empty.battery_percentage(), 0);
    }

    #[test]
    fn test_bot_settings() {
        let settings = BotMechSettings::from_bytes(&decode("010a0a0a140f000000000000")).unwrap();
        assert!(settings.reversed);
        assert_eq!(settings.lock_sec, 10);
        assert_eq!(settings.click_hold_sec, 20);
        assert_eq!(settings.click_unlock_sec, 15);
        assert_eq!(settings.button_mode, BotButtonMode::Click);
        assert_eq!(hex::encode(settings.to_bytes()), "010a0a0a140f000000000000");
    }

    #[test]
    fn test_bot_login_response() {
        let login = LoginResponse::from_bytes(&decode(
            "4b41fe6000008001010a0a0a140f0000000000005803000000000004",
        ))
        .unwrap();
        assert_eq!(login.device_time, 0x60fe414b);
        let settings = BotMechSettings::from_bytes(&login.settings).unwrap();
        assert_eq!(settings.click_unlock_sec, 15);
        let status = BotMechStatus::from_bytes(&login.status).unwrap();
        assert_eq!(status.motor_status, 0);
        assert!(status.in_unlock_range);
        assert!(LoginResponse::from_bytes(&[0; 27]).is_err());
    }

    #[test]
    fn test_history_tag() {
        let tag = HistoryTag::new("適当な日本語で OK");
        assert_eq!(
            hex::encode(tag.as_bytes()),
            "15e981a9e5bd93e381aae697a5e69cace8aa9ee381a7"
        );

        let short = HistoryTag::new("abc");
        assert_eq!(&short.as_bytes()[..4], &[3, b'a', b'b', b'c']);
        assert!(short.as_bytes()[4..].iter().all(|b| *b == 0));

        let decoded = HistoryTag::from_bytes(tag.as_bytes()).unwrap();
        assert_eq!(decoded.label(), "適当な日本語で");
        assert!(HistoryTag::from_bytes(&[3, b'a']).is_err());
    }
}
