//! Notification-driven device model
//!
//! Mechanical status changes only through [`DeviceModel::apply_status`] and
//! [`DeviceModel::apply_login`], which decode authenticated payloads and apply them
//! last-writer-wins on the [`StatusSequence`] of the frame that carried them.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::advertisement::{AdvertisedLockState, Advertisement};
use crate::protocol::mech::{
    BotMechSettings, BotMechStatus, LockMechSettings, LockMechStatus, LoginResponse,
};
use crate::types::{DeviceIdentity, DeviceKind, Timestamp};
use crate::Result;

// ----------------------------------------------------------------------------
// Status Types
// ----------------------------------------------------------------------------

/// Physical lock state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockState {
    Locked,
    Unlocked,
    /// Between ranges, or not reported
    Moving,
}

impl LockState {
    fn from_ranges(in_lock_range: bool, in_unlock_range: bool) -> Self {
        match (in_lock_range, in_unlock_range) {
            (true, false) => LockState::Locked,
            (false, true) => LockState::Unlocked,
            _ => LockState::Moving,
        }
    }
}

/// What the mechanism is currently trying to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intention {
    Idle,
    Locking,
    Unlocking,
    Holding,
    MovingToUnknownTarget,
}

/// Ordering key of a status report: connection epoch, then authenticated frame counter
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StatusSequence {
    pub epoch: u32,
    pub counter: u64,
}

impl StatusSequence {
    pub fn new(epoch: u32, counter: u64) -> Self {
        Self { epoch, counter }
    }
}

/// Last validated mechanical status of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MechanicalStatus {
    pub lock_state: LockState,
    pub battery_voltage: f32,
    pub battery_percentage: u8,
    pub battery_critical: bool,
    /// Handle angle, locks only
    pub position: Option<i16>,
    /// Angle the motor is driving towards, `None` when idle
    pub target: Option<i16>,
    /// Raw motor state, bots only
    pub motor_status: Option<u8>,
    pub intention: Intention,
    pub sequence: StatusSequence,
    pub updated_at: Timestamp,
}

/// Calibration reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MechanicalSettings {
    Lock(LockMechSettings),
    Bot(BotMechSettings),
}

/// Read-only view of a device model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: Option<MechanicalStatus>,
    /// Set after an authentication failure until a new validated status arrives
    pub stale: bool,
    /// Coarse state from the last advertisement
    pub advertised: Option<AdvertisedLockState>,
    pub settings: Option<MechanicalSettings>,
}

// ----------------------------------------------------------------------------
// Device Model
// ----------------------------------------------------------------------------

/// Mutable state of one lock or bot
#[derive(Debug, Clone)]
pub struct DeviceModel {
    identity: DeviceIdentity,
    kind: DeviceKind,
    status: Option<MechanicalStatus>,
    settings: Option<MechanicalSettings>,
    stale: bool,
    advertised: Option<AdvertisedLockState>,
    device_time: Option<u32>,
    epoch: u32,
}

impl DeviceModel {
    pub fn new(identity: DeviceIdentity, kind: DeviceKind) -> Self {
        Self {
            identity,
            kind,
            status: None,
            settings: None,
            stale: false,
            advertised: None,
            device_time: None,
            epoch: 0,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn current_status(&self) -> Option<&MechanicalStatus> {
        self.status.as_ref()
    }

    pub fn settings(&self) -> Option<&MechanicalSettings> {
        self.settings.as_ref()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Device clock from the last login, seconds since Unix epoch
    pub fn device_time(&self) -> Option<u32> {
        self.device_time
    }

    /// Start a new connection epoch; returns its number
    pub fn begin_epoch(&mut self) -> u32 {
        self.epoch = self.epoch.wrapping_add(1);
        self.epoch
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Whether a lock has been calibrated; bots need no calibration
    pub fn is_configured(&self) -> bool {
        match (self.kind, &self.settings) {
            (DeviceKind::Bot, _) => true,
            (DeviceKind::Lock, Some(MechanicalSettings::Lock(settings))) => {
                settings.is_configured()
            }
            (DeviceKind::Lock, _) => false,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status.clone(),
            stale: self.stale,
            advertised: self.advertised,
            settings: self.settings,
        }
    }

    /// Distrust the current status after an authentication failure
    pub fn mark_stale(&mut self) {
        if !self.stale {
            warn!("Marking status of {} stale", self.identity);
        }
        self.stale = true;
    }

    /// Record the coarse state from an advertisement
    pub fn observe_advertisement(&mut self, advertisement: &Advertisement) {
        if advertisement.identity.address == self.identity.address {
            self.advertised = Some(advertisement.lock_state);
        }
    }

    /// Apply mechanical settings from a login response or publish
    pub fn apply_settings(&mut self, raw: &[u8]) -> Result<()> {
        let settings = match self.kind {
            DeviceKind::Lock => MechanicalSettings::Lock(LockMechSettings::from_bytes(raw)?),
            DeviceKind::Bot => MechanicalSettings::Bot(BotMechSettings::from_bytes(raw)?),
        };
        debug!("Settings for {}: {:?}", self.identity, settings);
        self.settings = Some(settings);
        Ok(())
    }

    /// Apply a status report; returns the new status or `None` if the report is not
    /// newer than the current one
    pub fn apply_status(
        &mut self,
        raw: &[u8],
        sequence: StatusSequence,
        now: Timestamp,
    ) -> Result<Option<MechanicalStatus>> {
        if let Some(current) = &self.status {
            if sequence <= current.sequence {
                debug!(
                    "Ignoring status {:?} for {}: not newer than {:?}",
                    sequence, self.identity, current.sequence
                );
                return Ok(None);
            }
        }

        let status = match self.kind {
            DeviceKind::Lock => self.decode_lock(LockMechStatus::from_bytes(raw)?, sequence, now),
            DeviceKind::Bot => decode_bot(BotMechStatus::from_bytes(raw)?, sequence, now),
        };
        self.status = Some(status.clone());
        self.stale = false;
        Ok(Some(status))
    }

    /// Apply the settings and status carried by a successful login
    pub fn apply_login(
        &mut self,
        login: &LoginResponse,
        sequence: StatusSequence,
        now: Timestamp,
    ) -> Result<Option<MechanicalStatus>> {
        self.device_time = Some(login.device_time);
        self.apply_settings(&login.settings)?;
        self.apply_status(&login.status, sequence, now)
    }

    fn decode_lock(
        &self,
        raw: LockMechStatus,
        sequence: StatusSequence,
        now: Timestamp,
    ) -> MechanicalStatus {
        let intention = if raw.is_idle() {
            Intention::Idle
        } else {
            match &self.settings {
                Some(MechanicalSettings::Lock(s)) if raw.target == s.lock_position => {
                    Intention::Locking
                }
                Some(MechanicalSettings::Lock(s)) if raw.target == s.unlock_position => {
                    Intention::Unlocking
                }
                _ => Intention::MovingToUnknownTarget,
            }
        };

        MechanicalStatus {
            lock_state: LockState::from_ranges(raw.in_lock_range, raw.in_unlock_range),
            battery_voltage: raw.battery_voltage(),
            battery_percentage: raw.battery_percentage(),
            battery_critical: raw.battery_critical,
            position: Some(raw.position),
            target: (!raw.is_idle()).then_some(raw.target),
            motor_status: None,
            intention,
            sequence,
            updated_at: now,
        }
    }
}

fn decode_bot(raw: BotMechStatus, sequence: StatusSequence, now: Timestamp) -> MechanicalStatus {
    let intention = match raw.motor_status {
        0 => Intention::Idle,
        1 => Intention::Locking,
        2 => Intention::Holding,
        3 => Intention::Unlocking,
        _ => Intention::MovingToUnknownTarget,
    };

    MechanicalStatus {
        lock_state: LockState::from_ranges(raw.in_lock_range, raw.in_unlock_range),
        battery_voltage: raw.battery_voltage(),
        battery_percentage: raw.battery_percentage(),
        battery_critical: raw.battery_critical,
        position: None,
        target: None,
        motor_status: Some(raw.motor_status),
        intention,
        sequence,
        updated_at: now,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
