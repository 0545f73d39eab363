//! Command Dispatcher
//!
//! Validates lock/unlock/toggle/click requests against the session and device
//! model, builds their payloads, and tracks the single outstanding command until
//! a status report, a rejecting response, a timeout or a disconnect resolves it.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::model::{DeviceModel, LockState, MechanicalStatus, StatusSequence};
use crate::protocol::{HistoryTag, ItemCode, OpCode, Payload, Response};
use crate::session::SessionState;
use crate::types::{DeviceKind, Timestamp};
use crate::{Result, SesameError};

// ----------------------------------------------------------------------------
// Command Types
// ----------------------------------------------------------------------------

/// Operation requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Lock,
    Unlock,
    /// Lock if unlocked, unlock if locked
    Toggle,
    /// Press and release, bots only
    Click,
}

impl CommandKind {
    /// Whether a device of `kind` accepts this command
    pub fn supported_by(self, kind: DeviceKind) -> bool {
        match self {
            CommandKind::Lock | CommandKind::Unlock | CommandKind::Toggle => true,
            CommandKind::Click => kind == DeviceKind::Bot,
        }
    }
}

/// Command waiting for its resolving status report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    /// As requested by the caller
    pub command: CommandKind,
    /// After toggle resolution
    pub resolved: CommandKind,
    pub item_code: ItemCode,
    /// Lock state that completes the command; `None` for clicks
    pub expected: Option<LockState>,
    pub issued_at: Timestamp,
    pub deadline: Timestamp,
    /// Sequence of the status current at issue time
    pub baseline: Option<StatusSequence>,
}

/// Payload ready for encryption plus the bookkeeping to track once it is sent
#[derive(Debug, Clone)]
pub struct PreparedCommand {
    pub payload: Payload,
    pub pending: PendingCommand,
}

/// Final outcome of a command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub command: CommandKind,
    pub result: Result<MechanicalStatus>,
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

/// One-at-a-time command tracker for a device session
#[derive(Debug)]
pub struct CommandDispatcher {
    kind: DeviceKind,
    pending: Option<PendingCommand>,
    timeout_ms: u64,
    history_tag: HistoryTag,
}

impl CommandDispatcher {
    pub fn new(kind: DeviceKind, config: &SessionConfig) -> Self {
        Self {
            kind,
            pending: None,
            timeout_ms: config.command_timeout.as_millis() as u64,
            history_tag: HistoryTag::new(&config.history_tag),
        }
    }

    pub fn pending(&self) -> Option<&PendingCommand> {
        self.pending.as_ref()
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Check preconditions and build the payload for `command`
    ///
    /// Nothing is tracked until [`track`](Self::track) is called, so a failure
    /// between preparing and sending leaves the dispatcher untouched.
    pub fn prepare(
        &self,
        command: CommandKind,
        state: &SessionState,
        model: &DeviceModel,
        now: Timestamp,
    ) -> Result<PreparedCommand> {
        self.prepare_with_tag(command, &self.history_tag, state, model, now)
    }

    /// As [`prepare`](Self::prepare), labelling the operation with `history_tag`
    /// instead of the session default
    pub fn prepare_with_tag(
        &self,
        command: CommandKind,
        history_tag: &HistoryTag,
        state: &SessionState,
        model: &DeviceModel,
        now: Timestamp,
    ) -> Result<PreparedCommand> {
        if !state.is_ready() {
            return Err(SesameError::NotReady {
                state: state.state_name(),
            });
        }
        if let Some(pending) = &self.pending {
            return Err(SesameError::CommandInFlight {
                pending: pending.command,
            });
        }
        if !command.supported_by(self.kind) {
            return Err(SesameError::UnsupportedCommand {
                command,
                kind: self.kind,
            });
        }
        if !model.is_configured() {
            return Err(SesameError::NotConfigured);
        }

        let resolved = match command {
            CommandKind::Toggle => resolve_toggle(model)?,
            other => other,
        };
        let (item_code, expected) = match resolved {
            CommandKind::Lock => (ItemCode::Lock, Some(LockState::Locked)),
            CommandKind::Unlock => (ItemCode::Unlock, Some(LockState::Unlocked)),
            _ => (ItemCode::Click, None),
        };

        Ok(PreparedCommand {
            payload: Payload::new(OpCode::Async, item_code, history_tag.as_bytes().to_vec()),
            pending: PendingCommand {
                command,
                resolved,
                item_code,
                expected,
                issued_at: now,
                deadline: now + self.timeout_ms,
                baseline: model.current_status().map(|s| s.sequence),
            },
        })
    }

    /// Start tracking a command whose payload has been handed to the transport
    pub fn track(&mut self, pending: PendingCommand) {
        info!("Command {:?} in flight as {:?}", pending.command, pending.item_code);
        self.pending = Some(pending);
    }

    /// Resolve the pending command if `status` shows its end state
    pub fn on_status(&mut self, status: &MechanicalStatus) -> Option<CommandOutcome> {
        let pending = self.pending.as_ref()?;
        if pending.baseline.is_some_and(|baseline| status.sequence <= baseline) {
            return None;
        }
        let reached = match pending.expected {
            Some(expected) => status.lock_state == expected,
            None => true,
        };
        if !reached {
            debug!(
                "Status {:?} does not complete {:?} yet",
                status.lock_state, pending.command
            );
            return None;
        }

        let pending = self.pending.take()?;
        info!("Command {:?} completed", pending.command);
        Some(CommandOutcome {
            command: pending.command,
            result: Ok(status.clone()),
        })
    }

    /// Fail the pending command on a non-success response to it
    pub fn on_response(&mut self, response: &Response) -> Option<CommandOutcome> {
        let pending = self.pending.as_ref()?;
        if response.item_code != pending.item_code {
            return None;
        }
        if response.result.is_success() {
            debug!("Device accepted {:?}, awaiting status", pending.command);
            return None;
        }

        let pending = self.pending.take()?;
        warn!(
            "Device rejected {:?}: {:?}",
            pending.command, response.result
        );
        Some(CommandOutcome {
            command: pending.command,
            result: Err(SesameError::CommandRejected {
                command: pending.command,
                result: response.result,
            }),
        })
    }

    /// Fail the pending command once its deadline has passed
    pub fn expire(&mut self, now: Timestamp) -> Option<CommandOutcome> {
        if self.pending.as_ref()?.deadline > now {
            return None;
        }
        let pending = self.pending.take()?;
        warn!("Command {:?} timed out", pending.command);
        Some(CommandOutcome {
            command: pending.command,
            result: Err(SesameError::CommandTimeout {
                command: pending.command,
                timeout_ms: self.timeout_ms,
            }),
        })
    }

    /// Fail the pending command with `error`
    pub fn fail_pending(&mut self, error: SesameError) -> Option<CommandOutcome> {
        let pending = self.pending.take()?;
        Some(CommandOutcome {
            command: pending.command,
            result: Err(error),
        })
    }
}

fn resolve_toggle(model: &DeviceModel) -> Result<CommandKind> {
    if model.is_stale() {
        return Err(SesameError::StatusUnknown);
    }
    match model.current_status().map(|s| s.lock_state) {
        Some(LockState::Locked) => Ok(CommandKind::Unlock),
        Some(LockState::Unlocked) => Ok(CommandKind::Lock),
        _ => Err(SesameError::StatusUnknown),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResultCode;
    use crate::types::{BleAddress, DeviceIdentity};

    const LOCKED: &str = "60030080f3ff0002";
    const UNLOCKED: &str = "5c030080e3020004";

    fn ready() -> SessionState {
        SessionState::Ready {
            since: Timestamp::new(0),
        }
    }

    fn create_test_model(kind: DeviceKind, status: Option<&str>) -> DeviceModel {
        let mut model =
            DeviceModel::new(DeviceIdentity::new(BleAddress::new([1, 2, 3, 4, 5, 6])), kind);
        if kind == DeviceKind::Lock {
            model.apply_settings(&hex::decode("efff1c01").unwrap()).unwrap();
        }
        if let Some(raw) = status {
            model
                .apply_status(
                    &hex::decode(raw).unwrap(),
                    StatusSequence::new(1, 0),
                    Timestamp::new(0),
                )
                .unwrap();
        }
        model
    }

    fn create_test_dispatcher(kind: DeviceKind) -> CommandDispatcher {
        CommandDispatcher::new(kind, &SessionConfig::testing())
    }

    fn status_from(model: &mut DeviceModel, raw: &str, counter: u64) -> MechanicalStatus {
        model
            .apply_status(
                &hex::decode(raw).unwrap(),
                StatusSequence::new(1, counter),
                Timestamp::new(counter),
            )
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_not_ready() {
        let dispatcher = create_test_dispatcher(DeviceKind::Lock);
        let model = create_test_model(DeviceKind::Lock, Some(UNLOCKED));
        for state in [
            SessionState::Idle,
            SessionState::Connected {
                since: Timestamp::new(0),
            },
            SessionState::Disconnected {
                at: Timestamp::new(0),
            },
        ] {
            let err = dispatcher
                .prepare(CommandKind::Lock, &state, &model, Timestamp::new(1))
                .unwrap_err();
            assert!(matches!(err, SesameError::NotReady { .. }));
        }
    }

    #[test]
    fn test_lock_payload() {
        let dispatcher = create_test_dispatcher(DeviceKind::Lock);
        let model = create_test_model(DeviceKind::Lock, Some(UNLOCKED));
        let prepared = dispatcher
            .prepare(CommandKind::Lock, &ready(), &model, Timestamp::new(100))
            .unwrap();

        let bytes = prepared.payload.to_bytes();
        assert_eq!(&bytes[..2], &[0x06, 0x52]);
        assert_eq!(bytes.len(), 24);
        assert_eq!(bytes[2] as usize, SessionConfig::testing().history_tag.len());
        assert_eq!(prepared.pending.expected, Some(LockState::Locked));
        assert_eq!(prepared.pending.deadline, Timestamp::new(600));
    }

    #[test]
    fn test_per_command_history_tag() {
        let dispatcher = create_test_dispatcher(DeviceKind::Lock);
        let model = create_test_model(DeviceKind::Lock, Some(UNLOCKED));
        let prepared = dispatcher
            .prepare_with_tag(
                CommandKind::Lock,
                &HistoryTag::new("guest"),
                &ready(),
                &model,
                Timestamp::new(0),
            )
            .unwrap();

        let tag = HistoryTag::from_bytes(prepared.payload.data()).unwrap();
        assert_eq!(tag.label(), "guest");
        // the session default is untouched
        let default = dispatcher
            .prepare(CommandKind::Lock, &ready(), &model, Timestamp::new(0))
            .unwrap();
        assert_eq!(
            HistoryTag::from_bytes(default.payload.data()).unwrap().label(),
            SessionConfig::testing().history_tag
        );
    }

    #[test]
    fn test_command_in_flight() {
        let mut dispatcher = create_test_dispatcher(DeviceKind::Lock);
        let model = create_test_model(DeviceKind::Lock, Some(UNLOCKED));
        let prepared = dispatcher
            .prepare(CommandKind::Lock, &ready(), &model, Timestamp::new(0))
            .unwrap();
        dispatcher.track(prepared.pending);

        let err = dispatcher
            .prepare(CommandKind::Lock, &ready(), &model, Timestamp::new(1))
            .unwrap_err();
        assert_eq!(
            err,
            SesameError::CommandInFlight {
                pending: CommandKind::Lock
            }
        );
    }

    #[test]
    fn test_toggle_resolution() {
        let dispatcher = create_test_dispatcher(DeviceKind::Lock);

        let locked = create_test_model(DeviceKind::Lock, Some(LOCKED));
        let prepared = dispatcher
            .prepare(CommandKind::Toggle, &ready(), &locked, Timestamp::new(0))
            .unwrap();
        assert_eq!(prepared.pending.resolved, CommandKind::Unlock);
        assert_eq!(prepared.payload.item_code(), ItemCode::Unlock);

        let unknown = create_test_model(DeviceKind::Lock, None);
        assert_eq!(
            dispatcher
                .prepare(CommandKind::Toggle, &ready(), &unknown, Timestamp::new(0))
                .unwrap_err(),
            SesameError::StatusUnknown
        );

        let mut stale = create_test_model(DeviceKind::Lock, Some(LOCKED));
        stale.mark_stale();
        assert_eq!(
            dispatcher
                .prepare(CommandKind::Toggle, &ready(), &stale, Timestamp::new(0))
                .unwrap_err(),
            SesameError::StatusUnknown
        );
    }

    #[test]
    fn test_click_only_on_bots() {
        let lock = create_test_dispatcher(DeviceKind::Lock);
        let model = create_test_model(DeviceKind::Lock, Some(LOCKED));
        assert!(matches!(
            lock.prepare(CommandKind::Click, &ready(), &model, Timestamp::new(0)),
            Err(SesameError::UnsupportedCommand { .. })
        ));

        let bot = create_test_dispatcher(DeviceKind::Bot);
        let model = create_test_model(DeviceKind::Bot, None);
        let prepared = bot
            .prepare(CommandKind::Click, &ready(), &model, Timestamp::new(0))
            .unwrap();
        assert_eq!(prepared.payload.item_code(), ItemCode::Click);
        assert_eq!(prepared.pending.expected, None);
    }

    #[test]
    fn test_unconfigured_lock() {
        let dispatcher = create_test_dispatcher(DeviceKind::Lock);
        let model =
            DeviceModel::new(DeviceIdentity::new(BleAddress::new([0; 6])), DeviceKind::Lock);
        assert_eq!(
            dispatcher
                .prepare(CommandKind::Unlock, &ready(), &model, Timestamp::new(0))
                .unwrap_err(),
            SesameError::NotConfigured
        );
    }

    #[test]
    fn test_resolves_on_expected_state() {
        let mut dispatcher = create_test_dispatcher(DeviceKind::Lock);
        let mut model = create_test_model(DeviceKind::Lock, Some(UNLOCKED));
        let prepared = dispatcher
            .prepare(CommandKind::Lock, &ready(), &model, Timestamp::new(0))
            .unwrap();
        dispatcher.track(prepared.pending);

        let still_unlocked = status_from(&mut model, UNLOCKED, 1);
        assert!(dispatcher.on_status(&still_unlocked).is_none());

        let locked = status_from(&mut model, LOCKED, 2);
        let outcome = dispatcher.on_status(&locked).unwrap();
        assert_eq!(outcome.command, CommandKind::Lock);
        assert_eq!(outcome.result.unwrap().lock_state, LockState::Locked);
        assert!(dispatcher.pending().is_none());
    }

    #[test]
    fn test_rejecting_response() {
        let mut dispatcher = create_test_dispatcher(DeviceKind::Lock);
        let model = create_test_model(DeviceKind::Lock, Some(UNLOCKED));
        let prepared = dispatcher
            .prepare(CommandKind::Lock, &ready(), &model, Timestamp::new(0))
            .unwrap();
        dispatcher.track(prepared.pending);

        let accepted = Response {
            item_code: ItemCode::Lock,
            op_code: OpCode::Async,
            result: ResultCode::Success,
            data: vec![],
        };
        assert!(dispatcher.on_response(&accepted).is_none());
        assert!(dispatcher.pending().is_some());

        let busy = Response {
            result: ResultCode::Busy,
            ..accepted
        };
        let outcome = dispatcher.on_response(&busy).unwrap();
        assert_eq!(
            outcome.result.unwrap_err(),
            SesameError::CommandRejected {
                command: CommandKind::Lock,
                result: ResultCode::Busy
            }
        );
    }

    #[test]
    fn test_timeout() {
        let mut dispatcher = create_test_dispatcher(DeviceKind::Lock);
        let model = create_test_model(DeviceKind::Lock, Some(UNLOCKED));
        let prepared = dispatcher
            .prepare(CommandKind::Unlock, &ready(), &model, Timestamp::new(0))
            .unwrap();
        dispatcher.track(prepared.pending);

        assert!(dispatcher.expire(Timestamp::new(499)).is_none());
        let outcome = dispatcher.expire(Timestamp::new(500)).unwrap();
        assert!(matches!(
            outcome.result,
            Err(SesameError::CommandTimeout {
                command: CommandKind::Unlock,
                timeout_ms: 500
            })
        ));
        assert!(dispatcher.next_deadline().is_none());
    }
}
