//! Sans-IO session engine
//!
//! [`SesameSession`] owns everything that belongs to one device binding: the
//! lifecycle state machine, the segment reassembler, the session cipher, the
//! device model and the command dispatcher. It never touches a transport; callers
//! feed it link frames and clock ticks and act on the [`SessionOutput`]s it
//! returns.

use std::collections::VecDeque;

use rand_core::OsRng;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::crypto::{generate_token, prepare_login, EcdhKeyPair, KeyMaterial, SessionKeys, TOKEN_LEN};
use crate::dispatcher::{
    CommandDispatcher, CommandKind, CommandOutcome, PendingCommand, PreparedCommand,
};
use crate::errors::AuthFailure;
use crate::model::{DeviceModel, MechanicalStatus, StatusSequence, StatusSnapshot};
use crate::protocol::{
    Frames, HistoryTag, ItemCode, LoginResponse, MessageFragmenter, MessageReassembler, Notification,
    OpCode, Payload, Publish, ReassembledMessage, Response, SegmentType,
};
use crate::session::{AuditEntry, SessionEvent, SessionState};
use crate::types::{DeviceIdentity, DeviceKind, Timestamp};
use crate::{Result, SesameError};

/// Transitions kept for diagnostics
const MAX_AUDIT_ENTRIES: usize = 64;

// ----------------------------------------------------------------------------
// Outputs
// ----------------------------------------------------------------------------

/// Action requested by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    /// Write these frames to the link, in order
    Transmit(Frames),
    StateChanged(SessionState),
    StatusChanged(MechanicalStatus),
    CommandFinished(CommandOutcome),
    /// Session ended; the link should be torn down
    Closed(SesameError),
}

// ----------------------------------------------------------------------------
// Session Engine
// ----------------------------------------------------------------------------

/// Protocol engine for one device
#[derive(Debug)]
pub struct SesameSession {
    config: SessionConfig,
    keys: KeyMaterial,
    state: SessionState,
    model: DeviceModel,
    fragmenter: MessageFragmenter,
    reassembler: MessageReassembler,
    session_keys: Option<SessionKeys>,
    dispatcher: CommandDispatcher,
    audit_log: VecDeque<AuditEntry>,
}

impl SesameSession {
    pub fn new(
        keys: KeyMaterial,
        identity: DeviceIdentity,
        kind: DeviceKind,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            fragmenter: MessageFragmenter::new(config.segment_data_size()),
            reassembler: MessageReassembler::new(config.fragment_timeout, config.max_message_size),
            dispatcher: CommandDispatcher::new(kind, &config),
            model: DeviceModel::new(identity, kind),
            state: SessionState::Idle,
            session_keys: None,
            audit_log: VecDeque::new(),
            keys,
            config,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> &DeviceIdentity {
        self.model.identity()
    }

    pub fn model(&self) -> &DeviceModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut DeviceModel {
        &mut self.model
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn current_status(&self) -> Option<&MechanicalStatus> {
        self.model.current_status()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.model.snapshot()
    }

    pub fn pending_command(&self) -> Option<&PendingCommand> {
        self.dispatcher.pending()
    }

    pub fn has_session_keys(&self) -> bool {
        self.session_keys.is_some()
    }

    /// Recent lifecycle transitions, oldest first
    pub fn audit_log(&self) -> impl Iterator<Item = &AuditEntry> {
        self.audit_log.iter()
    }

    // ------------------------------------------------------------------------
    // Link Events
    // ------------------------------------------------------------------------

    /// The transport brought the link up
    pub fn on_link_established(&mut self, now: Timestamp) -> Result<Vec<SessionOutput>> {
        let mut outputs = Vec::new();
        if matches!(self.state, SessionState::Disconnected { .. }) {
            self.apply_event(SessionEvent::Reset, now)?;
        }
        self.apply_event(SessionEvent::LinkEstablished, now)?;

        let epoch = self.model.begin_epoch();
        self.reassembler.discard();
        info!("Link to {} established (epoch {})", self.model.identity(), epoch);
        outputs.push(SessionOutput::StateChanged(self.state));
        Ok(outputs)
    }

    /// The transport lost the link, or the host is disconnecting
    pub fn on_link_lost(&mut self, reason: &str, now: Timestamp) -> Vec<SessionOutput> {
        if matches!(self.state, SessionState::Idle | SessionState::Disconnected { .. }) {
            return Vec::new();
        }
        info!("Link to {} lost: {}", self.model.identity(), reason);

        self.session_keys = None;
        if let Some(truncated) = self.reassembler.discard() {
            debug!("{}", truncated);
        }
        let mut outputs = Vec::new();
        if self
            .apply_event(
                SessionEvent::LinkLost {
                    reason: reason.to_string(),
                },
                now,
            )
            .is_ok()
        {
            outputs.push(SessionOutput::StateChanged(self.state));
        }

        let error = SesameError::disconnected(reason);
        if let Some(outcome) = self.dispatcher.fail_pending(error.clone()) {
            outputs.push(SessionOutput::CommandFinished(outcome));
        }
        outputs.push(SessionOutput::Closed(error));
        outputs
    }

    /// Process one link frame from the notification stream
    pub fn handle_frame(&mut self, frame: &[u8], now: Timestamp) -> Vec<SessionOutput> {
        if !self.state.is_linked() {
            debug!("Dropping frame received in state {}", self.state.state_name());
            return Vec::new();
        }
        match self.reassembler.add_segment(frame, now) {
            Ok(Some(message)) => self.handle_message(message, now),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Dropping segment from {}: {}", self.model.identity(), e);
                Vec::new()
            }
        }
    }

    /// Enforce handshake, fragment and command deadlines
    pub fn poll_timeouts(&mut self, now: Timestamp) -> Vec<SessionOutput> {
        if let Some(truncated) = self.reassembler.expire(now) {
            warn!("{} from {}", truncated, self.model.identity());
        }
        if self.handshake_deadline().is_some_and(|deadline| now >= deadline) {
            return self.fail_session(AuthFailure::HandshakeTimeout, now);
        }
        self.dispatcher
            .expire(now)
            .map(SessionOutput::CommandFinished)
            .into_iter()
            .collect()
    }

    /// Earliest time [`poll_timeouts`](Self::poll_timeouts) has work to do
    pub fn next_deadline(&self) -> Option<Timestamp> {
        [
            self.handshake_deadline(),
            self.reassembler.deadline(),
            self.dispatcher.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Encrypt and frame `command`, tracking it as the pending command
    ///
    /// On error nothing is tracked and nothing must be written.
    pub fn begin_command(&mut self, command: CommandKind, now: Timestamp) -> Result<Frames> {
        let prepared = self
            .dispatcher
            .prepare(command, &self.state, &self.model, now)?;
        self.send_prepared(prepared)
    }

    /// As [`begin_command`](Self::begin_command), recording `history_tag` in the
    /// device history instead of the configured default
    pub fn begin_command_with_tag(
        &mut self,
        command: CommandKind,
        history_tag: &str,
        now: Timestamp,
    ) -> Result<Frames> {
        let prepared = self.dispatcher.prepare_with_tag(
            command,
            &HistoryTag::new(history_tag),
            &self.state,
            &self.model,
            now,
        )?;
        self.send_prepared(prepared)
    }

    fn send_prepared(&mut self, prepared: PreparedCommand) -> Result<Frames> {
        let keys = self.session_keys.as_mut().ok_or(SesameError::NotReady {
            state: self.state.state_name(),
        })?;
        let ciphertext = keys.encrypt(&prepared.payload.to_bytes())?;
        let frames = self
            .fragmenter
            .fragment_message(&ciphertext, SegmentType::Ciphertext);
        self.dispatcher.track(prepared.pending);
        Ok(frames)
    }

    // ------------------------------------------------------------------------
    // Inbound Messages
    // ------------------------------------------------------------------------

    fn handle_message(&mut self, message: ReassembledMessage, now: Timestamp) -> Vec<SessionOutput> {
        match message.segment_type {
            SegmentType::Plaintext => self.handle_plaintext(&message.data, now),
            SegmentType::Ciphertext => self.handle_ciphertext(&message.data, now),
        }
    }

    fn handle_plaintext(&mut self, data: &[u8], now: Timestamp) -> Vec<SessionOutput> {
        if !matches!(self.state, SessionState::Connected { .. }) {
            return self.fail_session(AuthFailure::UnexpectedPlaintext, now);
        }
        match Notification::from_bytes(data) {
            Ok(Notification::Publish(Publish {
                item_code: ItemCode::Initial,
                data,
            })) if data.len() >= TOKEN_LEN => {
                let mut device_token = [0u8; TOKEN_LEN];
                device_token.copy_from_slice(&data[..TOKEN_LEN]);
                self.start_handshake(device_token, now)
            }
            Ok(other) => {
                warn!("Ignoring plaintext {:?} before login", other.item_code());
                Vec::new()
            }
            Err(e) => {
                warn!("Ignoring undecodable plaintext before login: {}", e);
                Vec::new()
            }
        }
    }

    fn start_handshake(&mut self, device_token: [u8; TOKEN_LEN], now: Timestamp) -> Vec<SessionOutput> {
        let app_keys = EcdhKeyPair::generate(&mut OsRng);
        let request = match prepare_login(&self.keys, &app_keys, generate_token(), device_token) {
            Ok(request) => request,
            Err(e) => {
                error!("Failed to build login request: {}", e);
                return self.close_with(e, now);
            }
        };

        let deadline = now + self.config.handshake_timeout.as_millis() as u64;
        if let Err(e) = self.apply_event(SessionEvent::HandshakeStarted { deadline }, now) {
            warn!("{}", e);
            return Vec::new();
        }
        self.session_keys = Some(request.session_keys);
        debug!("Login request sent to {}", self.model.identity());

        let payload = Payload::new(OpCode::Sync, ItemCode::Login, request.payload).to_bytes();
        vec![
            SessionOutput::Transmit(
                self.fragmenter
                    .fragment_message(&payload, SegmentType::Plaintext),
            ),
            SessionOutput::StateChanged(self.state),
        ]
    }

    fn handle_ciphertext(&mut self, data: &[u8], now: Timestamp) -> Vec<SessionOutput> {
        let Some(keys) = self.session_keys.as_mut() else {
            return self.fail_session(AuthFailure::MissingSessionKeys, now);
        };
        let plaintext = match keys.decrypt(data) {
            Ok(plaintext) => plaintext,
            Err(_) => return self.fail_session(AuthFailure::TagMismatch, now),
        };
        let sequence = StatusSequence::new(
            self.model.epoch(),
            keys.decrypt_counter().saturating_sub(1),
        );

        let notification = match Notification::from_bytes(&plaintext) {
            Ok(notification) => notification,
            Err(e) => {
                warn!("Dropping undecodable notification: {}", e);
                return Vec::new();
            }
        };

        match notification {
            Notification::Response(response)
                if matches!(self.state, SessionState::Authenticating { .. })
                    && response.item_code == ItemCode::Login =>
            {
                self.complete_login(&response, sequence, now)
            }
            Notification::Response(response) => self.handle_response(&response),
            Notification::Publish(publish) => self.handle_publish(&publish, sequence, now),
        }
    }

    fn complete_login(
        &mut self,
        response: &Response,
        sequence: StatusSequence,
        now: Timestamp,
    ) -> Vec<SessionOutput> {
        if !response.result.is_success() {
            return self.fail_session(AuthFailure::LoginRejected(response.result), now);
        }
        let login = match LoginResponse::from_bytes(&response.data) {
            Ok(login) => login,
            Err(_) => return self.fail_session(AuthFailure::MalformedResponse, now),
        };
        let status = match self.model.apply_login(&login, sequence, now) {
            Ok(status) => status,
            Err(_) => return self.fail_session(AuthFailure::MalformedResponse, now),
        };
        if let Err(e) = self.apply_event(SessionEvent::HandshakeVerified, now) {
            warn!("{}", e);
            return Vec::new();
        }
        info!("Logged in to {}", self.model.identity());

        let mut outputs = vec![SessionOutput::StateChanged(self.state)];
        outputs.extend(status.map(SessionOutput::StatusChanged));
        outputs
    }

    fn handle_response(&mut self, response: &Response) -> Vec<SessionOutput> {
        debug!(
            "Response {:?}/{:?}: {:?}",
            response.item_code, response.op_code, response.result
        );
        self.dispatcher
            .on_response(response)
            .map(SessionOutput::CommandFinished)
            .into_iter()
            .collect()
    }

    fn handle_publish(
        &mut self,
        publish: &Publish,
        sequence: StatusSequence,
        now: Timestamp,
    ) -> Vec<SessionOutput> {
        match publish.item_code {
            ItemCode::MechStatus => match self.model.apply_status(&publish.data, sequence, now) {
                Ok(Some(status)) => {
                    let mut outputs = Vec::new();
                    if let Some(outcome) = self.dispatcher.on_status(&status) {
                        outputs.push(SessionOutput::CommandFinished(outcome));
                    }
                    outputs.insert(0, SessionOutput::StatusChanged(status));
                    outputs
                }
                Ok(None) => Vec::new(),
                Err(e) => {
                    warn!("Dropping malformed status: {}", e);
                    Vec::new()
                }
            },
            ItemCode::MechSetting => {
                if let Err(e) = self.model.apply_settings(&publish.data) {
                    warn!("Dropping malformed settings: {}", e);
                }
                Vec::new()
            }
            other => {
                debug!("Ignoring publish {:?}", other);
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------------
    // Failure Handling
    // ------------------------------------------------------------------------

    /// Authentication failures end the session and invalidate the status
    fn fail_session(&mut self, reason: AuthFailure, now: Timestamp) -> Vec<SessionOutput> {
        error!("Authentication failed for {}: {}", self.model.identity(), reason);
        self.model.mark_stale();
        self.close_with(SesameError::auth_failed(reason), now)
    }

    fn close_with(&mut self, error: SesameError, now: Timestamp) -> Vec<SessionOutput> {
        self.session_keys = None;
        self.reassembler.discard();

        let mut outputs = Vec::new();
        if self
            .apply_event(
                SessionEvent::HandshakeFailed {
                    reason: error.to_string(),
                },
                now,
            )
            .is_ok()
        {
            outputs.push(SessionOutput::StateChanged(self.state));
        }
        if let Some(outcome) = self.dispatcher.fail_pending(error.clone()) {
            outputs.push(SessionOutput::CommandFinished(outcome));
        }
        outputs.push(SessionOutput::Closed(error));
        outputs
    }

    fn handshake_deadline(&self) -> Option<Timestamp> {
        match self.state {
            SessionState::Connected { since } => {
                Some(since + self.config.handshake_timeout.as_millis() as u64)
            }
            other => other.handshake_deadline(),
        }
    }

    fn apply_event(&mut self, event: SessionEvent, now: Timestamp) -> Result<()> {
        let transition = self.state.transition(event, now)?;
        debug!(
            "{}: {} -> {} on {}",
            self.model.identity(),
            transition.audit_entry.from_state,
            transition.audit_entry.to_state,
            transition.audit_entry.event
        );
        if self.audit_log.len() == MAX_AUDIT_ENTRIES {
            self.audit_log.pop_front();
        }
        self.audit_log.push_back(transition.audit_entry);
        self.state = transition.new_state;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
