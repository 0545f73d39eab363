//! Session Lifecycle State Machine
//!
//! `Idle → Connected → Authenticating → Ready`, with `Disconnected` reachable from
//! every state. Transitions consume the current state and return the new one plus
//! an audit entry, so an invalid sequence of link events surfaces as an error
//! instead of silently corrupting the session.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

/// Lifecycle of one device connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No transport link
    Idle,
    /// Link up, waiting for the device token
    Connected { since: Timestamp },
    /// Login request sent, waiting for the encrypted login response
    Authenticating { started: Timestamp, deadline: Timestamp },
    /// Logged in; application traffic allowed
    Ready { since: Timestamp },
    /// Link gone or session failed; a new attempt restarts at `Idle`
    Disconnected { at: Timestamp },
}

/// Events driving the session lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Transport reported the link as up
    LinkEstablished,
    /// Login request sent
    HandshakeStarted { deadline: Timestamp },
    /// Device accepted the login
    HandshakeVerified,
    /// Login failed or a frame failed authentication
    HandshakeFailed { reason: String },
    /// Transport reported link loss, or the host disconnected
    LinkLost { reason: String },
    /// Prepare for a fresh connection attempt
    Reset,
}

impl SessionEvent {
    fn name(&self) -> &'static str {
        match self {
            SessionEvent::LinkEstablished => "LinkEstablished",
            SessionEvent::HandshakeStarted { .. } => "HandshakeStarted",
            SessionEvent::HandshakeVerified => "HandshakeVerified",
            SessionEvent::HandshakeFailed { .. } => "HandshakeFailed",
            SessionEvent::LinkLost { .. } => "LinkLost",
            SessionEvent::Reset => "Reset",
        }
    }
}

/// Result of a state transition
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub new_state: SessionState,
    pub audit_entry: AuditEntry,
}

/// Audit trail entry for state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub from_state: &'static str,
    pub to_state: &'static str,
    pub event: &'static str,
}

// ----------------------------------------------------------------------------
// State Machine Implementation
// ----------------------------------------------------------------------------

impl SessionState {
    /// Get current state name for logging/audit
    pub fn state_name(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connected { .. } => "Connected",
            SessionState::Authenticating { .. } => "Authenticating",
            SessionState::Ready { .. } => "Ready",
            SessionState::Disconnected { .. } => "Disconnected",
        }
    }

    /// Process an event and transition to the new state
    pub fn transition(
        self,
        event: SessionEvent,
        now: Timestamp,
    ) -> Result<StateTransition, StateTransitionError> {
        let from_state = self.state_name();
        let event_name = event.name();

        let new_state = match (self, event) {
            (SessionState::Idle, SessionEvent::LinkEstablished) => {
                SessionState::Connected { since: now }
            }

            (SessionState::Connected { .. }, SessionEvent::HandshakeStarted { deadline }) => {
                SessionState::Authenticating {
                    started: now,
                    deadline,
                }
            }

            (SessionState::Authenticating { .. }, SessionEvent::HandshakeVerified) => {
                SessionState::Ready { since: now }
            }

            (
                SessionState::Connected { .. }
                | SessionState::Authenticating { .. }
                | SessionState::Ready { .. },
                SessionEvent::HandshakeFailed { .. },
            ) => SessionState::Disconnected { at: now },

            // Universal transitions
            (SessionState::Disconnected { at }, SessionEvent::LinkLost { .. }) => {
                SessionState::Disconnected { at }
            }
            (_, SessionEvent::LinkLost { .. }) => SessionState::Disconnected { at: now },

            (SessionState::Disconnected { .. } | SessionState::Idle, SessionEvent::Reset) => {
                SessionState::Idle
            }

            // Invalid transitions
            (_, event) => {
                return Err(StateTransitionError::InvalidTransition {
                    from_state,
                    event: event_name,
                    reason: format!("Event {:?} not valid for state {}", event, from_state),
                });
            }
        };

        let audit_entry = AuditEntry {
            timestamp: now,
            from_state,
            to_state: new_state.state_name(),
            event: event_name,
        };

        Ok(StateTransition {
            new_state,
            audit_entry,
        })
    }

    /// Check if state allows application commands
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready { .. })
    }

    /// Check if session keys may exist in this state
    pub fn holds_session_keys(&self) -> bool {
        matches!(
            self,
            SessionState::Authenticating { .. } | SessionState::Ready { .. }
        )
    }

    /// Check if the link is up
    pub fn is_linked(&self) -> bool {
        matches!(
            self,
            SessionState::Connected { .. }
                | SessionState::Authenticating { .. }
                | SessionState::Ready { .. }
        )
    }

    /// Deadline of a pending handshake
    pub fn handshake_deadline(&self) -> Option<Timestamp> {
        match self {
            SessionState::Authenticating { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors that can occur during state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionError {
    /// Invalid state transition attempted
    InvalidTransition {
        from_state: &'static str,
        event: &'static str,
        reason: String,
    },
}

impl fmt::Display for StateTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateTransitionError::InvalidTransition {
                from_state,
                event,
                reason,
            } => {
                write!(
                    f,
                    "Invalid transition from {} on event {}: {}",
                    from_state, event, reason
                )
            }
        }
    }
}

impl std::error::Error for StateTransitionError {}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
