//! Outbound session events.
//!
//! The [`SessionController`](crate::session::controller::SessionController)
//! emits these through the [`EventSink`](super::ports::EventSink) port.
//! Adapters decide what to do with them: log to serial, raise a head-end
//! alarm, etc.

use std::time::Duration;

use crate::session::{SessionState, Transport};
use crate::verifier::PeerSerial;

/// Structured events emitted by the session core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session reached `Connected`.
    SessionEstablished {
        transport: Transport,
        peer_serial: PeerSerial,
    },

    /// A session attempt or live session entered `Failed`.
    SessionFailed {
        transport: Transport,
        peer_serial: PeerSerial,
    },

    /// A record failed terminal decryption.
    DecryptionFailed,

    /// The controller moved between states.
    StateChanged { from: SessionState, to: SessionState },

    /// A radio retry was scheduled.
    BackoffScheduled { delay: Duration, next_ceiling_secs: u32 },

    /// A new network public key was learned from the head-end certificate.
    NetworkKeyRotated,
}

impl SessionEvent {
    /// Event-log priority; `None` for events that are only traced locally.
    pub fn priority(&self) -> Option<u8> {
        match self {
            Self::SessionEstablished { .. } => Some(110),
            Self::DecryptionFailed => Some(111),
            Self::SessionFailed { .. } => Some(112),
            _ => None,
        }
    }
}
