//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing session events to the ESP-IDF
//! logger (UART in production). Events that carry an event-log priority
//! are tagged with it so the head-end log collector can pick them out.

use log::{info, warn};

use crate::app::events::SessionEvent;
use crate::app::ports::EventSink;

/// Adapter that logs every [`SessionEvent`] to the serial console.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &SessionEvent) {
        let priority = event.priority().unwrap_or(0);
        match event {
            SessionEvent::SessionEstablished {
                transport,
                peer_serial,
            } => {
                info!(
                    "SESSION | p={priority} | established on {:?}, peer serial {} bytes",
                    transport,
                    peer_serial.len()
                );
            }
            SessionEvent::SessionFailed {
                transport,
                peer_serial,
            } => {
                warn!(
                    "SESSION | p={priority} | failed on {:?}, peer serial {} bytes",
                    transport,
                    peer_serial.len()
                );
            }
            SessionEvent::DecryptionFailed => {
                warn!("SESSION | p={priority} | decryption failed");
            }
            SessionEvent::StateChanged { from, to } => {
                info!("SESSION | {:?} -> {:?}", from, to);
            }
            SessionEvent::BackoffScheduled {
                delay,
                next_ceiling_secs,
            } => {
                info!(
                    "SESSION | retry in {}s, next ceiling {}s",
                    delay.as_secs(),
                    next_ceiling_secs
                );
            }
            SessionEvent::NetworkKeyRotated => {
                info!("SESSION | network public key rotated");
            }
        }
    }
}
