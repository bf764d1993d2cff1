//! Commands consumed by the session controller.
//!
//! Each variant owns any buffer it carries. Dropping a command releases
//! its buffer, so a command that is rejected, superseded or fails to
//! enqueue needs no explicit cleanup.

use super::Transport;
use super::buffer::PoolBuf;
use crate::transport::{Destination, TxMetadata};

/// Network-layer metadata delivered with a radio datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxIndication {
    /// Destination port; selects the receive handler for the plaintext.
    pub port: u16,
    pub source: Destination,
}

/// Ciphertext received from a link.
#[derive(Debug)]
pub struct InboundFrame {
    pub indication: Option<RxIndication>,
    pub payload: PoolBuf,
}

/// Plaintext queued for encryption.
#[derive(Debug)]
pub struct OutboundMessage {
    /// Radio addressing; `None` on serial.
    pub meta: Option<TxMetadata>,
    pub payload: PoolBuf,
}

/// Decrypted application data handed to a receive handler.
#[derive(Debug)]
pub struct InboundMessage {
    pub transport: Transport,
    pub indication: Option<RxIndication>,
    pub payload: PoolBuf,
}

#[derive(Debug)]
pub enum Command {
    ConnectSerial,
    DisconnectSerial,
    ConnectRadio,
    DisconnectRadio,
    ReconnectRadio,
    TransportRx {
        transport: Transport,
        frame: InboundFrame,
    },
    ApplicationTx(OutboundMessage),
    SecurityModeChanged,
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectSerial => "ConnectSerial",
            Self::DisconnectSerial => "DisconnectSerial",
            Self::ConnectRadio => "ConnectRadio",
            Self::DisconnectRadio => "DisconnectRadio",
            Self::ReconnectRadio => "ReconnectRadio",
            Self::TransportRx { .. } => "TransportRx",
            Self::ApplicationTx(_) => "ApplicationTx",
            Self::SecurityModeChanged => "SecurityModeChanged",
            Self::Shutdown => "Shutdown",
        }
    }
}
