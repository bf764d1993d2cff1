//! Transport multiplexer.
//!
//! Tracks the addressing of the application message being encrypted and
//! routes each ciphertext datagram the engine produces to exactly one link.
//! Also builds the per-transport [`ChannelProfile`] the engine context is
//! created from.
//!
//! ```text
//!   engine send hook ──▶ TransportMux::send
//!                          ├── Serial ──▶ SerialLink::write
//!                          └── Radio  ──▶ RadioLink::send
//!                                ├── app message attached: reuse its metadata
//!                                └── otherwise: handshake port / QoS / head-end
//! ```

use log::{debug, warn};

use crate::app::ports::{
    CertificateKind, IdentityStore, LinkError, RadioLink, RadioRequest, SecureElement, SerialLink,
};
use crate::counters::{Counter, CounterStore};
use crate::error::{Result, SessionError};
use crate::session::{SessionState, Transport};
use crate::verifier::CERT_MAX;
use crate::verifier::asn1::{Asn1Error, der_total_len};

/// Port carrying handshake and alert records (IANA `coaps`).
pub const HANDSHAKE_PORT: u16 = 5684;
/// Radio QoS class for handshake traffic.
pub const HANDSHAKE_QOS: u8 = 0x39;
/// Network context used when the head-end context cannot be resolved.
pub const DEFAULT_HEAD_END_CONTEXT: u8 = 0;

pub const CIPHER_SUITE: &str = "ECDHE-ECDSA-AES256-CCM-8";
/// Largest datagram the radio stack delivers.
pub const MAX_DATAGRAM: usize = 1300;

pub type CertBuf = heapless::Vec<u8, CERT_MAX>;

/// Where a radio request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Network context id (e.g. the head-end).
    Context(u8),
    /// Explicit 40-bit link address.
    Extension([u8; 5]),
}

/// Addressing and QoS for one outbound radio request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxMetadata {
    pub port: u16,
    pub qos: u8,
    pub destination: Destination,
    /// Opaque tag the network layer returns with the delivery confirmation.
    pub confirm_tag: Option<u32>,
}

impl TxMetadata {
    /// Metadata for handshake records addressed to the head-end.
    pub fn handshake(head_end: u8) -> Self {
        Self {
            port: HANDSHAKE_PORT,
            qos: HANDSHAKE_QOS,
            destination: Destination::Context(head_end),
            confirm_tag: None,
        }
    }
}

// ── Channel profiles ──────────────────────────────────────────

/// Everything the engine needs to build a context for one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelProfile {
    pub transport: Transport,
    pub cipher_suite: &'static str,
    /// Device certificate presented to the peer (radio only).
    pub own_certificate: Option<CertBuf>,
    pub trust_anchor: CertBuf,
    /// Serial is a trusted local channel and skips date checks.
    pub validate_peer_dates: bool,
    /// Private-key operations go through the secure element's sign hook.
    pub sign_with_element: bool,
    pub group_messages: bool,
    pub max_datagram: usize,
}

/// Radio profile: device certificate and network root CA from the element.
/// Fails closed if either credential cannot be fetched.
pub fn radio_profile(element: &mut dyn SecureElement) -> Result<ChannelProfile> {
    let own = fetch_certificate(element, CertificateKind::Device)?;
    let anchor = fetch_certificate(element, CertificateKind::NetworkRootCa)?;
    Ok(ChannelProfile {
        transport: Transport::Radio,
        cipher_suite: CIPHER_SUITE,
        own_certificate: Some(own),
        trust_anchor: anchor,
        validate_peer_dates: true,
        sign_with_element: true,
        group_messages: true,
        max_datagram: MAX_DATAGRAM,
    })
}

/// Serial profile: manufacturing root CA from ROM, no date validation.
pub fn serial_profile(identity: &dyn IdentityStore) -> Result<ChannelProfile> {
    let mut buf = [0u8; CERT_MAX];
    let n = identity.manufacturing_root_ca(&mut buf)?;
    Ok(ChannelProfile {
        transport: Transport::Serial,
        cipher_suite: CIPHER_SUITE,
        own_certificate: None,
        trust_anchor: trim_certificate(&buf[..n.min(CERT_MAX)])?,
        validate_peer_dates: false,
        sign_with_element: false,
        group_messages: false,
        max_datagram: MAX_DATAGRAM,
    })
}

fn fetch_certificate(element: &mut dyn SecureElement, kind: CertificateKind) -> Result<CertBuf> {
    let mut buf = [0u8; CERT_MAX];
    let n = element.certificate(kind, &mut buf).map_err(|e| {
        warn!("transport: {kind:?} certificate unavailable: {e}");
        SessionError::Credentials(e)
    })?;
    trim_certificate(&buf[..n.min(CERT_MAX)])
}

/// Cut a certificate buffer down to its encoded DER length.
fn trim_certificate(raw: &[u8]) -> Result<CertBuf> {
    let len = der_total_len(raw)
        .filter(|&len| len <= raw.len())
        .ok_or(SessionError::Malformed(Asn1Error::Truncated))?;
    CertBuf::from_slice(&raw[..len]).map_err(|()| SessionError::Malformed(Asn1Error::TooLong))
}

// ── Multiplexer ───────────────────────────────────────────────

pub struct TransportMux {
    radio: Box<dyn RadioLink>,
    serial: Box<dyn SerialLink>,
    /// Metadata of the application message currently being written.
    pending_tx: Option<TxMetadata>,
}

impl TransportMux {
    pub fn new(radio: Box<dyn RadioLink>, serial: Box<dyn SerialLink>) -> Self {
        Self {
            radio,
            serial,
            pending_tx: None,
        }
    }

    /// Attach (or clear) the metadata the next ciphertext datagram reuses.
    pub fn attach(&mut self, meta: Option<TxMetadata>) {
        self.pending_tx = meta;
    }

    /// Send one ciphertext datagram on `transport`. Attached metadata is
    /// consumed by the first datagram.
    pub fn send(
        &mut self,
        transport: Transport,
        state: SessionState,
        datagram: &[u8],
        counters: &CounterStore,
    ) -> core::result::Result<usize, LinkError> {
        let attached = self.pending_tx.take();
        match transport {
            Transport::Serial => {
                self.serial.write(datagram)?;
                Ok(datagram.len())
            }
            Transport::Radio => {
                let (meta, counter) = match attached {
                    Some(meta) if state == SessionState::Connected => (meta, Counter::OutUcast),
                    _ => {
                        let head_end = self.radio.head_end_context().unwrap_or_else(|| {
                            debug!("transport: head-end context unknown, using default");
                            DEFAULT_HEAD_END_CONTEXT
                        });
                        (TxMetadata::handshake(head_end), Counter::OutNonApplication)
                    }
                };
                self.radio.send(RadioRequest {
                    meta,
                    payload: datagram,
                })?;
                counters.increment(counter);
                Ok(datagram.len())
            }
            Transport::None => Err(LinkError::NoRoute),
        }
    }

    /// Tell the serial link its secure session has closed.
    pub fn serial_closed(&mut self) {
        self.serial.session_closed();
    }
}
