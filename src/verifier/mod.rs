//! Peer identity verification.
//!
//! [`PeerVerifier`] backs the engine's verify and sign hooks for one engine
//! call. It records the peer certificate, cross-checks the peer subject
//! against identities held locally, and on radio adopts the head-end's
//! network public key.
//!
//! ```text
//!   verify_peer(preverified, cert)
//!     ├── record serial / not-after / subject   (always)
//!     ├── preverified == false ──▶ reject
//!     ├── subject ∉ known subjects ──▶ reject
//!     └── radio: key missing ──▶ reject
//!                key changed ──▶ flash + element slot
//! ```

pub mod asn1;

use std::sync::{Mutex, PoisonError};

use log::{debug, error, info, warn};
use sha1::{Digest, Sha1};

use crate::app::events::SessionEvent;
use crate::app::ports::{
    CertificateKind, ElementError, EventSink, IdentityStore, KeySlot, ManufacturingSubject,
    PeerCertificate, RawPublicKey, SecureElement,
};
use crate::session::Transport;
use asn1::{SubjectString, Timestamp};

/// Longest certificate (or stored subject) fetched from the element or ROM.
pub const CERT_MAX: usize = 512;

/// Peer serial numbers are truncated to this many bytes.
pub const SERIAL_MAX: usize = 32;

/// SHA-1 subject key identifier length.
pub const KEY_ID_LEN: usize = 20;

pub type PeerSerial = heapless::Vec<u8, SERIAL_MAX>;

/// What was learned about the peer during the most recent handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerCertificateRecord {
    /// Rendered subject; empty when it could not be decoded.
    pub subject: SubjectString,
    pub serial: PeerSerial,
    pub not_after: Option<Timestamp>,
}

impl PeerCertificateRecord {
    /// Serial number as upper-case hex.
    pub fn serial_hex(&self) -> heapless::String<{ SERIAL_MAX * 2 }> {
        use core::fmt::Write;
        let mut out = heapless::String::new();
        for b in &self.serial {
            let _ = write!(out, "{b:02X}");
        }
        out
    }

    /// Whether the certificate's validity has ended at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.not_after.is_some_and(|end| now >= end)
    }
}

/// Verify/sign hook state for one engine call.
pub struct PeerVerifier<'a> {
    pub transport: Transport,
    pub element: &'a mut dyn SecureElement,
    pub identity: &'a mut dyn IdentityStore,
    pub record: &'a Mutex<PeerCertificateRecord>,
    pub events: &'a mut dyn EventSink,
}

impl PeerVerifier<'_> {
    pub fn verify(&mut self, preverified: bool, cert: &PeerCertificate<'_>) -> bool {
        self.record_peer(cert);

        if !preverified {
            warn!("verifier: engine chain validation failed");
            return false;
        }

        let matched = match self.transport {
            Transport::Radio => self.matches_radio_subject(cert.subject),
            Transport::Serial => self.matches_serial_subject(cert.subject),
            Transport::None => false,
        };
        if !matched {
            warn!("verifier: peer subject not trusted");
            return false;
        }

        if self.transport == Transport::Radio {
            return self.adopt_network_key(cert.public_key);
        }
        true
    }

    /// Sign with the element and hand the engine a DER signature.
    pub fn sign(&mut self, digest: &[u8], out: &mut [u8]) -> Result<usize, ElementError> {
        let raw = self.element.sign(digest)?;
        let der = asn1::signature_to_der(&raw);
        let dst = out.get_mut(..der.len()).ok_or(ElementError::BufferTooSmall)?;
        dst.copy_from_slice(&der);
        Ok(der.len())
    }

    fn record_peer(&mut self, cert: &PeerCertificate<'_>) {
        let mut serial = PeerSerial::new();
        let n = cert.serial.len().min(SERIAL_MAX);
        let _ = serial.extend_from_slice(&cert.serial[..n]);

        let not_after = match asn1::parse_time(cert.not_after) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("verifier: peer not-after unreadable: {e}");
                None
            }
        };
        let subject = asn1::decode_subject(cert.subject).unwrap_or_default();
        debug!("verifier: peer subject '{}'", subject);

        let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        *record = PeerCertificateRecord {
            subject,
            serial,
            not_after,
        };
    }

    fn matches_radio_subject(&mut self, peer: &[u8]) -> bool {
        [CertificateKind::HeadEndSubject, CertificateKind::MasterStationSubject]
            .into_iter()
            .any(|kind| {
                let mut buf = [0u8; CERT_MAX];
                match self.element.certificate(kind, &mut buf) {
                    Ok(n) => asn1::subjects_match(peer, &buf[..n.min(CERT_MAX)]),
                    Err(e) => {
                        error!("verifier: cannot read {kind:?}: {e}");
                        false
                    }
                }
            })
    }

    fn matches_serial_subject(&mut self, peer: &[u8]) -> bool {
        [ManufacturingSubject::Rom, ManufacturingSubject::Provisioned]
            .into_iter()
            .any(|which| {
                let mut buf = [0u8; CERT_MAX];
                match self.identity.manufacturing_subject(which, &mut buf) {
                    Ok(n) => asn1::subjects_match(peer, &buf[..n.min(CERT_MAX)]),
                    Err(e) => {
                        error!("verifier: cannot read {which:?} subject: {e}");
                        false
                    }
                }
            })
    }

    /// Make the element's network key slot hold the peer's key.
    fn adopt_network_key(&mut self, point: Option<&[u8]>) -> bool {
        let Some((point, key)) = point.and_then(|p| raw_key(p).map(|k| (p, k))) else {
            error!("verifier: head-end certificate has no usable public key");
            return false;
        };

        match self.element.read_key(KeySlot::NetworkPublicKey) {
            Ok(stored) if stored == key => return true,
            Ok(_) => {}
            Err(e) => warn!("verifier: network key slot unreadable: {e}"),
        }

        info!("verifier: network public key changed, persisting");
        if let Err(e) = self.identity.write_network_key(&key) {
            error!("verifier: flash network key write failed: {e}");
        }
        if let Err(e) = self.identity.write_subject_key_id(&subject_key_id(point)) {
            error!("verifier: flash subject key id write failed: {e}");
        }

        match self.element.write_key(KeySlot::NetworkPublicKey, &key) {
            Ok(()) => {
                self.events.emit(&SessionEvent::NetworkKeyRotated);
                true
            }
            Err(e) => {
                error!("verifier: element network key write failed: {e}");
                false
            }
        }
    }
}

/// Raw `X || Y` from an uncompressed SEC1 point.
fn raw_key(point: &[u8]) -> Option<RawPublicKey> {
    match point {
        [0x04, rest @ ..] => rest.try_into().ok(),
        _ => None,
    }
}

/// RFC 5280 method-1 key identifier: SHA-1 over the encoded point.
pub fn subject_key_id(point: &[u8]) -> [u8; KEY_ID_LEN] {
    let mut id = [0u8; KEY_ID_LEN];
    id.copy_from_slice(&Sha1::digest(point));
    id
}
