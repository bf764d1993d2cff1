//! Unified error type for the secure-session subsystem.
//!
//! Every fallible operation funnels into [`SessionError`]. All variants are
//! `Copy` so they can be handed to connect-result observers and logged
//! without allocation. Port-level errors live next to their traits in
//! [`crate::app::ports`] and convert in through `From`.

use core::fmt;

use crate::app::ports::{ElementError, EngineFault, LinkError, StorageError};
use crate::verifier::asn1::Asn1Error;

// ---------------------------------------------------------------------------
// Top-level session error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// The link produced nothing within the transport timeout. Retried by
    /// the engine's retransmission path before the attempt is abandoned.
    TransportTimeout,
    /// The handshake ended with a terminal engine error.
    Handshake(EngineFault),
    /// A record could not be decrypted or authenticated.
    Decrypt(EngineFault),
    /// The peer certificate did not match any locally trusted identity.
    CertificateUntrusted,
    /// A session-cache, counter or config region could not be read or written.
    Persistence(StorageError),
    /// No buffer or mailbox slot was available; the operation was dropped.
    BufferExhausted,
    /// A configuration setter was given a value outside its allowed range.
    ConfigOutOfRange(&'static str),
    /// The secure element could not supply credentials for a channel context.
    Credentials(ElementError),
    /// A link-layer send was refused.
    Link(LinkError),
    /// A certificate field could not be decoded.
    Malformed(Asn1Error),
    /// The operation needs an established session and none exists.
    NotConnected,
    /// Decrypted radio data arrived for a port with no receive handler.
    Unroutable,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportTimeout => write!(f, "transport timeout"),
            Self::Handshake(e) => write!(f, "handshake: {e}"),
            Self::Decrypt(e) => write!(f, "decrypt: {e}"),
            Self::CertificateUntrusted => write!(f, "peer certificate untrusted"),
            Self::Persistence(e) => write!(f, "persistence: {e}"),
            Self::BufferExhausted => write!(f, "buffer exhausted"),
            Self::ConfigOutOfRange(msg) => write!(f, "config out of range: {msg}"),
            Self::Credentials(e) => write!(f, "credentials: {e}"),
            Self::Link(e) => write!(f, "link: {e}"),
            Self::Malformed(e) => write!(f, "malformed certificate: {e}"),
            Self::NotConnected => write!(f, "no session established"),
            Self::Unroutable => write!(f, "no receive handler for port"),
        }
    }
}

impl core::error::Error for SessionError {}

impl From<StorageError> for SessionError {
    fn from(e: StorageError) -> Self {
        Self::Persistence(e)
    }
}

impl From<ElementError> for SessionError {
    fn from(e: ElementError) -> Self {
        Self::Credentials(e)
    }
}

impl From<LinkError> for SessionError {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

impl From<Asn1Error> for SessionError {
    fn from(e: Asn1Error) -> Self {
        Self::Malformed(e)
    }
}

impl From<EngineFault> for SessionError {
    /// Engine faults surface as handshake errors unless classified otherwise.
    fn from(e: EngineFault) -> Self {
        match e {
            EngineFault::Timeout => Self::TransportTimeout,
            EngineFault::Decrypt => Self::Decrypt(e),
            EngineFault::PeerUntrusted => Self::CertificateUntrusted,
            _ => Self::Handshake(e),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, SessionError>;
