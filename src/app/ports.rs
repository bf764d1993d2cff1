//! Port traits: the boundary between session logic and the platform.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ SessionController (domain)
//! ```
//!
//! The cryptographic engine, the secure element, flash regions, the two
//! link layers, the wall clock and the retry timer are all reached through
//! these traits. The controller owns boxed implementations, so the domain
//! core never touches hardware or library handles directly.
//!
//! ## Security notes
//!
//! - **SecureElement** implementations never expose the device private key;
//!   signing happens inside the element.
//! - **RegionStorage** writes MUST be atomic per call (no torn blobs on
//!   power loss). A region opened with a size different from its stored
//!   size reports [`StorageError::SizeMismatch`] instead of truncating.
//! - All port errors are typed; callers must handle every variant explicitly.

use core::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::app::events::SessionEvent;
use crate::transport::{ChannelProfile, TxMetadata};
use crate::verifier::KEY_ID_LEN;
use crate::verifier::asn1::Timestamp;

// ───────────────────────────────────────────────────────────────
// Secure channel engine (handshake + record layer)
// ───────────────────────────────────────────────────────────────

/// Retransmission window handed to the engine when a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitWindow {
    pub initial: Duration,
    pub max: Duration,
}

/// Resumable material handed back to the engine on import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMaterial<'a> {
    /// Whole-session state written by the previous engine generation.
    Legacy { state: &'a [u8] },
    /// Resumption state split by update frequency.
    Current { major: &'a [u8], minor: &'a [u8] },
}

/// Outcome of the engine asking the receive hook for a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// `n` bytes were copied into the engine's buffer.
    Data(usize),
    /// Nothing pending; try again on the next datagram.
    WouldBlock,
    /// The controller's wait expired while connecting; retransmit.
    TimedOut,
}

/// Fields of the peer certificate the verify hook needs, as raw DER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCertificate<'a> {
    /// Serial number content octets.
    pub serial: &'a [u8],
    /// Complete `notAfter` TLV (UTCTime or GeneralizedTime).
    pub not_after: &'a [u8],
    /// Complete subject `Name` TLV.
    pub subject: &'a [u8],
    /// Uncompressed SEC1 public key point, if the engine could extract one.
    pub public_key: Option<&'a [u8]>,
}

/// Callbacks the engine makes back into the controller while it runs.
///
/// One hooks object is built for every engine call; it carries the frame
/// being processed and the metadata of the message being written.
pub trait EngineHooks {
    /// Copy the pending inbound datagram into `buf`.
    fn recv(&mut self, buf: &mut [u8]) -> RecvOutcome;

    /// Send one ciphertext datagram on the active transport.
    fn send(&mut self, datagram: &[u8]) -> Result<usize, LinkError>;

    /// Certificate verification. `preverified` is the engine's own chain
    /// validation result; returning `false` aborts the handshake.
    fn verify_peer(&mut self, preverified: bool, cert: &PeerCertificate<'_>) -> bool;

    /// Sign `digest` with the device key and write a DER signature to `out`.
    fn sign(&mut self, digest: &[u8], out: &mut [u8]) -> Result<usize, ElementError>;
}

/// Opaque handshake/record-layer engine.
///
/// `connect`, `read` and `write` are non-blocking step functions: they
/// return [`EngineFault::WouldBlock`] when they need another datagram.
pub trait SecureChannelEngine: Send {
    /// Build a context bound to the given transport profile.
    fn create_context(&mut self, profile: &ChannelProfile) -> Result<(), EngineFault>;

    /// Create a fresh session inside the current context.
    fn create_session(&mut self, window: RetransmitWindow) -> Result<(), EngineFault>;

    /// Import previously exported material as the current session.
    fn restore_session(&mut self, material: SessionMaterial<'_>) -> Result<(), EngineFault>;

    /// Export the expensive resumption state. Returns bytes written.
    fn export_major(&mut self, out: &mut [u8]) -> Result<usize, EngineFault>;

    /// Export the cheap per-exchange state. Returns bytes written.
    fn export_minor(&mut self, out: &mut [u8]) -> Result<usize, EngineFault>;

    /// Advance the handshake. `Ok(())` means the session is established.
    fn connect(&mut self, hooks: &mut dyn EngineHooks) -> Result<(), EngineFault>;

    /// Decrypt one record. `Ok(0)` means the peer closed the session.
    fn read(&mut self, hooks: &mut dyn EngineHooks, out: &mut [u8]) -> Result<usize, EngineFault>;

    /// Encrypt and send application data.
    fn write(&mut self, hooks: &mut dyn EngineHooks, data: &[u8]) -> Result<usize, EngineFault>;

    /// Send close_notify unless `quiet`, then release session and context.
    fn shutdown(&mut self, hooks: &mut dyn EngineHooks, quiet: bool);
}

// ───────────────────────────────────────────────────────────────
// Secure element (identity keys, certificates, RNG)
// ───────────────────────────────────────────────────────────────

/// Certificates and subjects held by the secure element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateKind {
    Device,
    NetworkRootCa,
    HeadEndSubject,
    MasterStationSubject,
}

/// Raw public-key slots in the secure element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    NetworkPublicKey,
}

/// Raw P-256 public key (X || Y) as stored in element slots.
pub type RawPublicKey = [u8; 64];

pub trait SecureElement: Send {
    /// Copy a certificate or subject into `out`, returning the bytes read.
    fn certificate(&mut self, kind: CertificateKind, out: &mut [u8]) -> Result<usize, ElementError>;

    /// Sign a digest with the device key, returning raw `r || s`.
    fn sign(&mut self, digest: &[u8]) -> Result<[u8; 64], ElementError>;

    fn read_key(&mut self, slot: KeySlot) -> Result<RawPublicKey, ElementError>;

    fn write_key(&mut self, slot: KeySlot, key: &RawPublicKey) -> Result<(), ElementError>;

    fn random(&mut self, out: &mut [u8]) -> Result<(), ElementError>;
}

// ───────────────────────────────────────────────────────────────
// Identity store (ROM + internal flash security partition)
// ───────────────────────────────────────────────────────────────

/// Which manufacturing subject to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManufacturingSubject {
    /// Burned into ROM at build time.
    Rom,
    /// Written to flash during provisioning.
    Provisioned,
}

pub trait IdentityStore: Send {
    /// Manufacturing root CA used to authenticate maintenance tools.
    fn manufacturing_root_ca(&self, out: &mut [u8]) -> Result<usize, StorageError>;

    fn manufacturing_subject(
        &self,
        which: ManufacturingSubject,
        out: &mut [u8],
    ) -> Result<usize, StorageError>;

    fn write_network_key(&mut self, key: &RawPublicKey) -> Result<(), StorageError>;

    fn write_subject_key_id(&mut self, key_id: &[u8; KEY_ID_LEN]) -> Result<(), StorageError>;
}

// ───────────────────────────────────────────────────────────────
// Region storage (flash-backed named blobs)
// ───────────────────────────────────────────────────────────────

/// Expected write frequency of a region; backends may place them differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRate {
    Seldom,
    Often,
}

/// Handle to an opened region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle(pub u16);

/// Fixed-size named blob storage.
///
/// # Security
///
/// - Opening a new region creates it zero-filled.
/// - Reads and writes outside the region size are rejected, never clamped.
pub trait RegionStorage: Send {
    fn open(&mut self, name: &'static str, size: usize, rate: UpdateRate)
    -> Result<RegionHandle, StorageError>;

    fn read(&mut self, region: RegionHandle, offset: usize, buf: &mut [u8])
    -> Result<(), StorageError>;

    fn write(&mut self, region: RegionHandle, offset: usize, data: &[u8])
    -> Result<(), StorageError>;

    /// Remove a region entirely; the next `open` recreates it.
    fn erase(&mut self, name: &'static str) -> Result<(), StorageError>;
}

/// Storage shared between the controller and the config/counter stores.
pub type SharedStorage = Arc<Mutex<dyn RegionStorage>>;

/// Lock shared storage, recovering the guard if a holder panicked.
pub fn lock_storage(storage: &SharedStorage) -> MutexGuard<'_, dyn RegionStorage + 'static> {
    storage.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────
// Link layers
// ───────────────────────────────────────────────────────────────

/// One outbound radio request.
#[derive(Debug, Clone, Copy)]
pub struct RadioRequest<'a> {
    pub meta: TxMetadata,
    pub payload: &'a [u8],
}

pub trait RadioLink: Send {
    fn send(&mut self, request: RadioRequest<'_>) -> Result<(), LinkError>;

    /// Network context id of the head-end, if the network layer knows it.
    fn head_end_context(&self) -> Option<u8>;
}

pub trait SerialLink: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// The secure session on the serial port has closed.
    fn session_closed(&mut self);
}

// ───────────────────────────────────────────────────────────────
// Clock, timer, security mode, events
// ───────────────────────────────────────────────────────────────

/// Wall-clock source. `None` until time has been set from a trusted source.
pub trait WallClock: Send + Sync {
    fn now(&self) -> Option<Timestamp>;
}

/// One-shot timer that posts `ConnectRadio` when it expires.
pub trait RetryTimer: Send {
    fn arm(&mut self, after: Duration);
    fn cancel(&mut self);
}

/// Application security authentication mode.
pub trait SecurityModeSource: Send {
    fn is_enabled(&self) -> bool;
}

/// The controller emits structured [`SessionEvent`]s through this port.
pub trait EventSink: Send {
    fn emit(&mut self, event: &SessionEvent);
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Failure reported by a [`SecureChannelEngine`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineFault {
    /// Needs more datagrams; not an error.
    WouldBlock,
    /// A duplicate record was discarded.
    Duplicate,
    /// Retransmission attempts exhausted.
    Timeout,
    /// Terminal record decryption failure.
    Decrypt,
    /// The verify hook rejected the peer.
    PeerUntrusted,
    /// No session or context exists.
    NoSession,
    /// Exported state did not fit the destination buffer.
    Export,
    /// Any other engine error code.
    Fatal(i32),
}

impl EngineFault {
    /// Whether the step simply needs more input.
    pub fn is_would_block(self) -> bool {
        matches!(self, Self::WouldBlock | Self::Duplicate)
    }
}

/// Errors from [`SecureElement`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementError {
    NotProvisioned,
    Busy,
    BufferTooSmall,
    Io,
}

/// Errors from [`RegionStorage`] and [`IdentityStore`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    NotFound,
    /// Stored region size differs from the requested size.
    SizeMismatch,
    OutOfBounds,
    Full,
    /// Blob failed to encode or decode.
    Encoding,
    IoError,
}

/// Errors from link-layer sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    Busy,
    NoRoute,
    Io,
}

impl fmt::Display for EngineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "would block"),
            Self::Duplicate => write!(f, "duplicate record"),
            Self::Timeout => write!(f, "retransmissions exhausted"),
            Self::Decrypt => write!(f, "decryption failed"),
            Self::PeerUntrusted => write!(f, "peer rejected by verify hook"),
            Self::NoSession => write!(f, "no session"),
            Self::Export => write!(f, "export did not fit"),
            Self::Fatal(code) => write!(f, "engine error {code}"),
        }
    }
}

impl fmt::Display for ElementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotProvisioned => write!(f, "not provisioned"),
            Self::Busy => write!(f, "element busy"),
            Self::BufferTooSmall => write!(f, "buffer too small"),
            Self::Io => write!(f, "element I/O error"),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "region not found"),
            Self::SizeMismatch => write!(f, "region size mismatch"),
            Self::OutOfBounds => write!(f, "access outside region"),
            Self::Full => write!(f, "storage full"),
            Self::Encoding => write!(f, "blob encoding error"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "link busy"),
            Self::NoRoute => write!(f, "no route"),
            Self::Io => write!(f, "link I/O error"),
        }
    }
}
