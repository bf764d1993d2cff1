//! Secure session core.
//!
//! ```text
//!   SessionHandle (any thread)          SessionController (session task)
//!   ──────────────────────────          ────────────────────────────────
//!   post Command ───────▶ Mailbox ───▶ step() ──▶ engine / cache / mux
//!   read state  ◀──────── atomics ◀─── publish()
//!   wait ack    ◀──────── Signal  ◀─── Shutdown
//! ```
//!
//! [`SessionState`] and [`Transport`] are written only by the controller;
//! other threads see atomic copies through [`SessionShared`].

pub mod buffer;
pub mod command;
pub mod controller;
pub mod handle;
pub mod mailbox;
pub mod observers;

use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use serde::Serialize;

use crate::config::AuthTimeoutStore;
use crate::counters::CounterStore;
use crate::verifier::PeerCertificateRecord;
use buffer::BufferPool;
use mailbox::Mailbox;
use observers::Observers;

pub use handle::{SessionHandle, start};

// ---------------------------------------------------------------------------
// State identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum SessionState {
    None = 0,
    Connecting = 1,
    Connected = 2,
    Suspended = 3,
    Failed = 4,
    ShuttingDown = 5,
}

impl SessionState {
    pub const COUNT: usize = 6;

    /// Convert a `u8` index back to `SessionState`; unknown values read as `None`.
    pub fn from_index(idx: u8) -> Self {
        match idx {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Suspended,
            4 => Self::Failed,
            5 => Self::ShuttingDown,
            _ => Self::None,
        }
    }
}

/// Physical transport that owns the session. At most one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Transport {
    None = 0,
    Radio = 1,
    Serial = 2,
}

impl Transport {
    pub fn from_index(idx: u8) -> Self {
        match idx {
            1 => Self::Radio,
            2 => Self::Serial,
            _ => Self::None,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache-load progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CacheLoad {
    NotStarted = 0,
    InProgress = 1,
    Complete = 2,
}

// ---------------------------------------------------------------------------
// State shared with handles
// ---------------------------------------------------------------------------

/// Everything the handle side may touch. Session mutation still happens
/// only on the controller's thread; this holds published copies, the
/// lock-guarded config and counters, and the signalling primitives.
pub struct SessionShared {
    pub(crate) mailbox: Mailbox,
    pub(crate) observers: Observers,
    pub(crate) pool: BufferPool,
    pub(crate) auth: AuthTimeoutStore,
    pub(crate) counters: CounterStore,
    pub(crate) peer: Mutex<PeerCertificateRecord>,
    state: AtomicU8,
    transport: AtomicU8,
    ceiling_secs: AtomicU32,
    cache_load: AtomicU8,
    /// Raised after every cache load attempt.
    pub(crate) cache_ready: Signal<CriticalSectionRawMutex, ()>,
    /// Raised once the controller has processed `Shutdown`.
    pub(crate) shutdown_ack: Signal<CriticalSectionRawMutex, ()>,
}

impl SessionShared {
    pub(crate) fn new(
        mailbox: Mailbox,
        pool: BufferPool,
        auth: AuthTimeoutStore,
        counters: CounterStore,
    ) -> Self {
        let ceiling = auth.initial_secs();
        Self {
            mailbox,
            observers: Observers::new(),
            pool,
            auth,
            counters,
            peer: Mutex::new(PeerCertificateRecord::default()),
            state: AtomicU8::new(SessionState::None as u8),
            transport: AtomicU8::new(Transport::None as u8),
            ceiling_secs: AtomicU32::new(ceiling),
            cache_load: AtomicU8::new(CacheLoad::NotStarted as u8),
            cache_ready: Signal::new(),
            shutdown_ack: Signal::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_index(self.state.load(Ordering::Acquire))
    }

    pub fn transport(&self) -> Transport {
        Transport::from_index(self.transport.load(Ordering::Acquire))
    }

    pub fn ceiling_secs(&self) -> u32 {
        self.ceiling_secs.load(Ordering::Relaxed)
    }

    pub(crate) fn publish(&self, state: SessionState, transport: Transport) {
        self.state.store(state as u8, Ordering::Release);
        self.transport.store(transport as u8, Ordering::Release);
    }

    pub(crate) fn publish_ceiling(&self, secs: u32) {
        self.ceiling_secs.store(secs, Ordering::Relaxed);
    }

    pub(crate) fn cache_load(&self) -> CacheLoad {
        match self.cache_load.load(Ordering::Acquire) {
            1 => CacheLoad::InProgress,
            2 => CacheLoad::Complete,
            _ => CacheLoad::NotStarted,
        }
    }

    pub(crate) fn begin_cache_load(&self) {
        self.cache_ready.reset();
        self.cache_load.store(CacheLoad::InProgress as u8, Ordering::Release);
    }

    pub(crate) fn finish_cache_load(&self) {
        self.cache_load.store(CacheLoad::Complete as u8, Ordering::Release);
        self.cache_ready.signal(());
    }

    pub fn peer_certificate(&self) -> PeerCertificateRecord {
        self.peer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}
