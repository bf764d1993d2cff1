//! Session traffic counters.
//!
//! Eight 32-bit counters plus the last-successful-session time, persisted
//! together in the often-updated `dtls_cached` region. A counter is written
//! back only when its value actually changed, and the write completes under
//! the same lock as the increment, so no increment is accepted before the
//! previous change is persisted.

use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::{RegionHandle, SharedStorage, StorageError, UpdateRate, lock_storage};
use crate::verifier::asn1::Timestamp;

pub const CACHED_REGION: &str = "dtls_cached";
const CACHED_REGION_SIZE: usize = 64;

/// Counter identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum Counter {
    InUcast = 0,
    InSecurityErrors = 1,
    InNoSessionErrors = 2,
    InDuplicates = 3,
    InNonApplication = 4,
    OutUcast = 5,
    OutNonApplication = 6,
    OutNoSessionErrors = 7,
}

impl Counter {
    pub const COUNT: usize = 8;

    pub const ALL: [Self; Self::COUNT] = [
        Self::InUcast,
        Self::InSecurityErrors,
        Self::InNoSessionErrors,
        Self::InDuplicates,
        Self::InNonApplication,
        Self::OutUcast,
        Self::OutNonApplication,
        Self::OutNoSessionErrors,
    ];

    pub fn from_index(idx: u8) -> Option<Self> {
        Self::ALL.get(idx as usize).copied()
    }

    /// Behaviour at `u32::MAX`.
    pub fn overflow(self) -> Overflow {
        Overflow::Roll
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::InUcast => "in_ucast",
            Self::InSecurityErrors => "in_security_errors",
            Self::InNoSessionErrors => "in_no_session_errors",
            Self::InDuplicates => "in_duplicates",
            Self::InNonApplication => "in_non_application",
            Self::OutUcast => "out_ucast",
            Self::OutNonApplication => "out_non_application",
            Self::OutNoSessionErrors => "out_no_session_errors",
        }
    }
}

/// What a counter does when incremented at `u32::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    Saturate,
    Roll,
}

impl Overflow {
    pub fn step(self, value: u32) -> u32 {
        match self {
            Self::Saturate => value.saturating_add(1),
            Self::Roll => value.wrapping_add(1),
        }
    }
}

/// Snapshot of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    values: [u32; Counter::COUNT],
}

impl Counters {
    pub fn get(&self, counter: Counter) -> u32 {
        self.values[counter as usize]
    }

    /// Returns whether the stored value changed.
    fn bump(&mut self, counter: Counter) -> bool {
        let slot = &mut self.values[counter as usize];
        let next = counter.overflow().step(*slot);
        let changed = next != *slot;
        *slot = next;
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = (Counter, u32)> + '_ {
        Counter::ALL.into_iter().map(|c| (c, self.get(c)))
    }
}

/// Everything persisted in the cached region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CachedAttrs {
    counters: Counters,
    last_session_success: Option<Timestamp>,
}

/// Lock-guarded counters and last-success time, persisted on change.
pub struct CounterStore {
    inner: Mutex<CachedAttrs>,
    storage: SharedStorage,
    region: Option<RegionHandle>,
}

impl CounterStore {
    pub fn open(storage: SharedStorage) -> Self {
        let (region, attrs) = {
            let mut store = lock_storage(&storage);
            match store.open(CACHED_REGION, CACHED_REGION_SIZE, UpdateRate::Often) {
                Ok(handle) => {
                    let mut buf = [0u8; CACHED_REGION_SIZE];
                    let attrs = store
                        .read(handle, 0, &mut buf)
                        .ok()
                        .and_then(|()| postcard::from_bytes::<CachedAttrs>(&buf).ok());
                    if attrs.is_none() {
                        info!("counters: cached region unreadable, starting from zero");
                    }
                    (Some(handle), attrs.unwrap_or_default())
                }
                Err(e) => {
                    warn!("counters: cannot open {CACHED_REGION}: {e}");
                    (None, CachedAttrs::default())
                }
            }
        };

        Self {
            inner: Mutex::new(attrs),
            storage,
            region,
        }
    }

    /// Increment `counter`, persisting the region if the value changed.
    pub fn increment(&self, counter: Counter) {
        let mut attrs = self.lock();
        if attrs.counters.bump(counter) {
            self.persist(&attrs);
        }
    }

    pub fn snapshot(&self) -> Counters {
        self.lock().counters
    }

    pub fn last_session_success(&self) -> Option<Timestamp> {
        self.lock().last_session_success
    }

    pub fn set_last_session_success(&self, at: Timestamp) {
        let mut attrs = self.lock();
        if attrs.last_session_success != Some(at) {
            attrs.last_session_success = Some(at);
            self.persist(&attrs);
        }
    }

    /// Zero every counter and persist; the last-success mark is kept.
    pub fn reset(&self) {
        let mut attrs = self.lock();
        attrs.counters = Counters::default();
        self.persist(&attrs);
    }

    /// Counter writes are best-effort; a storage hiccup never blocks traffic.
    fn persist(&self, attrs: &CachedAttrs) {
        if let Err(e) = self.write(attrs) {
            warn!("counters: persist failed: {e}");
        }
    }

    fn write(&self, attrs: &CachedAttrs) -> Result<(), StorageError> {
        let region = self.region.ok_or(StorageError::NotFound)?;
        let mut buf = [0u8; CACHED_REGION_SIZE];
        postcard::to_slice(attrs, &mut buf).map_err(|_| StorageError::Encoding)?;
        lock_storage(&self.storage).write(region, 0, &buf)
    }

    fn lock(&self) -> MutexGuard<'_, CachedAttrs> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
