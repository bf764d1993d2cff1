//! Session configuration parameters.
//!
//! Two kinds of settings live here:
//!
//! - [`AuthTimeoutConfig`]: the runtime-tunable retry bounds, persisted in
//!   the `dtls_config` region and guarded by [`AuthTimeoutStore`].
//! - [`SessionTimeouts`] / [`SessionSettings`]: fixed per-build timing and
//!   policy handed to the controller at start.

use std::ops::RangeInclusive;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::{RegionHandle, SharedStorage, StorageError, UpdateRate, lock_storage};
use crate::error::{Result, SessionError};

// ---------------------------------------------------------------------------
// Auth-timeout bounds
// ---------------------------------------------------------------------------

pub const MIN_AUTH_TIMEOUT_RANGE: RangeInclusive<u32> = 30..=600;
pub const MAX_AUTH_TIMEOUT_RANGE: RangeInclusive<u32> = 43_200..=172_800;
pub const INITIAL_AUTH_TIMEOUT_RANGE: RangeInclusive<u32> = 1_800..=43_200;

/// Name of the seldom-updated region holding [`AuthTimeoutConfig`].
pub const CONFIG_REGION: &str = "dtls_config";
const CONFIG_REGION_SIZE: usize = 32;

/// Retry-delay bounds for failed radio sessions, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTimeoutConfig {
    /// Lower bound of every randomized retry delay.
    pub min_secs: u32,
    /// Cap on the doubling backoff ceiling.
    pub max_secs: u32,
    /// Ceiling restored after a successful session.
    pub initial_secs: u32,
}

impl Default for AuthTimeoutConfig {
    fn default() -> Self {
        Self {
            min_secs: 600,       // 10 minutes
            max_secs: 86_400,    // 1 day
            initial_secs: 1_800, // 30 minutes
        }
    }
}

impl AuthTimeoutConfig {
    /// Range-check every field.
    pub fn validate(&self) -> Result<()> {
        check_min(self.min_secs)?;
        check_max(self.max_secs)?;
        check_initial(self.initial_secs)
    }
}

fn check_min(v: u32) -> Result<()> {
    if MIN_AUTH_TIMEOUT_RANGE.contains(&v) {
        Ok(())
    } else {
        Err(SessionError::ConfigOutOfRange("min_secs must be 30–600"))
    }
}

fn check_max(v: u32) -> Result<()> {
    if MAX_AUTH_TIMEOUT_RANGE.contains(&v) {
        Ok(())
    } else {
        Err(SessionError::ConfigOutOfRange("max_secs must be 43200–172800"))
    }
}

fn check_initial(v: u32) -> Result<()> {
    if INITIAL_AUTH_TIMEOUT_RANGE.contains(&v) {
        Ok(())
    } else {
        Err(SessionError::ConfigOutOfRange("initial_secs must be 1800–43200"))
    }
}

// ---------------------------------------------------------------------------
// Persisted, lock-guarded store
// ---------------------------------------------------------------------------

/// Mutex-guarded [`AuthTimeoutConfig`] backed by a storage region.
///
/// Each setter range-checks, writes the region and only then updates the
/// in-memory copy, all under one lock, so getters never observe a value
/// that failed to persist.
pub struct AuthTimeoutStore {
    inner: Mutex<AuthTimeoutConfig>,
    storage: SharedStorage,
    region: Option<RegionHandle>,
}

impl AuthTimeoutStore {
    /// Open the config region and load it, falling back to defaults when the
    /// region is absent, blank or out of range.
    pub fn open(storage: SharedStorage) -> Self {
        let (region, loaded) = {
            let mut store = lock_storage(&storage);
            match store.open(CONFIG_REGION, CONFIG_REGION_SIZE, UpdateRate::Seldom) {
                Ok(handle) => {
                    let mut buf = [0u8; CONFIG_REGION_SIZE];
                    let cfg = store
                        .read(handle, 0, &mut buf)
                        .ok()
                        .and_then(|()| postcard::from_bytes::<AuthTimeoutConfig>(&buf).ok())
                        .filter(|cfg| cfg.validate().is_ok());
                    (Some(handle), cfg)
                }
                Err(e) => {
                    warn!("config: cannot open {CONFIG_REGION}: {e}");
                    (None, None)
                }
            }
        };

        let cfg = loaded.unwrap_or_else(|| {
            info!("config: no stored auth timeouts, using defaults");
            AuthTimeoutConfig::default()
        });

        Self {
            inner: Mutex::new(cfg),
            storage,
            region,
        }
    }

    pub fn snapshot(&self) -> AuthTimeoutConfig {
        *self.lock()
    }

    pub fn min_secs(&self) -> u32 {
        self.lock().min_secs
    }

    pub fn max_secs(&self) -> u32 {
        self.lock().max_secs
    }

    pub fn initial_secs(&self) -> u32 {
        self.lock().initial_secs
    }

    pub fn set_min_secs(&self, v: u32) -> Result<()> {
        check_min(v)?;
        self.update(|cfg| cfg.min_secs = v)
    }

    pub fn set_max_secs(&self, v: u32) -> Result<()> {
        check_max(v)?;
        self.update(|cfg| cfg.max_secs = v)
    }

    pub fn set_initial_secs(&self, v: u32) -> Result<()> {
        check_initial(v)?;
        self.update(|cfg| cfg.initial_secs = v)
    }

    /// Restore and persist the default bounds.
    pub fn reset(&self) -> Result<()> {
        self.update(|cfg| *cfg = AuthTimeoutConfig::default())
    }

    fn update(&self, f: impl FnOnce(&mut AuthTimeoutConfig)) -> Result<()> {
        let mut guard = self.lock();
        let mut next = *guard;
        f(&mut next);
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }

    fn persist(&self, cfg: &AuthTimeoutConfig) -> Result<()> {
        let region = self.region.ok_or(StorageError::NotFound)?;
        let mut buf = [0u8; CONFIG_REGION_SIZE];
        postcard::to_slice(cfg, &mut buf).map_err(|_| StorageError::Encoding)?;
        lock_storage(&self.storage).write(region, 0, &buf)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AuthTimeoutConfig> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Fixed timing and policy
// ---------------------------------------------------------------------------

/// Upper bound on receive attempts per handshake flight.
pub const MAX_RX_ATTEMPTS: u32 = 5;

/// Timing used by the controller. Defaults match the deployed firmware;
/// tests shrink them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Idle wait while a radio session is connected.
    pub radio_session: Duration,
    /// Idle wait while a serial session is connected; expiry closes it.
    pub serial_session: Duration,
    /// Handshake flight timeout on radio.
    pub radio_transport: Duration,
    /// Handshake flight timeout on serial.
    pub serial_transport: Duration,
    /// Poll interval while waiting for a valid wall clock.
    pub time_check: Duration,
    /// How long `shutdown_and_wait` waits for the acknowledgement.
    pub shutdown_ack: Duration,
    /// How long `is_session_established` waits for an in-flight cache load.
    pub cache_load_wait: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            radio_session: Duration::from_secs(3 * 24 * 60 * 60),
            serial_session: Duration::from_secs(5 * 60),
            radio_transport: Duration::from_secs(10 * 60),
            serial_transport: Duration::from_secs(10),
            time_check: Duration::from_secs(30),
            shutdown_ack: Duration::from_millis(5_000),
            cache_load_wait: Duration::from_secs(1),
        }
    }
}

impl SessionTimeouts {
    /// Engine retransmission window for a transport flight timeout.
    pub fn window_for(transport_timeout: Duration) -> crate::app::ports::RetransmitWindow {
        crate::app::ports::RetransmitWindow {
            initial: transport_timeout,
            max: transport_timeout * MAX_RX_ATTEMPTS,
        }
    }
}

/// Start-up settings for [`crate::session::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub timeouts: SessionTimeouts,
    /// Tear down a radio session once the peer certificate's not-after passes.
    pub drop_session_on_expired_cert: bool,
    /// Stack for the session task, in KiB.
    pub session_stack_kb: usize,
    /// Stack for the retry-timer task, in KiB.
    pub timer_stack_kb: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeouts: SessionTimeouts::default(),
            drop_session_on_expired_cert: false,
            session_stack_kb: 16,
            timer_stack_kb: 4,
        }
    }
}
