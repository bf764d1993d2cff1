//! Session cache persistence.
//!
//! Stores resumable session material across reboots in three regions:
//!
//! ```text
//!   dtls_major  (seldom)  written when a session is established
//!   dtls_minor  (often)   written after every successful record
//!   dtls_legacy (often)   read once after upgrade, then zeroed
//! ```
//!
//! A session is resumable only if both major and minor payloads are
//! non-empty; [`SessionCache::invalidate`] zeroes the major half, which is
//! enough to make the pair unusable.

pub mod format;

use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::app::ports::{
    RegionHandle, SecureChannelEngine, SessionMaterial, SharedStorage, StorageError, UpdateRate,
    lock_storage,
};
use crate::error::{Result, SessionError};
use crate::verifier::asn1::Timestamp;
use format::{
    CurrentBlobs, LEGACY_REGION_SIZE, LegacyBlob, MAJOR_PAYLOAD_MAX, MAJOR_REGION_SIZE,
    MINOR_PAYLOAD_MAX, MINOR_REGION_SIZE, MajorBlob, MinorBlob, SessionBlob,
};

pub const MAJOR_REGION: &str = "dtls_major";
pub const MINOR_REGION: &str = "dtls_minor";
pub const LEGACY_REGION: &str = "dtls_legacy";

/// A stored session ready to be handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumedSession {
    pub blob: SessionBlob,
}

impl ResumedSession {
    pub fn material(&self) -> SessionMaterial<'_> {
        self.blob.material()
    }

    pub fn cert_not_after(&self) -> Option<Timestamp> {
        self.blob.cert_not_after()
    }

    /// Imported from the previous format; must be re-saved after import.
    pub fn is_legacy(&self) -> bool {
        matches!(self.blob, SessionBlob::Legacy(_))
    }
}

pub struct SessionCache {
    storage: SharedStorage,
    major: Option<RegionHandle>,
    minor: Option<RegionHandle>,
    legacy: Option<RegionHandle>,
    /// Legacy import is attempted at most once per boot.
    legacy_checked: bool,
}

impl SessionCache {
    /// Open all cache regions. A minor region left by older firmware with
    /// a smaller size is erased and recreated at the current size.
    pub fn open(storage: SharedStorage) -> Self {
        let (major, minor, legacy) = {
            let mut store = lock_storage(&storage);
            let major = store
                .open(MAJOR_REGION, MAJOR_REGION_SIZE, UpdateRate::Seldom)
                .map_err(|e| warn!("cache: cannot open {MAJOR_REGION}: {e}"))
                .ok();

            let minor = match store.open(MINOR_REGION, MINOR_REGION_SIZE, UpdateRate::Often) {
                Err(StorageError::SizeMismatch) => {
                    info!("cache: {MINOR_REGION} has an older size, recreating");
                    store
                        .erase(MINOR_REGION)
                        .and_then(|()| store.open(MINOR_REGION, MINOR_REGION_SIZE, UpdateRate::Often))
                }
                other => other,
            }
            .map_err(|e| warn!("cache: cannot open {MINOR_REGION}: {e}"))
            .ok();

            let legacy = store
                .open(LEGACY_REGION, LEGACY_REGION_SIZE, UpdateRate::Often)
                .map_err(|e| debug!("cache: no {LEGACY_REGION} region: {e}"))
                .ok();
            (major, minor, legacy)
        };

        Self {
            storage,
            major,
            minor,
            legacy,
            legacy_checked: false,
        }
    }

    /// Whether the current-format regions are usable.
    pub fn is_ready(&self) -> bool {
        self.major.is_some() && self.minor.is_some()
    }

    /// Find a resumable session: the one-time legacy import first, then the
    /// current-format pair.
    pub fn load(&mut self) -> Option<ResumedSession> {
        if !self.legacy_checked {
            self.legacy_checked = true;
            if let Some(legacy) = self.take_legacy() {
                info!("cache: importing legacy session ({} bytes)", legacy.state.len());
                let blob = SessionBlob::Legacy(legacy);
                if let Err(e) = self.write_current(&blob.clone().migrate()) {
                    warn!("cache: seeding current format failed: {e}");
                }
                return Some(ResumedSession { blob });
            }
        }

        let (major, minor) = (self.major?, self.minor?);
        let pair = CurrentBlobs {
            major: self.read_blob::<MajorBlob, MAJOR_REGION_SIZE>(major).ok()?,
            minor: self.read_blob::<MinorBlob, MINOR_REGION_SIZE>(minor).ok()?,
        };
        if !pair.is_resumable() {
            debug!(
                "cache: no resumable pair (major {} / minor {} bytes)",
                pair.major.payload.len(),
                pair.minor.payload.len()
            );
            return None;
        }
        Some(ResumedSession {
            blob: SessionBlob::Current(pair),
        })
    }

    /// Export the engine's resumption state into the major region.
    pub fn save_major(
        &mut self,
        engine: &mut dyn SecureChannelEngine,
        cert_not_after: Option<Timestamp>,
    ) -> Result<()> {
        let region = self.major.ok_or(StorageError::NotFound)?;
        let mut out = [0u8; MAJOR_PAYLOAD_MAX];
        let n = engine.export_major(&mut out)?;
        let blob = MajorBlob {
            cert_not_after,
            payload: heapless::Vec::from_slice(&out[..n.min(MAJOR_PAYLOAD_MAX)])
                .map_err(|()| StorageError::Encoding)?,
        };
        self.write_blob::<_, MAJOR_REGION_SIZE>(region, &blob)
    }

    /// Export the engine's per-exchange state into the minor region.
    pub fn save_minor(&mut self, engine: &mut dyn SecureChannelEngine) -> Result<()> {
        let region = self.minor.ok_or(StorageError::NotFound)?;
        let mut out = [0u8; MINOR_PAYLOAD_MAX];
        let n = engine.export_minor(&mut out)?;
        let blob = MinorBlob {
            payload: heapless::Vec::from_slice(&out[..n.min(MINOR_PAYLOAD_MAX)])
                .map_err(|()| StorageError::Encoding)?,
        };
        self.write_blob::<_, MINOR_REGION_SIZE>(region, &blob)
    }

    /// Zero the major region so no stored pair is resumable.
    pub fn invalidate(&mut self) -> Result<()> {
        let region = self.major.ok_or(StorageError::NotFound)?;
        lock_storage(&self.storage).write(region, 0, &[0u8; MAJOR_REGION_SIZE])?;
        debug!("cache: invalidated");
        Ok(())
    }

    /// Read and zero the legacy region. Returns the blob only if it holds
    /// something to import.
    fn take_legacy(&mut self) -> Option<LegacyBlob> {
        let region = self.legacy?;
        let mut raw = [0u8; LEGACY_REGION_SIZE];
        let mut store = lock_storage(&self.storage);
        if let Err(e) = store.read(region, 0, &mut raw) {
            warn!("cache: legacy region unreadable: {e}");
            return None;
        }
        if raw.iter().all(|&b| b == 0) {
            return None;
        }
        if let Err(e) = store.write(region, 0, &[0u8; LEGACY_REGION_SIZE]) {
            warn!("cache: zeroing legacy region failed: {e}");
        }
        match LegacyBlob::decode(&raw) {
            Ok(blob) if blob.is_importable() => Some(blob),
            Ok(_) => None,
            Err(e) => {
                warn!("cache: legacy blob corrupt: {e}");
                None
            }
        }
    }

    fn write_current(&mut self, pair: &CurrentBlobs) -> Result<()> {
        let (major, minor) = (
            self.major.ok_or(StorageError::NotFound)?,
            self.minor.ok_or(StorageError::NotFound)?,
        );
        self.write_blob::<_, MAJOR_REGION_SIZE>(major, &pair.major)?;
        self.write_blob::<_, MINOR_REGION_SIZE>(minor, &pair.minor)
    }

    fn read_blob<T: DeserializeOwned, const SIZE: usize>(
        &self,
        region: RegionHandle,
    ) -> Result<T> {
        let mut raw = [0u8; SIZE];
        lock_storage(&self.storage).read(region, 0, &mut raw)?;
        postcard::from_bytes(&raw).map_err(|_| SessionError::Persistence(StorageError::Encoding))
    }

    fn write_blob<T: Serialize, const SIZE: usize>(&self, region: RegionHandle, blob: &T) -> Result<()> {
        let mut raw = [0u8; SIZE];
        postcard::to_slice(blob, &mut raw).map_err(|_| StorageError::Encoding)?;
        lock_storage(&self.storage).write(region, 0, &raw)?;
        Ok(())
    }
}
