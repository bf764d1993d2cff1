//! On-flash session blob formats.
//!
//! ```text
//!   Current (postcard, zero-padded to region size):
//!     dtls_major  MajorBlob { cert_not_after, payload ≤ 1024 }
//!     dtls_minor  MinorBlob { payload ≤ 160 }
//!
//!   Legacy (fixed little-endian layout, previous engine generation):
//!     dtls_legacy [0] available  [1] reserved  [2..4] len u16
//!                 [4..8] not-after u32  [8..508] state
//! ```
//!
//! An all-zero region decodes to an empty blob in both formats.

use serde::{Deserialize, Serialize};

use crate::app::ports::{SessionMaterial, StorageError};
use crate::verifier::asn1::Timestamp;

pub const MAJOR_PAYLOAD_MAX: usize = 1024;
pub const MINOR_PAYLOAD_MAX: usize = 160;
pub const LEGACY_PAYLOAD_MAX: usize = 500;

/// Option tag + u64 varint + length varint + payload, rounded up.
pub const MAJOR_REGION_SIZE: usize = 1040;
/// Sized for the largest minor format ever shipped.
pub const MINOR_REGION_SIZE: usize = 168;
pub const LEGACY_REGION_SIZE: usize = 8 + LEGACY_PAYLOAD_MAX;

/// Expensive resumption material, rewritten only when a session is established.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MajorBlob {
    pub cert_not_after: Option<Timestamp>,
    pub payload: heapless::Vec<u8, MAJOR_PAYLOAD_MAX>,
}

/// Cheap per-exchange state, rewritten after every successful record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinorBlob {
    pub payload: heapless::Vec<u8, MINOR_PAYLOAD_MAX>,
}

/// A major/minor pair in the current format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentBlobs {
    pub major: MajorBlob,
    pub minor: MinorBlob,
}

impl CurrentBlobs {
    /// Only a pair with both halves present may be resumed.
    pub fn is_resumable(&self) -> bool {
        !self.major.payload.is_empty() && !self.minor.payload.is_empty()
    }
}

/// Whole-session blob written by the previous engine generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyBlob {
    pub available: bool,
    pub cert_not_after: Option<Timestamp>,
    pub state: heapless::Vec<u8, LEGACY_PAYLOAD_MAX>,
}

impl LegacyBlob {
    pub fn decode(raw: &[u8; LEGACY_REGION_SIZE]) -> Result<Self, StorageError> {
        let len = u16::from_le_bytes([raw[2], raw[3]]) as usize;
        if len > LEGACY_PAYLOAD_MAX {
            return Err(StorageError::Encoding);
        }
        let not_after = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        Ok(Self {
            available: raw[0] != 0,
            cert_not_after: (not_after != 0).then_some(Timestamp(u64::from(not_after))),
            state: heapless::Vec::from_slice(&raw[8..8 + len]).map_err(|()| StorageError::Encoding)?,
        })
    }

    pub fn encode(&self) -> [u8; LEGACY_REGION_SIZE] {
        let mut raw = [0u8; LEGACY_REGION_SIZE];
        raw[0] = u8::from(self.available);
        raw[2..4].copy_from_slice(&(self.state.len() as u16).to_le_bytes());
        let not_after = self.cert_not_after.map_or(0, |t| t.0.min(u64::from(u32::MAX)) as u32);
        raw[4..8].copy_from_slice(&not_after.to_le_bytes());
        raw[8..8 + self.state.len()].copy_from_slice(&self.state);
        raw
    }

    /// Whether this blob holds something worth handing to the engine.
    pub fn is_importable(&self) -> bool {
        !self.state.is_empty() || self.available
    }
}

/// A stored session in either on-flash format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionBlob {
    Legacy(LegacyBlob),
    Current(CurrentBlobs),
}

impl SessionBlob {
    pub fn cert_not_after(&self) -> Option<Timestamp> {
        match self {
            Self::Legacy(b) => b.cert_not_after,
            Self::Current(b) => b.major.cert_not_after,
        }
    }

    pub fn material(&self) -> SessionMaterial<'_> {
        match self {
            Self::Legacy(b) => SessionMaterial::Legacy { state: &b.state },
            Self::Current(b) => SessionMaterial::Current {
                major: &b.major.payload,
                minor: &b.minor.payload,
            },
        }
    }

    /// One-way conversion into the current layout.
    ///
    /// A legacy blob keeps its not-after in the major half and its state
    /// (truncated to the minor capacity) in the minor half. The major
    /// payload stays empty, so the result is not resumable on its own; the
    /// engine's re-export after a successful import fills it.
    pub fn migrate(self) -> CurrentBlobs {
        match self {
            Self::Current(b) => b,
            Self::Legacy(legacy) => {
                let n = legacy.state.len().min(MINOR_PAYLOAD_MAX);
                let mut minor = MinorBlob::default();
                let _ = minor.payload.extend_from_slice(&legacy.state[..n]);
                CurrentBlobs {
                    major: MajorBlob {
                        cert_not_after: legacy.cert_not_after,
                        payload: heapless::Vec::new(),
                    },
                    minor,
                }
            }
        }
    }
}
