//! Wall-clock adapter.
//!
//! - **`target_os = "espidf"`**: reads `gettimeofday()`, which the metering
//!   firmware sets from the head-end time sync.
//! - **`not(target_os = "espidf")`**: uses `std::time::SystemTime` for
//!   host-side testing and simulation.
//!
//! A clock earlier than 2020-01-01 has never been synced and reads as
//! invalid.

use crate::app::ports::WallClock;
use crate::verifier::asn1::Timestamp;

/// 2020-01-01T00:00:00Z.
const EPOCH_2020: u64 = 1_577_836_800;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }

    #[cfg(target_os = "espidf")]
    fn unix_secs() -> Option<u64> {
        use core::ptr;
        let mut tv = esp_idf_svc::sys::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        if unsafe { esp_idf_svc::sys::gettimeofday(&mut tv, ptr::null_mut()) } != 0 {
            return None;
        }
        u64::try_from(tv.tv_sec).ok()
    }

    #[cfg(not(target_os = "espidf"))]
    fn unix_secs() -> Option<u64> {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs())
    }
}

impl WallClock for SystemClock {
    fn now(&self) -> Option<Timestamp> {
        Self::unix_secs()
            .filter(|&secs| secs >= EPOCH_2020)
            .map(Timestamp)
    }
}
