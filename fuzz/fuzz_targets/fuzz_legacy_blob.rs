//! Fuzz target: legacy session region decoding.
//!
//! Flash written by older firmware is untrusted after a partial erase;
//! decoding must either succeed within bounds or report an encoding error.
//!
//! cargo fuzz run fuzz_legacy_blob

#![no_main]

use libfuzzer_sys::fuzz_target;
use meterlink::cache::format::{LEGACY_PAYLOAD_MAX, LEGACY_REGION_SIZE, LegacyBlob, SessionBlob};

fuzz_target!(|data: &[u8]| {
    let mut region = [0u8; LEGACY_REGION_SIZE];
    let n = data.len().min(LEGACY_REGION_SIZE);
    region[..n].copy_from_slice(&data[..n]);

    if let Ok(blob) = LegacyBlob::decode(&region) {
        assert!(blob.state.len() <= LEGACY_PAYLOAD_MAX);
        let migrated = SessionBlob::Legacy(blob).migrate();
        assert!(migrated.major.payload.is_empty());
    }
});
