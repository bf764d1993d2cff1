//! Fuzz target: certificate time parsing.
//!
//! cargo fuzz run fuzz_peer_time

#![no_main]

use libfuzzer_sys::fuzz_target;
use meterlink::verifier::asn1::{der_total_len, parse_time};

fuzz_target!(|data: &[u8]| {
    let _ = parse_time(data);
    if let Some(len) = der_total_len(data) {
        assert!(len >= 2);
    }
});
