//! Fuzz target: subject decoding and comparison.
//!
//! Peer certificates arrive from the network, so the `Name` decoder must
//! reject any byte sequence without panicking, and a subject that decodes
//! must always match itself.
//!
//! cargo fuzz run fuzz_subject_decode

#![no_main]

use libfuzzer_sys::fuzz_target;
use meterlink::verifier::asn1::{SUBJECT_MAX, decode_subject, subjects_match};

fuzz_target!(|data: &[u8]| {
    if let Ok(subject) = decode_subject(data) {
        assert!(subject.len() <= SUBJECT_MAX);
        assert_eq!(subjects_match(data, data), !subject.is_empty());
    }
});
