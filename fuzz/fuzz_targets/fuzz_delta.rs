//! Fuzz target for delta application.
//!
//! The first byte splits the input into a base and a delta.

#![no_main]

use keel_git::{apply_delta, create_delta};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let split = (split as usize).min(rest.len());
    let (base, delta) = rest.split_at(split);
    let _ = apply_delta(base, delta);

    // Encoding any pair must round trip.
    let encoded = create_delta(base, delta);
    assert_eq!(apply_delta(base, &encoded).unwrap(), delta);
});
