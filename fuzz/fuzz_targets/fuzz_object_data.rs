//! Fuzz target for loose object decoding.
//!
//! Decodes arbitrary bytes as a `<type> <len>\0<payload>` object and, when
//! that succeeds, parses the payload as its typed form.

#![no_main]

use keel_storage::{decode, GitObject};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok((kind, payload)) = decode(data) else {
        return;
    };
    let object = GitObject::new(kind, payload);
    if let Ok(parsed) = object.parse() {
        let _ = parsed.to_bytes();
    }
    let _ = object.references();
});
