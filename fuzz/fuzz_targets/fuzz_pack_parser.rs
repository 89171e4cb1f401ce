//! Fuzz target for pack file parsing.
//!
//! Arbitrary bytes must be rejected with an error, never a panic, and a
//! failed ingest must leave the store empty.

#![no_main]

use keel_git::PackParser;
use keel_storage::ObjectStore;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let store = ObjectStore::memory();
    // Small depth bound keeps crafted chains cheap.
    let parser = PackParser::new().with_max_delta_depth(64);
    if parser.ingest(data, &store).is_err() {
        assert_eq!(store.len().unwrap(), 0);
    }
});
