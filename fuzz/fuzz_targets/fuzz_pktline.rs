//! Fuzz target for pkt-line and side-band decoding.

#![no_main]

use keel_git::sideband::read_multiplexed;
use keel_git::PktLineReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut reader = PktLineReader::new(data);
    // Bounded so crafted input cannot loop forever on empty packets.
    for _ in 0..1000 {
        match reader.read() {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }

    let mut reader = PktLineReader::new(data);
    let _ = read_multiplexed(&mut reader);
});
