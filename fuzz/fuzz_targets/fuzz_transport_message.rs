//! Fuzz target for stored message decoding.
//!
//! Storage hands payload bytes back to `TransportMessage::decode` during
//! replay; corrupt payloads must be rejected, never panic.

#![no_main]

use bus_persistence::TransportMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = TransportMessage::decode(data) {
        // Anything that decodes must encode back to something decodable
        let encoded = message.encode().expect("re-encode");
        let again = TransportMessage::decode(&encoded).expect("decode re-encoded");
        assert_eq!(again, message);
    }
});
