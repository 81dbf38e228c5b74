//! Fuzz target for storage key decoding and peer attribution.
//!
//! Arbitrary key bytes must never panic, and a key built from decoded
//! parts must re-encode to the same bytes.

#![no_main]

use bus_persistence::model::PeerId;
use bus_persistence::storage::{belongs_to, StorageKey};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&[u8], &str)| {
    let (bytes, peer) = data;
    let peer = PeerId::new(peer);

    // Should never panic
    let _ = belongs_to(bytes, &peer);

    let key = StorageKey::from_bytes(bytes.to_vec());
    if let Ok((decoded_peer, ticks, message_id)) = key.decode() {
        assert!(key.belongs_to(&decoded_peer));

        // Ticks are stored verbatim, so only keys whose ticks match the id's
        // own timestamp round-trip.
        if ticks == message_id.timestamp_ticks() {
            assert_eq!(StorageKey::new(&decoded_peer, &message_id), key);
        }
    }
});
