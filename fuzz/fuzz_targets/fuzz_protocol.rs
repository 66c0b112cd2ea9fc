//! Fuzz target for protocol parsing.
//!
//! Arbitrary socket lines must never panic the server's decoder, and any
//! request that decodes must encode again.

#![no_main]

use corral::protocol::{Request, Response};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(request) = serde_json::from_slice::<Request>(data) {
        let json = serde_json::to_string(&request).expect("decoded request must encode");
        let _ = serde_json::from_str::<Request>(&json).expect("encoded request must decode");
    }

    let _ = serde_json::from_slice::<Response>(data);
});
