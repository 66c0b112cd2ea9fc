//! Fuzz target for operator-supplied names.
//!
//! Session names become file names, agent names go through the registry and
//! config text goes through the layered loader. None of them may panic, and
//! inbox IDs must always be safe single path components.

#![no_main]

use corral::agents;
use corral::config::Config;
use corral::inbox::InboxId;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    let id = InboxId::for_name(s);
    let id = id.as_str();
    assert!(!id.is_empty());
    assert!(!id.starts_with('.'));
    assert!(id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-')));
    assert_eq!(InboxId::for_name(id).as_str(), id);

    if let Ok(backend) = agents::resolve(s) {
        assert!(!backend.process_patterns.is_empty());
    }

    let _ = Config::from_toml_str(s);
});
