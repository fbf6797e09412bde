#![no_main]

use libfuzzer_sys::fuzz_target;
use mitm_ca::{HostKey, HostName};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    if let Ok(name) = HostName::parse(&raw) {
        let reparsed = HostName::parse(&name.to_string()).expect("normalized name reparses");
        assert_eq!(name, reparsed);
        let _ = name.wildcard_parent();
    }
    let _ = HostKey::new(raw.split(','));
});
