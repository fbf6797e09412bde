#![no_main]

use libfuzzer_sys::fuzz_target;
use mitm_ca::{parse_trust_bundle, RootAuthority};

fuzz_target!(|data: &[u8]| {
    let split = data.first().map(|byte| usize::from(*byte)).unwrap_or(0);
    let split = split.min(data.len());
    let (cert, key) = data.split_at(split);
    let _ = RootAuthority::load(cert, key);
    let _ = parse_trust_bundle(data);
});
