//! Fuzz test for page key decoding
//!
//! Feeds arbitrary bytes to `PageKey::decode` and checks that:
//! - Decoding never panics
//! - Any key that decodes re-encodes to the same bytes
//! - The decoded key sits under its namespace prefix
//!
//! Run with: cargo +nightly fuzz run page_key_fuzz -- -max_total_time=60

#![no_main]

use hoard_storage::PageKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Some(key) = PageKey::decode(data) {
        assert_eq!(key.encode(), data, "decoded key must re-encode identically");
        assert!(
            data.starts_with(&PageKey::namespace_prefix(key.namespace())),
            "key must sit under its namespace prefix"
        );
    }
});
