//! Fuzz test for cache page decoding
//!
//! Cache backends hold pages as JSON written by other processes. Whatever
//! bytes come back, decoding and pruning a page must not panic, and a
//! pruned page must hold no empty maps.
//!
//! Run with: cargo +nightly fuzz run page_decode_fuzz -- -max_total_time=60

#![no_main]

use hoard_core::{CachePage, LeafKey, PageViolation};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let key = LeafKey::parse(text);
        assert_eq!(LeafKey::from_value(&key.to_value()), Some(key));
    }

    let Ok(mut page) = serde_json::from_slice::<CachePage>(data) else {
        return;
    };
    let leaves = page.leaf_count();
    page.prune();
    assert_eq!(page.leaf_count(), leaves, "pruning must not drop leaves");

    match page.validate() {
        Ok(()) => {}
        Err(PageViolation::EmptyTypeMap { .. }) | Err(PageViolation::EmptyBranchMap { .. }) => {
            panic!("pruned page still holds empty maps: {:?}", page)
        }
        Err(_) => {}
    }

    let encoded = serde_json::to_vec(&page).expect("a decoded page re-encodes");
    let decoded: CachePage = serde_json::from_slice(&encoded).expect("re-encoded page decodes");
    assert_eq!(decoded, page);
});
