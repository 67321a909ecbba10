#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use pagedtopic_core::element::extract_position;
use pagedtopic_core::{ContentKey, PageElement};

fuzz_target!(|data: &[u8]| {
    let bin = Bytes::copy_from_slice(data);

    // Keys parsed from arbitrary bytes keep their partition on re-encoding
    if let Ok(key) = ContentKey::from_binary(&bin) {
        let partition = ContentKey::partition_of_binary(&bin).unwrap();
        let encoded = ContentKey::to_binary(partition, key.channel, key.page, key.element);
        assert_eq!(ContentKey::from_binary(&encoded).unwrap(), key);
    }

    // Stored elements with garbage metadata must fail cleanly
    let element = PageElement::from_binary(bin.clone());
    let _ = element.metadata();
    let _ = element.value_binary();
    let _ = extract_position(&bin);
});
