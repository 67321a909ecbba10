#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use pagedtopic_core::decoration::{
    decorate, get_decoration, get_value, undecorate, DECO_CUSTOM, DECO_ID_MAX,
};

fuzz_target!(|data: &[u8]| {
    // Parse arbitrary binaries as decorated values. Tests handling of:
    // - Masks naming more decorations than the binary holds
    // - Truncated decoration lengths
    // - Extended format masks
    let bin = Bytes::copy_from_slice(data);
    let _ = get_value(&bin);
    for id in [0, DECO_CUSTOM, DECO_ID_MAX] {
        let _ = get_decoration(&bin, id);
        let _ = undecorate(&bin, id);
    }

    // A decoration we add is the decoration we read back
    if let Some((&id, rest)) = data.split_first() {
        let id = id % (DECO_ID_MAX + 1);
        let deco = Bytes::copy_from_slice(rest);
        if let Ok(decorated) = decorate(&Bytes::from_static(b"value"), id, deco.clone()) {
            assert_eq!(get_decoration(&decorated, id).unwrap(), Some(deco));
        }
    }
});
