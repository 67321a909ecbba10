#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use pagedtopic_core::{
    Page, PagedTopicSubscription, SubscriberInfo, Subscription, Usage, VersionedRecord,
};

fuzz_target!(|data: &[u8]| {
    // Every record decoder sees the same bytes. Tests handling of:
    // - Versions newer than the reader knows
    // - Bodies truncated inside a field
    // - Negative or oversized collection counts
    let bin = Bytes::copy_from_slice(data);
    let _ = Usage::decode(&bin);
    let _ = Subscription::decode(&bin);
    let _ = PagedTopicSubscription::decode(&bin);

    // Records read at any version re-encode at the current one losslessly
    if let Ok(page) = Page::decode(&bin) {
        assert_eq!(Page::decode(&page.encode()).unwrap(), page);
    }
    if let Ok(info) = SubscriberInfo::decode(&bin) {
        assert_eq!(SubscriberInfo::decode(&info.encode()).unwrap(), info);
    }
});
