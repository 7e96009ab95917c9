#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::errors::DeviceError;
    use crate::store::KvStore;
    use hwsim_proto::frame::ResponseCode;

    fn store_of(keys: &[(u32, String)]) -> KvStore {
        let mut store = KvStore::new(1000);
        for (record_type, key) in keys {
            store.put(key, "v", *record_type).unwrap();
        }
        store
    }

    proptest! {
        #[test]
        fn test_page_bounds(
            keys in prop::collection::vec((0u32..3, "[a-z]{1,6}"), 0..40),
            record_type in 0u32..3,
            start in 0usize..50,
            n in 0usize..20
        ) {
            let store = store_of(&keys);
            let page = store.get(record_type, start, n);
            prop_assert_eq!(page.fetched, page.records.len());
            prop_assert_eq!(page.fetched, n.min(page.total.saturating_sub(start)));
            prop_assert!(page.records.iter().all(|r| r.record_type == record_type));
        }

        #[test]
        fn test_pages_concatenate_to_listing(
            keys in prop::collection::vec((0u32..2, "[a-z]{1,4}"), 0..30),
            page_size in 1usize..7
        ) {
            let store = store_of(&keys);
            let full = store.get(0, 0, usize::MAX).records;
            let mut paged = Vec::new();
            let mut start = 0;
            loop {
                let page = store.get(0, start, page_size);
                if page.fetched == 0 {
                    break;
                }
                start += page.fetched;
                paged.extend(page.records);
            }
            prop_assert_eq!(paged, full);
        }

        #[test]
        fn test_restore_all_replaces(
            before in prop::collection::vec((0u32..2, "[a-z]{1,4}"), 0..20),
            after in prop::collection::vec((0u32..2, "[a-z]{1,4}"), 0..20)
        ) {
            let mut store = store_of(&before);
            let replacement = store_of(&after).records().to_vec();
            store.restore_all(replacement.clone());
            prop_assert_eq!(store.records(), replacement.as_slice());

            // New ids never collide with restored ones.
            let id = store.put("fresh-key-not-generated", "v", 9).unwrap();
            prop_assert!(replacement.iter().all(|r| r.id != id));
        }

        #[test]
        fn test_response_codes_round_trip(code in any::<u8>()) {
            if let Ok(code) = ResponseCode::try_from(code) {
                match DeviceError::from_code(code) {
                    Some(err) => prop_assert_eq!(err.code(), code),
                    None => prop_assert_eq!(code, ResponseCode::Success),
                }
            }
        }
    }
}
