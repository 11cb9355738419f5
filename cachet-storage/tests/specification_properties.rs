//! Store filters and in-process specification evaluation must agree.

use cachet_storage::{to_store_filter, BackingStore, MemoryStore, StoreFilter};
use cachet_test_utils::generators::{arb_specification, arb_widgets};
use cachet_test_utils::Widget;
use proptest::prelude::*;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_store_query_matches_in_process_evaluation(
        widgets in arb_widgets(8),
        spec in arb_specification(),
    ) {
        let store: MemoryStore<Widget> = MemoryStore::new("widgets");
        store.seed(widgets.clone()).unwrap();

        let found = block_on(store.query(&to_store_filter(&spec), None)).unwrap();
        let mut got: Vec<String> = found.items.into_iter().map(|w| w.id).collect();
        got.sort();

        let mut expected: Vec<String> = widgets
            .iter()
            .filter(|w| spec.is_satisfied_by(*w).unwrap())
            .map(|w| w.id.clone())
            .collect();
        expected.sort();

        prop_assert_eq!(got, expected);
    }

    #[test]
    fn prop_limited_query_is_a_prefix(
        widgets in arb_widgets(8),
        limit in 1usize..6,
    ) {
        let store: MemoryStore<Widget> = MemoryStore::new("widgets");
        store.seed(widgets.clone()).unwrap();

        let all = block_on(store.query(&StoreFilter::All, None)).unwrap();
        let page = block_on(store.query(&StoreFilter::All, Some(limit))).unwrap();

        prop_assert_eq!(page.len(), limit.min(widgets.len()));
        prop_assert_eq!(page.has_more, widgets.len() > limit);
        prop_assert_eq!(&page.items[..], &all.items[..page.len()]);
        prop_assert_eq!(
            block_on(store.count(&StoreFilter::All, Some(limit))).unwrap(),
            limit.min(widgets.len()) as u64
        );
    }
}
