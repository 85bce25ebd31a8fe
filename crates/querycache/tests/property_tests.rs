//! Property-based tests for policy markers, cache keys and dependency resolution.

use proptest::prelude::*;
use querycache::{
    format_timespan, parse_timespan, CacheKey, CacheKeyBuilder, CachePolicy, CacheStore,
    CachedData, DbParameter, DependencyResolver, InMemoryCacheStore, TableEntityInfo,
};
use std::time::Duration;

fn timeout() -> impl Strategy<Value = Duration> {
    (1u64..=30 * 86_400, 0u32..10_000_000).prop_map(|(secs, ticks)| Duration::new(secs, ticks * 100))
}

fn salt() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 .:;=,-]{0,24}"
}

fn tags() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[A-Za-z][A-Za-z0-9]{0,12}", 0..=4)
}

fn policy() -> impl Strategy<Value = CachePolicy> {
    (0u8..3, timeout(), salt(), tags(), any::<bool>()).prop_map(
        |(mode, timeout, salt, tags, is_default)| {
            let builder = match mode {
                0 => CachePolicy::builder().absolute(timeout),
                1 => CachePolicy::builder().sliding(timeout),
                _ => CachePolicy::builder().never_remove(),
            };
            builder
                .salt_key(salt)
                .dependencies(tags)
                .default_policy(is_default)
                .build()
                .unwrap()
        },
    )
}

fn select_text() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ,.*=()@\\[\\]]{0,60}".prop_map(|tail| format!("SELECT {}", tail))
}

fn known_tables() -> Vec<TableEntityInfo> {
    vec![
        TableEntityInfo::new("Products").with_entity_type("Product"),
        TableEntityInfo::new("Orders").with_entity_type("Order"),
    ]
}

proptest! {
    #[test]
    fn test_marker_round_trip(policy in policy(), sql in select_text()) {
        let text = policy.embed(&sql);
        prop_assert_eq!(CachePolicy::parse(&text), Some(policy));
        prop_assert_eq!(CachePolicy::remove_marker(&text), sql);
    }

    #[test]
    fn test_timespan_round_trip(timeout in timeout()) {
        prop_assert_eq!(parse_timespan(&format_timespan(timeout)), Some(timeout));
    }

    #[test]
    fn test_remove_marker_is_idempotent(policy in policy(), sql in select_text()) {
        let once = CachePolicy::remove_marker(&policy.embed(&sql));
        prop_assert_eq!(CachePolicy::remove_marker(&once), once.clone());
    }

    #[test]
    fn test_key_ignores_marker(policy in policy(), sql in select_text(), id in any::<i32>()) {
        let builder = CacheKeyBuilder::default();
        let params = [DbParameter::new("@p0", id)];
        let plain = builder.build(&sql, "Server=.", &params, "", "EF_", "ShopContext").unwrap();
        let marked = builder
            .build(&policy.embed(&sql), "Server=.", &params, "", "EF_", "ShopContext")
            .unwrap();
        prop_assert_eq!(plain.key(), marked.key());
    }

    #[test]
    fn test_key_shape(sql in select_text(), prefix in "[A-Za-z]{0,6}_", salt in salt()) {
        let key = CacheKeyBuilder::default()
            .build(&sql, "Server=.", &[], &salt, &prefix, "ShopContext")
            .unwrap();
        let hex = key.key().strip_prefix(prefix.as_str()).unwrap();
        prop_assert!(!hex.is_empty() && hex.len() <= 16);
        prop_assert!(hex.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn test_distinct_parameters_give_distinct_keys(a in any::<i64>(), b in any::<i64>()) {
        prop_assume!(a != b);
        let builder = CacheKeyBuilder::default();
        let sql = "SELECT * FROM Orders WHERE Id = @p0";
        let first = builder
            .build(sql, "Server=.", &[DbParameter::new("@p0", a)], "", "EF_", "ShopContext")
            .unwrap();
        let second = builder
            .build(sql, "Server=.", &[DbParameter::new("@p0", b)], "", "EF_", "ShopContext")
            .unwrap();
        prop_assert_ne!(first.key(), second.key());
    }

    #[test]
    fn test_read_dependencies_never_empty(sql in select_text(), policy in prop::option::of(policy())) {
        let resolver = DependencyResolver::default();
        let tags = resolver.resolve_for_read(&sql, &known_tables(), policy.as_ref(), "EF_");
        prop_assert!(!tags.is_empty());
        prop_assert!(tags.iter().all(|tag| tag.as_str().starts_with("EF_")));
    }

    #[test]
    fn test_stored_counts_read_back(count in any::<i64>()) {
        let store = InMemoryCacheStore::default();
        let key = CacheKey::new("EF_1", "ShopContext");
        let policy = CachePolicy::never_remove();

        let read = tokio_test::block_on(async {
            store.set(&key, CachedData::NonQuery(count), &policy).await?;
            store.get(&key, &policy).await
        })
        .unwrap();
        prop_assert!(matches!(read, Some(CachedData::NonQuery(n)) if n == count));
    }
}
