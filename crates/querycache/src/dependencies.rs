use crate::policy::CachePolicy;
use crate::store::CacheStore;
use crate::table_names::TableNameExtractor;
use querycache_core::{CacheTag, Result, TableEntityInfo, TableName};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Name of the sentinel dependency used when no table could be determined.
pub const UNKNOWN_DEPENDENCY: &str = "UnknownsCacheDependency";

/// What happened when a command went through write-side resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationOutcome {
    /// Not a mutating command; nothing to do.
    NotMutating,
    /// A mutating command whose invalidation was vetoed by the caller.
    Skipped,
    /// These tags were invalidated in the store.
    Invalidated(BTreeSet<CacheTag>),
}

/// Maps commands to the dependency tags their cached results hang off.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    extractor: Arc<TableNameExtractor>,
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new(Arc::new(TableNameExtractor::new()))
    }
}

impl DependencyResolver {
    pub fn new(extractor: Arc<TableNameExtractor>) -> Self {
        Self { extractor }
    }

    pub fn extractor(&self) -> &TableNameExtractor {
        &self.extractor
    }

    pub fn unknown_tag(prefix: &str) -> CacheTag {
        CacheTag::new(format!("{}{}", prefix, UNKNOWN_DEPENDENCY))
    }

    /// Known tables referenced by the command, spelled the way the known list spells them.
    pub fn command_tables<'a>(
        &self,
        command_text: &str,
        known_tables: &'a [TableEntityInfo],
    ) -> Vec<&'a TableEntityInfo> {
        let found = self.extractor.extract_table_names(command_text);
        known_tables
            .iter()
            .filter(|known| found.contains(&known.table_name))
            .collect()
    }

    /// Tags for a read: known tables in the text, else the policy's explicit
    /// dependencies, else the unknown sentinel. Never empty.
    pub fn resolve_for_read(
        &self,
        command_text: &str,
        known_tables: &[TableEntityInfo],
        policy: Option<&CachePolicy>,
        prefix: &str,
    ) -> BTreeSet<CacheTag> {
        let tables: BTreeSet<TableName> = self
            .command_tables(command_text, known_tables)
            .into_iter()
            .map(|info| info.table_name.clone())
            .collect();

        if !tables.is_empty() {
            return prefix_names(prefix, tables.iter().map(TableName::as_str));
        }

        if let Some(explicit) = policy.map(CachePolicy::dependency_tags) {
            if !explicit.is_empty() {
                return prefix_names(prefix, explicit.iter().map(CacheTag::as_str));
            }
        }

        debug!(
            "No known table found in command, using {} dependency",
            UNKNOWN_DEPENDENCY
        );
        BTreeSet::from([Self::unknown_tag(prefix)])
    }

    /// Tags a mutating command invalidates, always including the unknown sentinel.
    /// `None` when the command does not mutate.
    pub fn resolve_for_write(
        &self,
        command_text: &str,
        known_tables: &[TableEntityInfo],
        prefix: &str,
    ) -> Option<BTreeSet<CacheTag>> {
        if !self.extractor.is_mutating_command(command_text) {
            return None;
        }

        let mut tags = self.resolve_for_read(command_text, known_tables, None, prefix);
        tags.insert(Self::unknown_tag(prefix));
        Some(tags)
    }

    /// Resolve write tags and invalidate them in `store`, unless `skip` vetoes the command.
    pub async fn invalidate_for_write(
        &self,
        store: &dyn CacheStore,
        command_text: &str,
        known_tables: &[TableEntityInfo],
        prefix: &str,
        skip: Option<&(dyn Fn(&str) -> bool + Send + Sync)>,
    ) -> Result<InvalidationOutcome> {
        let Some(tags) = self.resolve_for_write(command_text, known_tables, prefix) else {
            return Ok(InvalidationOutcome::NotMutating);
        };

        if skip.is_some_and(|skip| skip(command_text)) {
            return Ok(InvalidationOutcome::Skipped);
        }

        store.invalidate_tags(&tags).await?;
        Ok(InvalidationOutcome::Invalidated(tags))
    }
}

fn prefix_names<'a>(prefix: &str, names: impl Iterator<Item = &'a str>) -> BTreeSet<CacheTag> {
    names
        .map(|name| CacheTag::new(format!("{}{}", prefix, name)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::CacheKey;
    use crate::memory_store::InMemoryCacheStore;
    use crate::store::CachedData;
    use querycache_core::DbValue;
    use std::time::Duration;

    fn known() -> Vec<TableEntityInfo> {
        vec![
            TableEntityInfo::new("Products").with_entity_type("Product"),
            TableEntityInfo::new("Orders").with_entity_type("Order"),
        ]
    }

    fn tags(set: &BTreeSet<CacheTag>) -> Vec<&str> {
        set.iter().map(CacheTag::as_str).collect()
    }

    #[test]
    fn test_read_intersects_with_known_tables() {
        let resolver = DependencyResolver::default();
        let result = resolver.resolve_for_read(
            "SELECT * FROM [products] p JOIN Suppliers s ON 1=1",
            &known(),
            None,
            "EF_",
        );
        assert_eq!(tags(&result), vec!["EF_Products"]);
    }

    #[test]
    fn test_read_falls_back_to_policy_then_unknown() {
        let resolver = DependencyResolver::default();
        let policy = CachePolicy::builder()
            .absolute(Duration::from_secs(60))
            .dependencies(["Reports"])
            .build()
            .unwrap();

        let with_policy =
            resolver.resolve_for_read("EXEC dbo.GetReport", &known(), Some(&policy), "EF_");
        assert_eq!(tags(&with_policy), vec!["EF_Reports"]);

        let without = resolver.resolve_for_read("EXEC dbo.GetReport", &known(), None, "EF_");
        assert_eq!(tags(&without), vec!["EF_UnknownsCacheDependency"]);
    }

    #[test]
    fn test_write_always_includes_unknown() {
        let resolver = DependencyResolver::default();
        let result = resolver
            .resolve_for_write("DELETE FROM Products WHERE Id = 1", &known(), "EF_")
            .unwrap();
        assert_eq!(
            tags(&result),
            vec!["EF_Products", "EF_UnknownsCacheDependency"]
        );
        assert!(resolver
            .resolve_for_write("SELECT * FROM Products", &known(), "EF_")
            .is_none());
    }

    #[tokio::test]
    async fn test_invalidate_for_write_honors_veto() {
        let resolver = DependencyResolver::default();
        let store = InMemoryCacheStore::default();
        let policy = CachePolicy::never_remove();
        let key = CacheKey::new("EF_1", "Ctx")
            .with_dependencies(BTreeSet::from([CacheTag::new("EF_Products")]));
        store
            .set(&key, CachedData::Scalar(DbValue::Int32(1)), &policy)
            .await
            .unwrap();

        let veto: &(dyn Fn(&str) -> bool + Send + Sync) = &|text: &str| text.contains("Products");
        let outcome = resolver
            .invalidate_for_write(&store, "DELETE FROM Products", &known(), "EF_", Some(veto))
            .await
            .unwrap();
        assert_eq!(outcome, InvalidationOutcome::Skipped);
        assert!(store.get(&key, &policy).await.unwrap().is_some());

        let outcome = resolver
            .invalidate_for_write(&store, "DELETE FROM Products", &known(), "EF_", None)
            .await
            .unwrap();
        assert!(matches!(outcome, InvalidationOutcome::Invalidated(_)));
        assert!(store.get(&key, &policy).await.unwrap().is_none());
    }
}
