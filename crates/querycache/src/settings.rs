use crate::command::DbCommand;
use crate::policy::CachePolicy;
use crate::store::CachedData;
use querycache_core::{
    ExpirationMode, GlobalPolicyConfig, PolicyScope, QueryCacheConfig, Result, TableEntityInfo,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type CommandPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type ResultPredicate = Arc<dyn Fn(&str, &CachedData) -> bool + Send + Sync>;
pub type PolicyOverrideHook = Arc<dyn Fn(&PolicyContext) -> PolicyOverride + Send + Sync>;
pub type KeyPrefixSelector = Arc<dyn Fn(&DbCommand) -> Option<String> + Send + Sync>;

/// Read-only view handed to the policy override hook.
#[derive(Debug, Clone)]
pub struct PolicyContext<'a> {
    pub command_text: &'a str,
    pub table_names: Vec<&'a str>,
    pub entity_types: Vec<&'a str>,
    pub is_mutating: bool,
    /// Policy resolved so far, if any.
    pub policy: Option<&'a CachePolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOverride {
    Keep,
    Replace(CachePolicy),
    /// Do not cache this command.
    Disable,
}

/// Runtime knobs that cannot live in a config file.
#[derive(Clone, Default)]
pub struct CacheHooks {
    pub skip_caching_command: Option<CommandPredicate>,
    pub skip_caching_result: Option<ResultPredicate>,
    pub skip_invalidation: Option<CommandPredicate>,
    pub override_policy: Option<PolicyOverrideHook>,
    pub key_prefix_selector: Option<KeyPrefixSelector>,
}

impl fmt::Debug for CacheHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHooks")
            .field("skip_caching_command", &self.skip_caching_command.is_some())
            .field("skip_caching_result", &self.skip_caching_result.is_some())
            .field("skip_invalidation", &self.skip_invalidation.is_some())
            .field("override_policy", &self.override_policy.is_some())
            .field("key_prefix_selector", &self.key_prefix_selector.is_some())
            .finish()
    }
}

/// Config plus hooks: everything the engine consults per command.
#[derive(Debug, Clone, Default)]
pub struct CacheSettings {
    pub config: QueryCacheConfig,
    pub hooks: CacheHooks,
}

impl CacheSettings {
    pub fn builder() -> CacheSettingsBuilder {
        CacheSettingsBuilder::default()
    }

    pub fn new(config: QueryCacheConfig) -> Self {
        Self {
            config,
            hooks: CacheHooks::default(),
        }
    }

    /// Static prefix unless the selector computes one for this command.
    pub fn key_prefix(&self, command: &DbCommand) -> String {
        self.hooks
            .key_prefix_selector
            .as_ref()
            .and_then(|select| select(command))
            .unwrap_or_else(|| self.config.caching.key_prefix.clone())
    }

    pub fn skip_owner(&self, owner: &str) -> bool {
        self.config
            .caching
            .skip_owners
            .iter()
            .any(|skipped| skipped == owner)
    }

    pub fn skip_caching_command(&self, command_text: &str) -> bool {
        self.hooks
            .skip_caching_command
            .as_ref()
            .is_some_and(|skip| skip(command_text))
    }

    pub fn skip_caching_result(&self, command_text: &str, data: &CachedData) -> bool {
        self.hooks
            .skip_caching_result
            .as_ref()
            .is_some_and(|skip| skip(command_text, data))
    }

    pub fn skip_invalidation_hook(&self) -> Option<&(dyn Fn(&str) -> bool + Send + Sync)> {
        self.hooks.skip_invalidation.as_deref()
    }

    /// Side-channel policy, then text marker, then the global policy when its
    /// scope matches. A marker flagged as default takes the global expiration.
    pub fn resolve_policy(
        &self,
        command: &DbCommand,
        command_tables: &[&TableEntityInfo],
    ) -> Option<CachePolicy> {
        let explicit = command
            .policy
            .clone()
            .or_else(|| CachePolicy::parse(&command.text));
        let global = self.config.global_policy.as_ref();

        match (explicit, global) {
            (Some(policy), Some(global)) if policy.is_default() => {
                Some(policy.with_expiration(global.expiration_mode, global.timeout()))
            }
            (Some(policy), _) => Some(policy),
            (None, Some(global)) if scope_matches(&global.scope, command_tables) => {
                global_policy(global)
            }
            (None, _) => None,
        }
    }

    /// Apply the override hook to the resolved policy.
    pub fn apply_override(&self, context: &PolicyContext<'_>) -> Option<CachePolicy> {
        let resolved = context.policy.cloned();
        let Some(hook) = self.hooks.override_policy.as_ref() else {
            return resolved;
        };
        match hook(context) {
            PolicyOverride::Keep => resolved,
            PolicyOverride::Replace(policy) => Some(policy),
            PolicyOverride::Disable => None,
        }
    }
}

fn global_policy(global: &GlobalPolicyConfig) -> Option<CachePolicy> {
    CachePolicy::builder()
        .expiration(global.expiration_mode, global.timeout())
        .build()
        .ok()
}

fn scope_matches(scope: &PolicyScope, tables: &[&TableEntityInfo]) -> bool {
    let table_names = || tables.iter().map(|t| t.table_name.as_str());
    let entity_types = || tables.iter().filter_map(|t| t.entity_type.as_deref());

    match scope {
        PolicyScope::All => true,
        PolicyScope::ContainingTables { names, comparison } => {
            comparison.matches(table_names(), names)
        }
        PolicyScope::ExceptTables { names, comparison } => {
            !comparison.matches(table_names(), names)
        }
        PolicyScope::ContainingEntityTypes { names, comparison } => {
            comparison.matches(entity_types(), names)
        }
        PolicyScope::ExceptEntityTypes { names, comparison } => {
            !comparison.matches(entity_types(), names)
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheSettingsBuilder {
    config: QueryCacheConfig,
    hooks: CacheHooks,
}

impl CacheSettingsBuilder {
    pub fn config(mut self, config: QueryCacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.caching.enabled = enabled;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.caching.key_prefix = prefix.into();
        self
    }

    pub fn allow_explicit_transactions(mut self, allow: bool) -> Self {
        self.config.caching.allow_explicit_transactions = allow;
        self
    }

    pub fn skip_owner(mut self, owner: impl Into<String>) -> Self {
        self.config.caching.skip_owners.push(owner.into());
        self
    }

    pub fn use_concurrency_gate(mut self, enabled: bool) -> Self {
        self.config.caching.use_concurrency_gate = enabled;
        self
    }

    /// Cache every query in `scope` that carries no policy of its own.
    pub fn cache_queries(
        mut self,
        mode: ExpirationMode,
        timeout: Option<Duration>,
        scope: PolicyScope,
    ) -> Self {
        self.config.global_policy = Some(GlobalPolicyConfig {
            expiration_mode: mode,
            timeout_secs: timeout.map(|t| t.as_secs()),
            scope,
        });
        self
    }

    pub fn cache_all_queries(self, mode: ExpirationMode, timeout: Option<Duration>) -> Self {
        self.cache_queries(mode, timeout, PolicyScope::All)
    }

    pub fn availability_check(mut self, enabled: bool, interval: Duration, fail_open: bool) -> Self {
        self.config.availability.enabled = enabled;
        self.config.availability.check_interval_secs = interval.as_secs();
        self.config.availability.fail_open = fail_open;
        self
    }

    pub fn skip_caching_commands<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.hooks.skip_caching_command = Some(Arc::new(predicate));
        self
    }

    pub fn skip_caching_results<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str, &CachedData) -> bool + Send + Sync + 'static,
    {
        self.hooks.skip_caching_result = Some(Arc::new(predicate));
        self
    }

    pub fn skip_invalidation<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.hooks.skip_invalidation = Some(Arc::new(predicate));
        self
    }

    pub fn override_policy<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PolicyContext) -> PolicyOverride + Send + Sync + 'static,
    {
        self.hooks.override_policy = Some(Arc::new(hook));
        self
    }

    pub fn key_prefix_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&DbCommand) -> Option<String> + Send + Sync + 'static,
    {
        self.hooks.key_prefix_selector = Some(Arc::new(selector));
        self
    }

    /// Validates the assembled config the same way a loaded file is validated.
    pub fn build(self) -> Result<CacheSettings> {
        querycache_core::ConfigManager::validate_config(&self.config)?;
        Ok(CacheSettings {
            config: self.config,
            hooks: self.hooks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use querycache_core::{QueryCacheError, TableNameComparison};

    fn tables() -> Vec<TableEntityInfo> {
        vec![
            TableEntityInfo::new("Products").with_entity_type("Product"),
            TableEntityInfo::new("AuditLogs").with_entity_type("AuditLog"),
        ]
    }

    fn refs(tables: &[TableEntityInfo]) -> Vec<&TableEntityInfo> {
        tables.iter().collect()
    }

    #[test]
    fn test_side_channel_beats_marker() {
        let settings = CacheSettings::default();
        let marker = CachePolicy::absolute(Duration::from_secs(60)).unwrap();
        let side = CachePolicy::sliding(Duration::from_secs(5)).unwrap();
        let command =
            DbCommand::new(marker.embed("SELECT * FROM Products")).with_policy(side.clone());
        assert_eq!(settings.resolve_policy(&command, &[]), Some(side));

        let command = DbCommand::new(marker.embed("SELECT * FROM Products"));
        assert_eq!(settings.resolve_policy(&command, &[]), Some(marker));
    }

    #[test]
    fn test_default_marker_takes_global_expiration() {
        let settings = CacheSettings::builder()
            .cache_all_queries(ExpirationMode::Sliding, Some(Duration::from_secs(300)))
            .build()
            .unwrap();
        let default = CachePolicy::builder()
            .absolute(Duration::from_secs(1))
            .default_policy(true)
            .build()
            .unwrap();
        let command = DbCommand::new(default.embed("SELECT 1"));
        let resolved = settings.resolve_policy(&command, &[]).unwrap();
        assert_eq!(resolved.expiration_mode(), ExpirationMode::Sliding);
        assert_eq!(resolved.timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_global_scope_by_table_and_entity() {
        let known = tables();
        let products = refs(&known[..1]);
        let audit = refs(&known[1..]);

        let settings = CacheSettings::builder()
            .cache_queries(
                ExpirationMode::Absolute,
                Some(Duration::from_secs(60)),
                PolicyScope::ExceptTables {
                    names: vec!["auditlogs".into()],
                    comparison: TableNameComparison::Contains,
                },
            )
            .build()
            .unwrap();
        let command = DbCommand::new("SELECT * FROM x");
        assert!(settings.resolve_policy(&command, &products).is_some());
        assert!(settings.resolve_policy(&command, &audit).is_none());

        let settings = CacheSettings::builder()
            .cache_queries(
                ExpirationMode::Absolute,
                Some(Duration::from_secs(60)),
                PolicyScope::ContainingEntityTypes {
                    names: vec!["Prod".into()],
                    comparison: TableNameComparison::StartsWith,
                },
            )
            .build()
            .unwrap();
        assert!(settings.resolve_policy(&command, &products).is_some());
        assert!(settings.resolve_policy(&command, &audit).is_none());
    }

    #[test]
    fn test_no_policy_without_global() {
        let settings = CacheSettings::default();
        assert!(settings
            .resolve_policy(&DbCommand::new("SELECT * FROM Products"), &[])
            .is_none());
    }

    #[test]
    fn test_override_hook() {
        let settings = CacheSettings::builder()
            .override_policy(|ctx| {
                if ctx.table_names.contains(&"AuditLogs") {
                    PolicyOverride::Disable
                } else {
                    PolicyOverride::Keep
                }
            })
            .build()
            .unwrap();
        let policy = CachePolicy::never_remove();
        let context = PolicyContext {
            command_text: "SELECT * FROM AuditLogs",
            table_names: vec!["AuditLogs"],
            entity_types: vec![],
            is_mutating: false,
            policy: Some(&policy),
        };
        assert!(settings.apply_override(&context).is_none());

        let context = PolicyContext {
            table_names: vec!["Products"],
            ..context
        };
        assert_eq!(settings.apply_override(&context), Some(policy));
    }

    #[test]
    fn test_key_prefix_selector() {
        let settings = CacheSettings::builder()
            .key_prefix("APP_")
            .key_prefix_selector(|cmd| {
                cmd.owner
                    .starts_with("Tenant")
                    .then(|| format!("{}_", cmd.owner))
            })
            .build()
            .unwrap();
        let tenant = DbCommand::new("x").with_owner("TenantA");
        let shop = DbCommand::new("x").with_owner("Shop");
        assert_eq!(settings.key_prefix(&tenant), "TenantA_");
        assert_eq!(settings.key_prefix(&shop), "APP_");
    }

    #[test]
    fn test_builder_validates_global_timeout() {
        let err = CacheSettings::builder()
            .cache_all_queries(ExpirationMode::Absolute, None)
            .build()
            .unwrap_err();
        assert!(matches!(err, QueryCacheError::Config(_)));
    }
}
