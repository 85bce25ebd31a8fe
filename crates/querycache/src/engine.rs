use crate::availability::AvailabilityGuard;
use crate::cache_key::{CacheKey, CacheKeyBuilder};
use crate::command::DbCommand;
use crate::dependencies::{DependencyResolver, InvalidationOutcome};
use crate::events::{CacheEvent, CacheEventKind, EventBus, EventCallback, SubscriptionId};
use crate::gate::{ConcurrencyGate, GateGuard};
use crate::policy::CachePolicy;
use crate::reader::SnapshotReader;
use crate::settings::{CacheSettings, PolicyContext};
use crate::snapshot::{capture, DataReader};
use crate::store::{CacheStore, CachedData};
use parking_lot::RwLock;
use querycache_core::{CacheTag, DbValue, QueryCacheError, Result, TableEntityInfo, ValueKind};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Answer to a "before execution" interception.
#[derive(Debug)]
pub enum Interception<T> {
    /// Run the command against the driver as usual.
    Proceed,
    /// Skip the driver; this is the cached result.
    Suppressed(T),
}

impl<T> Interception<T> {
    pub fn is_suppressed(&self) -> bool {
        matches!(self, Interception::Suppressed(_))
    }
}

/// Cursor handed back after a reader executed.
#[derive(Debug)]
pub enum ReaderOutcome<R> {
    /// The live cursor, untouched.
    Passthrough(R),
    /// The live cursor was captured; this replays what it held.
    Replay(SnapshotReader),
}

impl<R> ReaderOutcome<R> {
    pub fn is_replay(&self) -> bool {
        matches!(self, ReaderOutcome::Replay(_))
    }
}

macro_rules! delegate_reader {
    ($self:ident, $reader:ident => $call:expr) => {
        match $self {
            ReaderOutcome::Passthrough($reader) => $call,
            ReaderOutcome::Replay($reader) => $call,
        }
    };
}

impl<R: DataReader> DataReader for ReaderOutcome<R> {
    fn field_count(&self) -> usize {
        delegate_reader!(self, r => r.field_count())
    }

    fn visible_field_count(&self) -> usize {
        delegate_reader!(self, r => r.visible_field_count())
    }

    fn name(&self, ordinal: usize) -> Result<&str> {
        delegate_reader!(self, r => r.name(ordinal))
    }

    fn data_type_name(&self, ordinal: usize) -> Result<&str> {
        delegate_reader!(self, r => r.data_type_name(ordinal))
    }

    fn field_kind(&self, ordinal: usize) -> Result<ValueKind> {
        delegate_reader!(self, r => r.field_kind(ordinal))
    }

    fn read(&mut self) -> Result<bool> {
        delegate_reader!(self, r => r.read())
    }

    fn get_value(&self, ordinal: usize) -> Result<DbValue> {
        delegate_reader!(self, r => r.get_value(ordinal))
    }

    fn get_bytes(&self, ordinal: usize) -> Result<Vec<u8>> {
        delegate_reader!(self, r => r.get_bytes(ordinal))
    }

    fn is_db_null(&self, ordinal: usize) -> Result<bool> {
        delegate_reader!(self, r => r.is_db_null(ordinal))
    }

    fn records_affected(&self) -> i64 {
        delegate_reader!(self, r => r.records_affected())
    }
}

/// What to do with one command once the gate is held.
enum Plan {
    Bypass,
    Invalidate,
    Cache { key: CacheKey, policy: CachePolicy },
}

/// Transparent result cache between a data client and its driver.
pub struct QueryCacheEngine {
    settings: CacheSettings,
    store: Arc<dyn CacheStore>,
    key_builder: CacheKeyBuilder,
    resolver: DependencyResolver,
    known_tables: RwLock<Arc<Vec<TableEntityInfo>>>,
    availability: AvailabilityGuard,
    gate: ConcurrencyGate,
    events: EventBus,
    started: AtomicBool,
}

impl QueryCacheEngine {
    pub fn new(settings: CacheSettings, store: Arc<dyn CacheStore>) -> Self {
        let availability = AvailabilityGuard::new(&settings.config.availability);
        let gate = ConcurrencyGate::new(settings.config.caching.use_concurrency_gate);
        Self {
            settings,
            store,
            key_builder: CacheKeyBuilder::default(),
            resolver: DependencyResolver::default(),
            known_tables: RwLock::new(Arc::new(Vec::new())),
            availability,
            gate,
            events: EventBus::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn with_key_builder(mut self, key_builder: CacheKeyBuilder) -> Self {
        self.key_builder = key_builder;
        self
    }

    pub fn with_known_tables(self, tables: Vec<TableEntityInfo>) -> Self {
        self.set_known_tables(tables);
        self
    }

    /// Replace the tables (and their entity types) the data model maps.
    pub fn set_known_tables(&self, tables: Vec<TableEntityInfo>) {
        *self.known_tables.write() = Arc::new(tables);
    }

    pub fn known_tables(&self) -> Arc<Vec<TableEntityInfo>> {
        Arc::clone(&self.known_tables.read())
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn subscribe(&self, callback: EventCallback) -> SubscriptionId {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Drop every cached entry.
    pub async fn clear_all(&self) -> Result<()> {
        let _guard = self.gate.acquire().await;
        self.store.clear_all().await?;
        info!("Cleared all cached query results");
        Ok(())
    }

    /// Evict everything cached under the static key prefix that depends on
    /// `tables`, plus entries of unknown dependency.
    pub async fn invalidate_tables(&self, tables: &[&str]) -> Result<BTreeSet<CacheTag>> {
        let prefix = self.settings.config.caching.key_prefix.clone();
        self.invalidate_prefixed(&prefix, tables).await
    }

    /// Same as [`invalidate_tables`](Self::invalidate_tables), under the prefix the
    /// key-prefix selector computes for `command`.
    pub async fn invalidate_tables_for(
        &self,
        command: &DbCommand,
        tables: &[&str],
    ) -> Result<BTreeSet<CacheTag>> {
        let prefix = self.settings.key_prefix(command);
        self.invalidate_prefixed(&prefix, tables).await
    }

    async fn invalidate_prefixed(
        &self,
        prefix: &str,
        tables: &[&str],
    ) -> Result<BTreeSet<CacheTag>> {
        let mut tags: BTreeSet<CacheTag> = tables
            .iter()
            .map(|table| CacheTag::new(format!("{}{}", prefix, table)))
            .collect();
        tags.insert(DependencyResolver::unknown_tag(prefix));

        let _guard = self.gate.acquire().await;
        self.store.invalidate_tags(&tags).await?;
        Ok(tags)
    }

    #[instrument(skip_all)]
    pub async fn reader_executing(
        &self,
        command: &DbCommand,
        cancel: &CancellationToken,
    ) -> Result<Interception<SnapshotReader>> {
        let cached = self.lookup(command, cancel).await?;
        Ok(match cached {
            Some(CachedData::Rows(snapshot)) => {
                Interception::Suppressed(SnapshotReader::new(snapshot))
            }
            _ => Interception::Proceed,
        })
    }

    /// Capture a freshly executed reader, or invalidate when the command mutates.
    #[instrument(skip_all)]
    pub async fn reader_executed<R: DataReader>(
        &self,
        command: &DbCommand,
        mut reader: R,
        cancel: &CancellationToken,
    ) -> Result<ReaderOutcome<R>> {
        let Some(_guard) = self.enter(command, cancel).await else {
            return Ok(ReaderOutcome::Passthrough(reader));
        };

        match self.plan(command).await? {
            Plan::Bypass => Ok(ReaderOutcome::Passthrough(reader)),
            Plan::Invalidate => {
                self.invalidate(command).await?;
                Ok(ReaderOutcome::Passthrough(reader))
            }
            Plan::Cache { key, policy } => {
                let snapshot = Arc::new(capture(&mut reader)?);
                let data = CachedData::Rows(snapshot.as_ref().clone());
                self.write(command, &key, data, &policy).await?;
                Ok(ReaderOutcome::Replay(SnapshotReader::new(snapshot)))
            }
        }
    }

    #[instrument(skip_all)]
    pub async fn non_query_executing(
        &self,
        command: &DbCommand,
        cancel: &CancellationToken,
    ) -> Result<Interception<i64>> {
        let cached = self.lookup(command, cancel).await?;
        Ok(match cached {
            Some(CachedData::NonQuery(affected)) => Interception::Suppressed(affected),
            _ => Interception::Proceed,
        })
    }

    #[instrument(skip_all)]
    pub async fn non_query_executed(
        &self,
        command: &DbCommand,
        affected: i64,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        self.after_execution(command, CachedData::NonQuery(affected), cancel)
            .await?;
        Ok(affected)
    }

    #[instrument(skip_all)]
    pub async fn scalar_executing(
        &self,
        command: &DbCommand,
        cancel: &CancellationToken,
    ) -> Result<Interception<DbValue>> {
        let cached = self.lookup(command, cancel).await?;
        Ok(match cached {
            Some(CachedData::Scalar(value)) => Interception::Suppressed(value),
            Some(CachedData::Null) => Interception::Suppressed(DbValue::Null),
            _ => Interception::Proceed,
        })
    }

    #[instrument(skip_all)]
    pub async fn scalar_executed(
        &self,
        command: &DbCommand,
        value: DbValue,
        cancel: &CancellationToken,
    ) -> Result<DbValue> {
        let data = if value.is_null() {
            CachedData::Null
        } else {
            CachedData::Scalar(value.clone())
        };
        self.after_execution(command, data, cancel).await?;
        Ok(value)
    }

    /// Serve `command` from the cache or run `driver` and capture what it returns.
    pub async fn execute_reader<R, F, Fut>(
        &self,
        command: &DbCommand,
        cancel: &CancellationToken,
        driver: F,
    ) -> Result<ReaderOutcome<R>>
    where
        R: DataReader,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        match self.reader_executing(command, cancel).await? {
            Interception::Suppressed(reader) => Ok(ReaderOutcome::Replay(reader)),
            Interception::Proceed => {
                let reader = driver().await?;
                self.reader_executed(command, reader, cancel).await
            }
        }
    }

    pub async fn execute_non_query<F, Fut>(
        &self,
        command: &DbCommand,
        cancel: &CancellationToken,
        driver: F,
    ) -> Result<i64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<i64>>,
    {
        match self.non_query_executing(command, cancel).await? {
            Interception::Suppressed(affected) => Ok(affected),
            Interception::Proceed => {
                let affected = driver().await?;
                self.non_query_executed(command, affected, cancel).await
            }
        }
    }

    pub async fn execute_scalar<F, Fut>(
        &self,
        command: &DbCommand,
        cancel: &CancellationToken,
        driver: F,
    ) -> Result<DbValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DbValue>>,
    {
        match self.scalar_executing(command, cancel).await? {
            Interception::Suppressed(value) => Ok(value),
            Interception::Proceed => {
                let value = driver().await?;
                self.scalar_executed(command, value, cancel).await
            }
        }
    }

    /// Gate entry, or `None` when caching is off or the caller cancelled first.
    async fn enter(&self, command: &DbCommand, cancel: &CancellationToken) -> Option<GateGuard> {
        if !self.settings.config.caching.enabled {
            return None;
        }
        if !self.started.swap(true, Ordering::AcqRel) {
            let message = format!(
                "Query cache started with key prefix '{}'",
                self.settings.config.caching.key_prefix
            );
            self.emit(CacheEventKind::CachingSystemStarted, None, message);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.emit(
                    CacheEventKind::CachingSkipped,
                    Some(&command.text),
                    "Cancellation requested before entering the cache",
                );
                None
            }
            guard = self.gate.acquire() => Some(guard),
        }
    }

    async fn lookup(
        &self,
        command: &DbCommand,
        cancel: &CancellationToken,
    ) -> Result<Option<CachedData>> {
        let Some(_guard) = self.enter(command, cancel).await else {
            return Ok(None);
        };

        let Plan::Cache { key, policy } = self.plan(command).await? else {
            return Ok(None);
        };

        match self.store.get(&key, &policy).await {
            Ok(Some(data)) => {
                self.emit(
                    CacheEventKind::CacheHit,
                    Some(&command.text),
                    format!("Returning cached result for key {}", key),
                );
                Ok(Some(data))
            }
            Ok(None) => {
                debug!("Cache miss for key {}", key);
                Ok(None)
            }
            Err(e) => self.store_fault(command, e).map(|()| None),
        }
    }

    async fn after_execution(
        &self,
        command: &DbCommand,
        data: CachedData,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(_guard) = self.enter(command, cancel).await else {
            return Ok(());
        };

        match self.plan(command).await? {
            Plan::Bypass => Ok(()),
            Plan::Invalidate => self.invalidate(command).await,
            Plan::Cache { key, policy } => self.write(command, &key, data, &policy).await,
        }
    }

    /// Skip rules, policy and key for a command. The gate must be held.
    async fn plan(&self, command: &DbCommand) -> Result<Plan> {
        if !self.store_available(command).await? {
            return Ok(Plan::Bypass);
        }

        let known = self.known_tables();
        let is_mutating = self.resolver.extractor().is_mutating_command(&command.text);
        if is_mutating {
            return Ok(Plan::Invalidate);
        }

        if let Some(reason) = self.skip_reason(command) {
            self.emit(CacheEventKind::CachingSkipped, Some(&command.text), reason);
            return Ok(Plan::Bypass);
        }

        let tables = self.resolver.command_tables(&command.text, &known);
        let resolved = self.settings.resolve_policy(command, &tables);
        let context = PolicyContext {
            command_text: &command.text,
            table_names: tables.iter().map(|t| t.table_name.as_str()).collect(),
            entity_types: tables.iter().filter_map(|t| t.entity_type.as_deref()).collect(),
            is_mutating,
            policy: resolved.as_ref(),
        };
        let Some(policy) = self.settings.apply_override(&context) else {
            debug!("No cache policy applies to the command");
            return Ok(Plan::Bypass);
        };
        self.emit(
            CacheEventKind::CachePolicyCalculated,
            Some(&command.text),
            format!("Using policy {}", policy),
        );

        let prefix = self.settings.key_prefix(command);
        let tags = self
            .resolver
            .resolve_for_read(&command.text, &known, Some(&policy), &prefix);
        self.emit(
            CacheEventKind::CacheDependenciesCalculated,
            Some(&command.text),
            format!("Dependencies: {}", join_tags(&tags)),
        );

        let key = self
            .key_builder
            .build(
                &command.text,
                &command.connection_identity,
                &command.parameters,
                policy.salt_key(),
                &prefix,
                &command.owner,
            )?
            .with_dependencies(tags);

        if self.settings.config.logging.sensitive_data {
            debug!(
                "Cache key {} for command with parameters {:?}",
                key, command.parameters
            );
        } else {
            debug!("Cache key {} for command", key);
        }

        Ok(Plan::Cache { key, policy })
    }

    fn skip_reason(&self, command: &DbCommand) -> Option<&'static str> {
        let caching = &self.settings.config.caching;
        if self.settings.skip_owner(&command.owner) {
            Some("Owner is excluded from caching")
        } else if command.is_explicit_transaction && !caching.allow_explicit_transactions {
            Some("Command runs inside an explicit transaction")
        } else if self.settings.skip_caching_command(&command.text) {
            Some("Command matched the skip-caching predicate")
        } else {
            None
        }
    }

    async fn store_available(&self, command: &DbCommand) -> Result<bool> {
        let available = self.availability.is_available(self.store.as_ref()).await?;
        if !available {
            self.emit(
                CacheEventKind::CachingSkipped,
                Some(&command.text),
                "Cache store is unavailable",
            );
        }
        Ok(available)
    }

    async fn write(
        &self,
        command: &DbCommand,
        key: &CacheKey,
        data: CachedData,
        policy: &CachePolicy,
    ) -> Result<()> {
        if self.settings.skip_caching_result(&command.text, &data) {
            self.emit(
                CacheEventKind::CachingSkipped,
                Some(&command.text),
                "Result matched the skip-result predicate",
            );
            return Ok(());
        }

        let rows = data.row_count();
        match self.store.set(key, data, policy).await {
            Ok(()) => {
                self.emit(
                    CacheEventKind::QueryResultCached,
                    Some(&command.text),
                    format!("Cached {} rows under key {}", rows, key),
                );
                Ok(())
            }
            Err(e) => self.store_fault(command, e),
        }
    }

    async fn invalidate(&self, command: &DbCommand) -> Result<()> {
        let known = self.known_tables();
        let prefix = self.settings.key_prefix(command);
        let outcome = self
            .resolver
            .invalidate_for_write(
                self.store.as_ref(),
                &command.text,
                &known,
                &prefix,
                self.settings.skip_invalidation_hook(),
            )
            .await;

        match outcome {
            Ok(InvalidationOutcome::Invalidated(tags)) => {
                self.emit(
                    CacheEventKind::QueryResultInvalidated,
                    Some(&command.text),
                    format!("Invalidated dependencies: {}", join_tags(&tags)),
                );
                Ok(())
            }
            Ok(InvalidationOutcome::Skipped) => {
                self.emit(
                    CacheEventKind::InvalidationSkipped,
                    Some(&command.text),
                    "Command matched the skip-invalidation predicate",
                );
                Ok(())
            }
            Ok(InvalidationOutcome::NotMutating) => Ok(()),
            Err(e) => self.store_fault(command, e),
        }
    }

    /// Fail-open routes around the store; fail-closed surfaces the fault.
    fn store_fault(&self, command: &DbCommand, error: QueryCacheError) -> Result<()> {
        if self.availability.fail_open() {
            warn!("Cache store fault, continuing without cache: {}", error);
            self.availability.mark_unavailable();
            self.emit(
                CacheEventKind::CachingError,
                Some(&command.text),
                error.to_string(),
            );
            Ok(())
        } else {
            Err(error)
        }
    }

    fn emit(&self, kind: CacheEventKind, command_text: Option<&str>, message: impl Into<String>) {
        self.events.emit(CacheEvent::new(kind, command_text, message));
    }
}

fn join_tags(tags: &BTreeSet<CacheTag>) -> String {
    tags.iter()
        .map(CacheTag::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
