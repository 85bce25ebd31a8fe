use crate::hash::{HashProvider, XxHash64Provider};
use crate::policy::CachePolicy;
use querycache_core::{CacheTag, DbParameter, DbValue, QueryCacheError, Result};
use std::collections::BTreeSet;
use std::fmt::{self, Write as _};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identity of one cached result.
///
/// Equality and hashing use `key` and `owner` only; dependency tags ride along
/// for the store's secondary index.
#[derive(Debug, Clone)]
pub struct CacheKey {
    key: String,
    owner: String,
    dependency_tags: BTreeSet<CacheTag>,
}

impl CacheKey {
    pub fn new(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            owner: owner.into(),
            dependency_tags: BTreeSet::new(),
        }
    }

    pub fn with_dependencies(mut self, tags: BTreeSet<CacheTag>) -> Self {
        self.dependency_tags = tags;
        self
    }

    /// Prefixed hex hash; the index under which stores keep the entry.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn dependency_tags(&self) -> &BTreeSet<CacheTag> {
        &self.dependency_tags
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.owner == other.owner
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.owner.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key, self.owner)
    }
}

/// Turns a parameter value into the text that enters the canonical key string.
pub trait ValueSerializer: Send + Sync {
    fn serialize(&self, value: &DbValue) -> Result<String>;
}

/// Canonical JSON of the tagged value, e.g. `{"Int32":5}`, `{"Double":"NaN"}` or `"Null"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonValueSerializer;

impl ValueSerializer for JsonValueSerializer {
    fn serialize(&self, value: &DbValue) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }
}

/// Derives deterministic cache keys from command text, connection, parameters and salt.
#[derive(Clone)]
pub struct CacheKeyBuilder {
    hasher: Arc<dyn HashProvider>,
    serializer: Arc<dyn ValueSerializer>,
}

impl Default for CacheKeyBuilder {
    fn default() -> Self {
        Self::new(Arc::new(XxHash64Provider), Arc::new(JsonValueSerializer))
    }
}

impl CacheKeyBuilder {
    pub fn new(hasher: Arc<dyn HashProvider>, serializer: Arc<dyn ValueSerializer>) -> Self {
        Self { hasher, serializer }
    }

    /// The exact text that gets hashed. Line order is fixed: marker-free command
    /// text, connection, one line per parameter in declaration order, salt.
    pub fn canonical_string(
        &self,
        command_text: &str,
        connection_identity: &str,
        parameters: &[DbParameter],
        salt: &str,
    ) -> Result<String> {
        if command_text.trim().is_empty() {
            return Err(QueryCacheError::InvalidArgument(
                "command text must not be empty".to_string(),
            ));
        }

        let mut canonical = String::with_capacity(command_text.len() + 64);
        canonical.push_str(&CachePolicy::remove_marker(command_text));
        canonical.push('\n');
        let _ = writeln!(canonical, "ConnectionString={}", connection_identity);

        for parameter in parameters {
            let _ = writeln!(
                canonical,
                "{}={},Size={},Precision={},Scale={},Direction={}",
                parameter.name,
                self.serializer.serialize(&parameter.value)?,
                parameter.size,
                parameter.precision,
                parameter.scale,
                parameter.direction,
            );
        }

        let _ = writeln!(canonical, "SaltKey={}", salt);
        Ok(canonical)
    }

    /// Uppercase hex of the hash, with `key_prefix` prepended.
    pub fn build(
        &self,
        command_text: &str,
        connection_identity: &str,
        parameters: &[DbParameter],
        salt: &str,
        key_prefix: &str,
        owner: &str,
    ) -> Result<CacheKey> {
        let canonical =
            self.canonical_string(command_text, connection_identity, parameters, salt)?;
        let hash = self.hasher.hash_str(&canonical);
        Ok(CacheKey::new(format!("{}{:X}", key_prefix, hash), owner))
    }
}
