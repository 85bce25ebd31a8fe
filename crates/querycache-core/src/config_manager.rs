use crate::error::ConfigError;
use crate::types::{ExpirationMode, TableNameComparison};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Main configuration for QueryCache
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryCacheConfig {
    /// Engine-wide caching switches
    #[serde(default)]
    pub caching: CachingConfig,

    /// Policy applied to commands that carry no explicit policy
    #[serde(default)]
    pub global_policy: Option<GlobalPolicyConfig>,

    /// Cache store availability probing
    #[serde(default)]
    pub availability: AvailabilityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingConfig {
    /// Master switch; when false every command goes straight to the driver
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prefix for cache keys and dependency tags (tenant or application scope)
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Cache reads issued inside an explicit transaction
    #[serde(default)]
    pub allow_explicit_transactions: bool,

    /// Owner identities (context types) whose commands are never cached
    #[serde(default)]
    pub skip_owners: Vec<String>,

    /// Serialize the lookup/execute/insert section behind one process-wide gate
    #[serde(default = "default_true")]
    pub use_concurrency_gate: bool,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: default_key_prefix(),
            allow_explicit_transactions: false,
            skip_owners: Vec::new(),
            use_concurrency_gate: true,
        }
    }
}

/// Global "cache these queries" policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalPolicyConfig {
    #[serde(default)]
    pub expiration_mode: ExpirationMode,

    /// Timeout in seconds; absent for `NeverRemove`
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub scope: PolicyScope,
}

impl GlobalPolicyConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Which commands the global policy applies to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyScope {
    #[default]
    All,
    ContainingTables {
        names: Vec<String>,
        #[serde(default)]
        comparison: TableNameComparison,
    },
    ContainingEntityTypes {
        names: Vec<String>,
        #[serde(default)]
        comparison: TableNameComparison,
    },
    ExceptTables {
        names: Vec<String>,
        #[serde(default)]
        comparison: TableNameComparison,
    },
    ExceptEntityTypes {
        names: Vec<String>,
        #[serde(default)]
        comparison: TableNameComparison,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityConfig {
    /// Probe the store before using it
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum seconds between two probes
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Fall back to the driver when the store is down instead of surfacing its fault
    #[serde(default = "default_true")]
    pub fail_open: bool,
}

impl AvailabilityConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_check_interval_secs(),
            fail_open: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: pretty, json, compact
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include bound parameter values in log lines
    #[serde(default)]
    pub sensitive_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            sensitive_data: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_key_prefix() -> String {
    "EF_".to_string()
}
fn default_check_interval_secs() -> u64 {
    60
}
fn default_log_level() -> String {
    "warn".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Configuration manager with layered sources
pub struct ConfigManager {
    config: QueryCacheConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (.env file)
    /// 2. Config file (.querycache.toml)
    /// 3. Sensible defaults
    pub fn load() -> Result<Self, ConfigError> {
        info!("Loading QueryCache configuration");

        Self::load_dotenv();

        let (config, config_path) = Self::load_config_file()?;
        let config = Self::apply_env_overrides(config);
        Self::validate_config(&config)?;

        if let Some(ref path) = config_path {
            info!("Config file: {}", path.display());
        } else {
            info!("Config file: none, using defaults");
        }
        info!(
            "Caching {} (key prefix '{}')",
            if config.caching.enabled {
                "enabled"
            } else {
                "disabled"
            },
            config.caching.key_prefix
        );

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Build from an in-memory TOML document, applying validation but no env overrides
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: QueryCacheConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Self::validate_config(&config)?;
        Ok(Self {
            config,
            config_path: None,
        })
    }

    fn load_dotenv() {
        if Path::new(".env").exists() {
            if let Err(e) = dotenv::from_filename(".env") {
                warn!("Failed to load .env file: {}", e);
            }
        }
    }

    /// Search order:
    /// 1. ./.querycache.toml
    /// 2. ~/.querycache/config.toml
    /// 3. Defaults
    fn load_config_file() -> Result<(QueryCacheConfig, Option<PathBuf>), ConfigError> {
        let local_config = Path::new(".querycache.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".querycache").join("config.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        Ok((QueryCacheConfig::default(), None))
    }

    pub fn read_toml_file(path: &Path) -> Result<QueryCacheConfig, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn apply_env_overrides(mut config: QueryCacheConfig) -> QueryCacheConfig {
        if let Ok(enabled) = std::env::var("QUERYCACHE_ENABLED") {
            config.caching.enabled = parse_flag(&enabled);
        }
        if let Ok(prefix) = std::env::var("QUERYCACHE_KEY_PREFIX") {
            config.caching.key_prefix = prefix;
        }
        if let Ok(allow) = std::env::var("QUERYCACHE_ALLOW_EXPLICIT_TRANSACTIONS") {
            config.caching.allow_explicit_transactions = parse_flag(&allow);
        }
        if let Ok(gate) = std::env::var("QUERYCACHE_USE_CONCURRENCY_GATE") {
            config.caching.use_concurrency_gate = parse_flag(&gate);
        }

        if let Ok(enabled) = std::env::var("QUERYCACHE_AVAILABILITY_CHECK") {
            config.availability.enabled = parse_flag(&enabled);
        }
        if let Ok(interval) = std::env::var("QUERYCACHE_AVAILABILITY_INTERVAL_SECS") {
            if let Ok(secs) = interval.parse() {
                config.availability.check_interval_secs = secs;
            }
        }
        if let Ok(fail_open) = std::env::var("QUERYCACHE_FAIL_OPEN") {
            config.availability.fail_open = parse_flag(&fail_open);
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("QUERYCACHE_LOG_FORMAT") {
            config.logging.format = format;
        }

        config
    }

    pub fn validate_config(config: &QueryCacheConfig) -> Result<(), ConfigError> {
        if let Some(policy) = &config.global_policy {
            match (policy.expiration_mode, policy.timeout_secs) {
                (ExpirationMode::NeverRemove, _) => {}
                (_, None) | (_, Some(0)) => {
                    return Err(ConfigError::ValidationError(format!(
                        "Global {} policy requires a non-zero timeout_secs",
                        policy.expiration_mode
                    )))
                }
                _ => {}
            }

            let names = match &policy.scope {
                PolicyScope::All => None,
                PolicyScope::ContainingTables { names, .. }
                | PolicyScope::ContainingEntityTypes { names, .. }
                | PolicyScope::ExceptTables { names, .. }
                | PolicyScope::ExceptEntityTypes { names, .. } => Some(names),
            };
            if names.is_some_and(|names| names.is_empty()) {
                return Err(ConfigError::ValidationError(
                    "Global policy scope requires at least one name".to_string(),
                ));
            }
        }

        if config.availability.enabled && config.availability.check_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "availability.check_interval_secs must be greater than zero".to_string(),
            ));
        }

        match config.logging.format.as_str() {
            "pretty" | "json" | "compact" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}. Must be one of: pretty, json, compact",
                    other
                )))
            }
        }

        Ok(())
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.config
    }

    pub fn into_config(self) -> QueryCacheConfig {
        self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Write the default configuration as TOML
    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = QueryCacheConfig::default();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}
