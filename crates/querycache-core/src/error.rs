use crate::value::DbValue;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Error, Debug)]
pub enum QueryCacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid cache policy: {0}")]
    InvalidPolicy(String),

    #[error("Cache store error: {0}")]
    Store(String),

    #[error("Cache store unavailable: {0}")]
    StoreUnavailable(String),

    /// The captured value has no conversion rule to the requested type. The raw
    /// value is handed back unchanged so the caller can still inspect it.
    #[error("Cannot convert captured {} value to {target}", .found.kind())]
    TypeCoercion { target: &'static str, found: DbValue },

    #[error("Ordinal {ordinal} is out of range for {field_count} fields")]
    OrdinalOutOfRange { ordinal: usize, field_count: usize },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl QueryCacheError {
    pub fn coercion(target: &'static str, found: &DbValue) -> Self {
        Self::TypeCoercion {
            target,
            found: found.clone(),
        }
    }

    /// The raw captured value carried by a coercion failure.
    pub fn raw_value(&self) -> Option<&DbValue> {
        match self {
            Self::TypeCoercion { found, .. } => Some(found),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryCacheError>;
