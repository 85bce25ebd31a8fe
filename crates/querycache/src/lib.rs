pub mod availability;
pub mod cache_key;
pub mod coercion;
pub mod command;
pub mod dependencies;
pub mod engine;
pub mod events;
pub mod gate;
pub mod hash;
pub mod invalidation;
pub mod memory_store;
pub mod policy;
pub mod reader;
pub mod settings;
pub mod snapshot;
pub mod store;
pub mod table_names;

pub use availability::*;
pub use cache_key::*;
pub use coercion::*;
pub use command::*;
pub use dependencies::*;
pub use engine::*;
pub use events::*;
pub use gate::*;
pub use hash::*;
pub use invalidation::*;
pub use memory_store::*;
pub use policy::*;
pub use reader::*;
pub use settings::*;
pub use snapshot::*;
pub use store::*;
pub use table_names::*;

// Re-export common types for convenience
pub use querycache_core::{
    CacheTag, DbParameter, DbValue, ExpirationMode, ParameterDirection, QueryCacheConfig,
    QueryCacheError, Result, TableEntityInfo, TableName, TableNameComparison, ValueKind,
};
pub use tokio_util::sync::CancellationToken;
