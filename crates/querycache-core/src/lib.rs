pub mod config_manager;
pub mod error;
pub mod logging;
pub mod types;
pub mod value;

pub use config_manager::*;
pub use error::*;
pub use logging::*;
pub use types::*;
pub use value::*;
