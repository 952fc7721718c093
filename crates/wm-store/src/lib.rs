//! SQLite persistence for the semantic graph and temporal memory, plus
//! config loading from the data directory.

pub mod config;
pub mod error;
pub mod schema;
pub mod store;

pub use config::{CONFIG_FILE, DB_FILE, default_base_dir, load_config};
pub use error::{Result, StoreError};
pub use store::{Store, StoreStats};
