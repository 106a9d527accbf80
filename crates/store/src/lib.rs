//! Storage gateway for the Baseplate core: the pooled Postgres handle every
//! persistent-state access flows through, the `instance.config` cache, the
//! persisted log writer and the migration engine.

pub mod config_cache;
pub mod db;
pub mod dblog;
pub mod migrate;

pub use config_cache::ConfigCache;
pub use db::Db;
pub use dblog::{DbLog, LogContext, LogLevel};
