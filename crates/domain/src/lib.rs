//! Shared domain types for the Baseplate platform core.
//!
//! Everything that crosses a crate boundary lives here: the bootstrap
//! configuration, the shared error type with its client-safe code taxonomy,
//! login/session types, and the application schema entity tree.

pub mod config;
pub mod error;
pub mod login;
pub mod schema;

pub use error::{Error, Result};

/// The binary's schema version as `major.minor`. The migration engine upgrades
/// `instance.config` key `dbVersionCut` until it matches this value.
pub const VERSION_CUT: &str = "1.4";

/// Full build version, taken from the workspace manifest.
pub const VERSION_FULL: &str = env!("CARGO_PKG_VERSION");
