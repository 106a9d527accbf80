//! Schema cache and loader.
//!
//! The cache materialises the entire application definition into memory: one
//! map per entity family plus a per-module JSON snapshot for fast client
//! transfer. All maps share a single readers-writer lock; readers always see
//! a mutually consistent snapshot, writers publish whole modules only.

mod cache;
mod loader;

pub use cache::SchemaCache;
pub use loader::{load_all, reload_meta, update};
