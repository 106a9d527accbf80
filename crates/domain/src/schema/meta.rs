//! Per-module platform metadata, mutated on every schema change.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row of `instance.module_meta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleMeta {
    pub module_id: Uuid,
    /// Content hash at import, empty for locally created modules.
    pub hash: String,
    pub release_build: i32,
    pub release_build_app: i32,
    pub release_date: i64,
    pub languages_custom: Vec<String>,
    /// Monotonic unix timestamp of the last successful schema update.
    pub date_change: i64,
    /// Whether this instance owns (may edit) the module.
    pub owner: bool,
    pub hidden: bool,
    pub position: i32,
}
