//! Bootstrap configuration, read from `baseplate.toml` before the database is
//! reachable. Everything tunable at runtime lives in `instance.config` rows
//! instead and is served by the store's config cache.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Database connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(default = "d_db_host")]
    pub host: String,
    #[serde(default = "d_5432")]
    pub port: u16,
    #[serde(default = "d_db_name")]
    pub name: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    /// Require TLS for the database connection.
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "d_20")]
    pub pool_size: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: d_db_host(),
            port: 5432,
            name: d_db_name(),
            user: String::new(),
            pass: String::new(),
            ssl: false,
            pool_size: 20,
        }
    }
}

impl DbConfig {
    /// Postgres connection string for the pool.
    pub fn dsn(&self) -> String {
        let ssl_mode = if self.ssl { "require" } else { "disable" };
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.pass, self.host, self.port, self.name, ssl_mode
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Web listener
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "d_host")]
    pub listen: String,
    #[serde(default = "d_443")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: d_host(),
            port: 443,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filesystem layout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root for file attribute blobs: `<files>/<first-3-of-id>/<id>_<version>`.
    #[serde(default = "d_files")]
    pub files: PathBuf,
    /// Transfer staging for import/export.
    #[serde(default = "d_transfer")]
    pub transfer: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            files: d_files(),
            transfer: d_transfer(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cluster identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Stable node id. Generated and written back on first start when empty.
    #[serde(default)]
    pub node_id: String,
    /// Human-readable node name shown in admin views.
    #[serde(default = "d_node_name")]
    pub node_name: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            node_name: d_node_name(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Validate the bootstrap config. Errors block startup, warnings are
    /// logged and ignored.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.db.user.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "db.user must be set".into(),
            });
        }
        if self.db.name.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "db.name must be set".into(),
            });
        }
        if self.db.pool_size < 2 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "db.pool_size must be at least 2".into(),
            });
        }
        if self.paths.files.as_os_str().is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "paths.files must be set".into(),
            });
        }
        if self.db.pass.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "db.pass is empty".into(),
            });
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serde default helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_db_host() -> String {
    "localhost".into()
}
fn d_db_name() -> String {
    "baseplate".into()
}
fn d_host() -> String {
    "0.0.0.0".into()
}
fn d_node_name() -> String {
    "node".into()
}
fn d_files() -> PathBuf {
    PathBuf::from("data/files")
}
fn d_transfer() -> PathBuf {
    PathBuf::from("data/transfer")
}
fn d_5432() -> u16 {
    5432
}
fn d_443() -> u16 {
    443
}
fn d_20() -> u32 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = Config::default();
        assert_eq!(cfg.db.port, 5432);
        assert_eq!(cfg.db.pool_size, 20);
        assert_eq!(cfg.web.port, 443);
    }

    #[test]
    fn dsn_reflects_ssl_mode() {
        let mut db = DbConfig {
            user: "bp".into(),
            pass: "secret".into(),
            ..Default::default()
        };
        assert!(db.dsn().ends_with("sslmode=disable"));
        db.ssl = true;
        assert!(db.dsn().ends_with("sslmode=require"));
    }

    #[test]
    fn validate_flags_missing_user() {
        let cfg = Config::default();
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("db.user")));
    }
}
