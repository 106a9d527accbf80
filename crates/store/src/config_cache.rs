//! Cache of `instance.config` rows. All tunable runtime behaviour lives as
//! name/value rows; values are strings parsed by the typed getters. The cache
//! is reloaded on the `configChanged` cluster event.

use std::collections::HashMap;

use parking_lot::RwLock;
use sqlx::Row;

use bp_domain::error::{classify_db_error, Result};

use crate::db::Db;

/// Default rows seeded by the baseline DDL. Kept here as the single source of
/// truth for key names; unknown keys read as empty.
pub const CONFIG_DEFAULTS: &[(&str, &str)] = &[
    ("adminMails", ""),
    ("appName", "Baseplate"),
    ("appNameShort", "Baseplate"),
    ("backupDir", ""),
    ("bruteforceAttempts", "50"),
    ("bruteforceProtection", "1"),
    ("builderMode", "0"),
    ("clusterNodeMissingAfter", "180"),
    ("companyLoginImage", ""),
    ("companyLogoUrl", ""),
    ("css", ""),
    ("dbTimeoutCsv", "120"),
    ("dbTimeoutDataRest", "60"),
    ("dbTimeoutDataWs", "300"),
    ("dbTimeoutIcs", "30"),
    ("dbVersionCut", ""),
    ("fileVersionsKeepCount", "30"),
    ("fileVersionsKeepDays", "90"),
    ("filesKeepDaysDeleted", "90"),
    ("iconPwa1", ""),
    ("iconPwa2", ""),
    ("icsDaysPost", "365"),
    ("icsDaysPre", "365"),
    ("icsDownload", "1"),
    ("instanceId", ""),
    ("logApplication", "2"),
    ("logApi", "2"),
    ("logBackup", "2"),
    ("logCache", "2"),
    ("logCluster", "2"),
    ("logCsv", "2"),
    ("logFile", "2"),
    ("logImager", "2"),
    ("logLdap", "2"),
    ("logMail", "2"),
    ("logModule", "2"),
    ("logOauth", "2"),
    ("logScheduler", "2"),
    ("logServer", "2"),
    ("logTransfer", "2"),
    ("logWebsocket", "2"),
    ("logsKeepDays", "90"),
    ("loginBackgrounds", "[]"),
    ("mailTrafficKeepDays", "90"),
    ("productionMode", "1"),
    ("proxyUrl", ""),
    ("publicHostName", "localhost"),
    ("pwForceDigit", "1"),
    ("pwForceLower", "1"),
    ("pwForceSpecial", "1"),
    ("pwForceUpper", "1"),
    ("pwLengthMin", "12"),
    ("repoFeedback", "1"),
    ("repoPass", ""),
    ("repoPublicKeys", "{}"),
    ("repoSkipVerify", "0"),
    ("repoUrl", ""),
    ("repoUser", ""),
    ("restSpoolRetryMax", "10"),
    ("systemMsgDate0", "0"),
    ("systemMsgDate1", "0"),
    ("systemMsgMaintenance", "0"),
    ("systemMsgText", ""),
    ("tokenExpiryHours", "168"),
    ("tokenKeepEnable", "1"),
    ("tokenSecret", ""),
    ("updateCheckUrl", ""),
    ("updateCheckVersion", ""),
];

/// In-memory copy of `instance.config`, guarded by a readers-writer lock.
pub struct ConfigCache {
    values: RwLock<HashMap<String, String>>,
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigCache {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the cache wholesale from the database.
    pub async fn load(&self, db: &Db) -> Result<()> {
        let rows = sqlx::query("SELECT name, value FROM instance.config")
            .fetch_all(db.pool())
            .await
            .map_err(classify_db_error)?;

        let mut values = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name").map_err(classify_db_error)?;
            let value: String = row.try_get("value").map_err(classify_db_error)?;
            values.insert(name, value);
        }

        let count = values.len();
        *self.values.write() = values;
        tracing::info!(entries = count, "instance config loaded");
        Ok(())
    }

    /// Write a value through to the database and the cache.
    pub async fn set(&self, db: &Db, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO instance.config (name, value) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(name)
        .bind(value)
        .execute(db.pool())
        .await
        .map_err(classify_db_error)?;

        self.values.write().insert(name.into(), value.into());
        Ok(())
    }

    /// Raw value; empty when the key is unknown.
    pub fn get_string(&self, name: &str) -> String {
        self.values.read().get(name).cloned().unwrap_or_default()
    }

    pub fn get_u64(&self, name: &str) -> u64 {
        self.get_string(name).parse().unwrap_or(0)
    }

    pub fn get_i64(&self, name: &str) -> i64 {
        self.get_string(name).parse().unwrap_or(0)
    }

    /// `"1"` and `"true"` parse as true.
    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.get_string(name).as_str(), "1" | "true")
    }

    /// Test/bootstrap helper: set without touching the database.
    pub fn set_local(&self, name: &str, value: &str) {
        self.values.write().insert(name.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_read_empty() {
        let cache = ConfigCache::new();
        assert_eq!(cache.get_string("publicHostName"), "");
        assert_eq!(cache.get_u64("tokenExpiryHours"), 0);
        assert!(!cache.get_bool("productionMode"));
    }

    #[test]
    fn typed_getters_parse_values() {
        let cache = ConfigCache::new();
        cache.set_local("tokenExpiryHours", "168");
        cache.set_local("productionMode", "1");
        cache.set_local("builderMode", "true");
        cache.set_local("proxyUrl", "http://proxy:3128");

        assert_eq!(cache.get_u64("tokenExpiryHours"), 168);
        assert!(cache.get_bool("productionMode"));
        assert!(cache.get_bool("builderMode"));
        assert_eq!(cache.get_string("proxyUrl"), "http://proxy:3128");
    }

    #[test]
    fn defaults_contain_every_log_context_key() {
        for ctx in [
            "logApi",
            "logBackup",
            "logCache",
            "logCluster",
            "logCsv",
            "logFile",
            "logImager",
            "logLdap",
            "logMail",
            "logModule",
            "logOauth",
            "logScheduler",
            "logServer",
            "logTransfer",
            "logWebsocket",
        ] {
            assert!(
                CONFIG_DEFAULTS.iter().any(|(k, _)| *k == ctx),
                "missing default for {ctx}"
            );
        }
    }
}
