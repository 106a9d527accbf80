//! Persisted application log.
//!
//! Log rows land in `instance.log` with millisecond timestamps and the
//! writing node's id. Each of the fifteen contexts has its own threshold in
//! `instance.config` (1 = errors, 2 = errors+warnings, 3 = all); entries
//! below the threshold are dropped before any database work. A failing or
//! slow database write falls back to the process log.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config_cache::ConfigCache;
use crate::db::Db;

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error = 1,
    Warning = 2,
    Info = 3,
}

/// The fifteen log contexts. Each maps to its threshold config key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogContext {
    Api,
    Backup,
    Cache,
    Cluster,
    Csv,
    File,
    Imager,
    Ldap,
    Mail,
    Module,
    Oauth,
    Scheduler,
    Server,
    Transfer,
    Websocket,
}

impl LogContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogContext::Api => "api",
            LogContext::Backup => "backup",
            LogContext::Cache => "cache",
            LogContext::Cluster => "cluster",
            LogContext::Csv => "csv",
            LogContext::File => "file",
            LogContext::Imager => "imager",
            LogContext::Ldap => "ldap",
            LogContext::Mail => "mail",
            LogContext::Module => "module",
            LogContext::Oauth => "oauth",
            LogContext::Scheduler => "scheduler",
            LogContext::Server => "server",
            LogContext::Transfer => "transfer",
            LogContext::Websocket => "websocket",
        }
    }

    /// Config key holding this context's threshold.
    pub fn config_key(&self) -> &'static str {
        match self {
            LogContext::Api => "logApi",
            LogContext::Backup => "logBackup",
            LogContext::Cache => "logCache",
            LogContext::Cluster => "logCluster",
            LogContext::Csv => "logCsv",
            LogContext::File => "logFile",
            LogContext::Imager => "logImager",
            LogContext::Ldap => "logLdap",
            LogContext::Mail => "logMail",
            LogContext::Module => "logModule",
            LogContext::Oauth => "logOauth",
            LogContext::Scheduler => "logScheduler",
            LogContext::Server => "logServer",
            LogContext::Transfer => "logTransfer",
            LogContext::Websocket => "logWebsocket",
        }
    }
}

pub struct DbLog {
    db: Db,
    config: Arc<ConfigCache>,
    node_id: Uuid,
}

impl DbLog {
    pub fn new(db: Db, config: Arc<ConfigCache>, node_id: Uuid) -> Self {
        Self {
            db,
            config,
            node_id,
        }
    }

    /// Whether a message of `level` passes the context's threshold.
    pub fn passes(&self, context: LogContext, level: LogLevel) -> bool {
        let threshold = self.config.get_u64(context.config_key()).clamp(1, 3) as i32;
        (level as i32) <= threshold
    }

    pub async fn error(&self, context: LogContext, message: &str) {
        self.write(context, LogLevel::Error, message, None).await;
    }

    pub async fn warning(&self, context: LogContext, message: &str) {
        self.write(context, LogLevel::Warning, message, None).await;
    }

    pub async fn info(&self, context: LogContext, message: &str) {
        self.write(context, LogLevel::Info, message, None).await;
    }

    /// Write one log row, honoring the context threshold. `module_id` tags
    /// entries produced on behalf of a user module.
    pub async fn write(
        &self,
        context: LogContext,
        level: LogLevel,
        message: &str,
        module_id: Option<Uuid>,
    ) {
        if !self.passes(context, level) {
            return;
        }

        let res = tokio::time::timeout(
            WRITE_TIMEOUT,
            sqlx::query(
                "INSERT INTO instance.log (level, context, message, date_milli, node_id, module_id)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(level as i32)
            .bind(context.as_str())
            .bind(message)
            .bind(Utc::now().timestamp_millis())
            .bind(self.node_id)
            .bind(module_id)
            .execute(self.db.pool()),
        )
        .await;

        match res {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::warn!(context = context.as_str(), %err, message, "log write failed");
            }
            Err(_) => {
                tracing::warn!(context = context.as_str(), message, "log write timed out");
            }
        }
    }

    /// Delete entries older than `logsKeepDays`. Runs as the `cleanupLogs`
    /// system task.
    pub async fn cleanup(&self) -> bp_domain::Result<u64> {
        let keep_days = self.config.get_i64("logsKeepDays").max(1);
        let cutoff = Utc::now().timestamp_millis() - keep_days * 86_400_000;
        let res = sqlx::query("DELETE FROM instance.log WHERE date_milli < $1")
            .bind(cutoff)
            .execute(self.db.pool())
            .await
            .map_err(bp_domain::error::classify_db_error)?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_context_has_a_distinct_config_key() {
        let contexts = [
            LogContext::Api,
            LogContext::Backup,
            LogContext::Cache,
            LogContext::Cluster,
            LogContext::Csv,
            LogContext::File,
            LogContext::Imager,
            LogContext::Ldap,
            LogContext::Mail,
            LogContext::Module,
            LogContext::Oauth,
            LogContext::Scheduler,
            LogContext::Server,
            LogContext::Transfer,
            LogContext::Websocket,
        ];
        assert_eq!(contexts.len(), 15);

        let mut keys: Vec<&str> = contexts.iter().map(|c| c.config_key()).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), 15, "config keys must be distinct");
    }

    #[test]
    fn level_ordering_matches_thresholds() {
        // Threshold 1 admits errors only; 3 admits everything.
        assert!(LogLevel::Error as i32 <= 1);
        assert!(LogLevel::Warning as i32 <= 2);
        assert!(LogLevel::Info as i32 <= 3);
        assert!(LogLevel::Warning as i32 > 1);
        assert!(LogLevel::Info as i32 > 2);
    }
}
