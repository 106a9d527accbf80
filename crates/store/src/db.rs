//! Pooled, context-aware handle to the SQL backend.
//!
//! Every operation that touches persistent state flows through [`Db`]. The
//! pool is the sole arbiter of database connections and enforces the size
//! bound from the bootstrap config.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use bp_domain::config::DbConfig;
use bp_domain::error::{classify_db_error, Error, Result};

/// Pooled Postgres gateway.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect and size the pool from the bootstrap config.
    pub async fn connect(cfg: &DbConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.pool_size)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&cfg.dsn())
            .await
            .map_err(classify_db_error)?;

        tracing::info!(
            host = %cfg.host,
            database = %cfg.name,
            pool_size = cfg.pool_size,
            "database pool ready"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction. Callers commit explicitly; dropping rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(classify_db_error)
    }

    /// Run a future against the database under a deadline. Timing out maps to
    /// [`Error::ContextDeadlineExceeded`] and does not poison the connection.
    pub async fn deadline<T, F>(&self, budget: Duration, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(budget, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::ContextDeadlineExceeded),
        }
    }

    /// Drop all cached prepared statements on an idle connection. Called
    /// before the dispatcher's one-shot retry after a statement-cache
    /// signature mismatch; the pool recycles the cleaned connection for the
    /// retried batch.
    pub async fn clear_statement_cache(&self) -> Result<()> {
        use sqlx::Connection;
        let mut conn = self.pool.acquire().await.map_err(classify_db_error)?;
        conn.clear_cached_statements()
            .await
            .map_err(classify_db_error)?;
        tracing::warn!("statement cache cleared after stale-plan error");
        Ok(())
    }

    /// Close the pool. Part of orderly shutdown; no reinitialisation at
    /// runtime.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
