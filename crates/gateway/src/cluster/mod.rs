//! Cluster coordinator: node registration, heartbeat, request-based master
//! election and the persisted per-node event queue.

pub mod events;

pub use events::{consume, drain, publish, EventEnvelope, EventTarget};

use chrono::Utc;
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Result};
use bp_store::Db;

use crate::state::AppState;

/// Register this node (or refresh its row after a restart).
pub async fn register_node(db: &Db, node_id: Uuid, name: &str) -> Result<()> {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".into());
    let now = Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO instance_cluster.node
            (id, name, hostname, date_check_in, date_started, cluster_master, running)
         VALUES ($1, $2, $3, $4, $4, FALSE, TRUE)
         ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            hostname = EXCLUDED.hostname,
            date_check_in = EXCLUDED.date_check_in,
            date_started = EXCLUDED.date_started,
            running = TRUE",
    )
    .bind(node_id)
    .bind(name)
    .bind(&hostname)
    .bind(now)
    .execute(db.pool())
    .await
    .map_err(classify_db_error)?;

    tracing::info!(%node_id, name, hostname, "cluster node registered");
    Ok(())
}

/// Heartbeat, run by the `clusterCheckIn` task on every node. Refreshes this
/// node's `date_check_in`, mirrors the master flag into process state and
/// requests the master role when the current master has gone missing.
pub async fn check_in(state: &AppState) -> Result<()> {
    let now = Utc::now().timestamp();

    sqlx::query(
        "UPDATE instance_cluster.node SET date_check_in = $1, running = TRUE WHERE id = $2",
    )
    .bind(now)
    .bind(state.node_id)
    .execute(state.db.pool())
    .await
    .map_err(classify_db_error)?;

    let is_master: bool =
        sqlx::query_scalar("SELECT cluster_master FROM instance_cluster.node WHERE id = $1")
            .bind(state.node_id)
            .fetch_one(state.db.pool())
            .await
            .map_err(classify_db_error)?;
    state.cluster.set_master(is_master);

    if is_master {
        return Ok(());
    }

    // Election is request-based: only ask when the master looks dead. The
    // SQL function re-verifies the condition under row locks, so concurrent
    // losing requests are no-ops.
    let missing_after = state.runtime.get_i64("clusterNodeMissingAfter").max(1);
    let master_alive: bool = sqlx::query_scalar(
        "SELECT EXISTS (
            SELECT 1 FROM instance_cluster.node
            WHERE cluster_master AND date_check_in > $1
        )",
    )
    .bind(now - missing_after)
    .fetch_one(state.db.pool())
    .await
    .map_err(classify_db_error)?;

    if !master_alive {
        let won: bool = sqlx::query_scalar("SELECT instance_cluster.master_role_request($1)")
            .bind(state.node_id)
            .fetch_one(state.db.pool())
            .await
            .map_err(classify_db_error)?;
        if won {
            tracing::info!(node_id = %state.node_id, "master role acquired");
        }
    }
    Ok(())
}

/// Mark the node as stopped; part of orderly shutdown.
pub async fn set_stopped(db: &Db, node_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE instance_cluster.node SET running = FALSE WHERE id = $1")
        .bind(node_id)
        .execute(db.pool())
        .await
        .map_err(classify_db_error)?;
    Ok(())
}
