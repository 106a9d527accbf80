//! Session log: one `instance.login_session` row per established connection,
//! removed on disconnect. Feeds admin observability and targeted event
//! delivery; the `sessionsLog` task records the per-node session count.

use chrono::Utc;
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Result};
use bp_domain::login::DeviceKind;

use crate::state::AppState;

pub async fn register(
    state: &AppState,
    conn_id: Uuid,
    device: DeviceKind,
    login_id: i64,
    address: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO instance.login_session (id, device, login_id, node_id, date, address)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (id) DO UPDATE SET login_id = EXCLUDED.login_id, date = EXCLUDED.date",
    )
    .bind(conn_id)
    .bind(device.as_str())
    .bind(login_id)
    .bind(state.node_id)
    .bind(Utc::now().timestamp())
    .bind(address)
    .execute(state.db.pool())
    .await
    .map_err(classify_db_error)?;
    Ok(())
}

pub async fn remove(state: &AppState, conn_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM instance.login_session WHERE id = $1")
        .bind(conn_id)
        .execute(state.db.pool())
        .await
        .map_err(classify_db_error)?;
    Ok(())
}

/// Drop rows left behind by this node's previous run.
pub async fn remove_all_for_node(state: &AppState) -> Result<u64> {
    let res = sqlx::query("DELETE FROM instance.login_session WHERE node_id = $1")
        .bind(state.node_id)
        .execute(state.db.pool())
        .await
        .map_err(classify_db_error)?;
    Ok(res.rows_affected())
}

/// `sessionsLog` task: store the current session count on the node row.
pub async fn log_count(state: &AppState) -> Result<()> {
    sqlx::query("UPDATE instance_cluster.node SET stat_sessions = $1 WHERE id = $2")
        .bind(state.hub.count() as i32)
        .bind(state.node_id)
        .execute(state.db.pool())
        .await
        .map_err(classify_db_error)?;
    Ok(())
}
