//! Change logs: relations with retention configured produce one
//! `instance.data_log` row per write, with per-attribute old/new value
//! children. Retention by count is pruned on write, by days through the
//! `cleanupLogs` path.

use chrono::Utc;
use serde::Serialize;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Result};
use bp_domain::schema::Relation;

use crate::state::AppState;

/// Store one change-log entry for a record write.
pub async fn record(
    conn: &mut PgConnection,
    relation: &Relation,
    record_id: i64,
    login_id: i64,
    changes: &[(Uuid, serde_json::Value, serde_json::Value)],
) -> Result<()> {
    if changes.is_empty() {
        return Ok(());
    }

    let log_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO instance.data_log (id, relation_id, record_id_wofk, login_id_wofk, date_change)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(log_id)
    .bind(relation.id)
    .bind(record_id)
    .bind(login_id)
    .bind(Utc::now().timestamp())
    .execute(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    for (attribute_id, value_old, value_new) in changes {
        sqlx::query(
            "INSERT INTO instance.data_log_value (data_log_id, attribute_id, value_old, value_new)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(log_id)
        .bind(attribute_id)
        .bind(json_to_text(value_old))
        .bind(json_to_text(value_new))
        .execute(&mut *conn)
        .await
        .map_err(classify_db_error)?;
    }

    if let Some(keep) = relation.retention_count {
        prune_by_count(conn, relation.id, record_id, keep as i64).await?;
    }
    Ok(())
}

fn json_to_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Keep only the newest `keep` entries per record.
async fn prune_by_count(
    conn: &mut PgConnection,
    relation_id: Uuid,
    record_id: i64,
    keep: i64,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM instance.data_log WHERE id IN (
            SELECT id FROM instance.data_log
            WHERE relation_id = $1 AND record_id_wofk = $2
            ORDER BY date_change DESC OFFSET $3
         )",
    )
    .bind(relation_id)
    .bind(record_id)
    .bind(keep)
    .execute(conn)
    .await
    .map_err(classify_db_error)?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataLogEntry {
    pub id: Uuid,
    pub login_id: i64,
    pub login_name: String,
    pub date_change: i64,
    pub values: Vec<DataLogValue>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataLogValue {
    pub attribute_id: Uuid,
    pub value_old: Option<String>,
    pub value_new: Option<String>,
}

/// Change history of one record, newest first.
pub async fn get_for_record(
    state: &AppState,
    relation_id: Uuid,
    record_id: i64,
) -> Result<Vec<DataLogEntry>> {
    let rows = sqlx::query(
        "SELECT l.id, l.login_id_wofk, l.date_change, COALESCE(lg.name, '') AS login_name
         FROM instance.data_log l
         LEFT JOIN instance.login lg ON lg.id = l.login_id_wofk
         WHERE l.relation_id = $1 AND l.record_id_wofk = $2
         ORDER BY l.date_change DESC",
    )
    .bind(relation_id)
    .bind(record_id)
    .fetch_all(state.db.pool())
    .await
    .map_err(classify_db_error)?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in &rows {
        let log_id: Uuid = row.try_get("id").map_err(classify_db_error)?;
        let value_rows = sqlx::query(
            "SELECT attribute_id, value_old, value_new
             FROM instance.data_log_value WHERE data_log_id = $1",
        )
        .bind(log_id)
        .fetch_all(state.db.pool())
        .await
        .map_err(classify_db_error)?;

        let values = value_rows
            .iter()
            .map(|v| {
                Ok(DataLogValue {
                    attribute_id: v.try_get("attribute_id").map_err(classify_db_error)?,
                    value_old: v.try_get("value_old").map_err(classify_db_error)?,
                    value_new: v.try_get("value_new").map_err(classify_db_error)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        entries.push(DataLogEntry {
            id: log_id,
            login_id: row.try_get("login_id_wofk").map_err(classify_db_error)?,
            login_name: row.try_get("login_name").map_err(classify_db_error)?,
            date_change: row.try_get("date_change").map_err(classify_db_error)?,
            values,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_values_store_as_text() {
        assert_eq!(json_to_text(&serde_json::Value::Null), None);
        assert_eq!(
            json_to_text(&serde_json::json!("plain")),
            Some("plain".into())
        );
        assert_eq!(json_to_text(&serde_json::json!(42)), Some("42".into()));
        assert_eq!(
            json_to_text(&serde_json::json!([1, 2])),
            Some("[1,2]".into())
        );
    }
}
