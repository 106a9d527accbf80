//! Authorized reads: run the assembled SELECT and shape the result rows.

use std::collections::{HashMap, HashSet};

use sqlx::{PgConnection, Row};
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Result};
use bp_schema::SchemaCache;

use super::query::{apply_binds, build_select};
use super::{DataGet, DataGetResult, DataRow};

pub async fn run(
    schema: &SchemaCache,
    conn: &mut PgConnection,
    roles: &HashSet<Uuid>,
    login_id: i64,
    get: &DataGet,
) -> Result<DataGetResult> {
    let built = build_select(schema, roles, login_id, get)?;

    let rows = apply_binds(sqlx::query(&built.sql), &built.binds)
        .fetch_all(conn)
        .await
        .map_err(classify_db_error)?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        // Record ids lead the columns, one per relation index; the
        // expression values follow, uniformly JSON-encoded by the builder.
        let mut index_record_ids = HashMap::with_capacity(built.record_indexes.len());
        for (column, index) in built.record_indexes.iter().enumerate() {
            let record_id: Option<i64> = row.try_get(column).map_err(classify_db_error)?;
            index_record_ids.insert(*index, record_id);
        }

        let mut values = Vec::with_capacity(built.expression_count);
        for column in 0..built.expression_count {
            let value: Option<serde_json::Value> = row
                .try_get(built.record_indexes.len() + column)
                .map_err(classify_db_error)?;
            values.push(value.unwrap_or(serde_json::Value::Null));
        }

        out.push(DataRow {
            index_record_ids,
            values,
        });
    }

    Ok(DataGetResult {
        count: out.len(),
        rows: out,
    })
}
