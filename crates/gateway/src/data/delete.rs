//! Authorized deletes with preset protection and row policies.

use std::collections::HashSet;

use sqlx::PgConnection;
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Error, Result, SchemaEntity};
use bp_schema::SchemaCache;

use super::query::{policy_predicate, table_name, PolicyAction};
use super::set::is_preset_protected;
use super::{access, DataDelete};

pub async fn run(
    schema: &SchemaCache,
    conn: &mut PgConnection,
    roles: &HashSet<Uuid>,
    delete: &DataDelete,
) -> Result<()> {
    let relation = schema
        .relation(&delete.relation_id)
        .ok_or(Error::SchemaUnknown(SchemaEntity::Relation, delete.relation_id))?;
    access::require_relation_delete(schema, roles, &relation.id)?;

    // Preset-protected rows are schema anchors; deleting one is reported as
    // its own condition, not as a missing grant.
    if is_preset_protected(conn, &relation, delete.record_id).await? {
        return Err(Error::AppPresetProtected);
    }

    let mut sql = format!(
        "DELETE FROM {} WHERE \"id\" = $1",
        table_name(schema, &relation)?
    );
    if let Some(predicate) =
        policy_predicate(schema, roles, &relation, PolicyAction::Delete, &relation.name)?
    {
        sql.push_str(&format!(" AND {predicate}"));
    }

    let affected = sqlx::query(&sql)
        .bind(delete.record_id)
        .execute(conn)
        .await
        .map_err(classify_db_error)?
        .rows_affected();

    if affected == 0 {
        return Err(Error::Unauthorized);
    }
    Ok(())
}
