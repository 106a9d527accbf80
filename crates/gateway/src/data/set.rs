//! Authorized writes: create and update records across the relation indexes
//! of one `data.set` batch, applying relationship wiring, file attribute
//! changes, row policies and change logs.

use std::collections::{HashMap, HashSet};

use sqlx::{PgConnection, Row};
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Error, Result, SchemaEntity};
use bp_domain::schema::{Attribute, AttributeContent, Relation};
use bp_schema::SchemaCache;
use bp_store::migrate::quote_ident;

use super::query::{apply_binds, policy_predicate, table_name, BindValue, PolicyAction};
use super::{access, datalog, files, DataSetAttribute, DataSetCommand, DataSetResult};

/// One attribute's typed bind, derived from its schema content.
fn bind_for_attribute(attribute: &Attribute, value: &serde_json::Value) -> Result<BindValue> {
    if value.is_null() {
        return Ok(BindValue::Null);
    }
    match attribute.content {
        AttributeContent::Integer | AttributeContent::Bigint => value
            .as_i64()
            .map(BindValue::Int)
            .ok_or_else(|| bad_value(attribute, value)),
        AttributeContent::Numeric | AttributeContent::Real | AttributeContent::Double => value
            .as_f64()
            .map(BindValue::Float)
            .ok_or_else(|| bad_value(attribute, value)),
        AttributeContent::Varchar | AttributeContent::Text => value
            .as_str()
            .map(|s| BindValue::Text(s.to_string()))
            .ok_or_else(|| bad_value(attribute, value)),
        AttributeContent::Boolean => value
            .as_bool()
            .map(BindValue::Bool)
            .ok_or_else(|| bad_value(attribute, value)),
        AttributeContent::Uuid => value
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(BindValue::Uuid)
            .ok_or_else(|| bad_value(attribute, value)),
        AttributeContent::Rel11 | AttributeContent::RelN1 => value
            .as_i64()
            .map(BindValue::Int)
            .ok_or_else(|| bad_value(attribute, value)),
        AttributeContent::Files | AttributeContent::RelNm => {
            Err(Error::Internal("attribute kind is not scalar-bindable".into()))
        }
    }
}

fn bad_value(attribute: &Attribute, value: &serde_json::Value) -> Error {
    Error::Internal(format!(
        "value {value} does not fit attribute '{}'",
        attribute.name
    ))
}

/// Whether the record is pinned by a protected schema preset.
pub async fn is_preset_protected(
    conn: &mut PgConnection,
    relation: &Relation,
    record_id: i64,
) -> Result<bool> {
    if !relation.presets.iter().any(|p| p.protected) {
        return Ok(false);
    }
    sqlx::query_scalar(
        "SELECT EXISTS (
            SELECT 1 FROM instance.preset_record pr
            JOIN app.preset p ON p.id = pr.preset_id
            WHERE p.relation_id = $1 AND p.protected AND pr.record_id_wofk = $2
        )",
    )
    .bind(relation.id)
    .bind(record_id)
    .fetch_one(conn)
    .await
    .map_err(classify_db_error)
}

/// A joined write whose relationship attribute sits on the parent side: the
/// parent row gets the fk after this record exists.
struct DeferredParentUpdate {
    parent_relation_id: Uuid,
    parent_index: i32,
    attribute: Attribute,
    child_index: i32,
}

pub async fn run(
    schema: &SchemaCache,
    conn: &mut PgConnection,
    roles: &HashSet<Uuid>,
    login_id: i64,
    mut commands: Vec<DataSetCommand>,
) -> Result<DataSetResult> {
    commands.sort_by_key(|c| c.index);

    let mut index_record_ids: HashMap<i32, i64> = HashMap::new();
    let mut deferred: Vec<DeferredParentUpdate> = Vec::new();

    for command in &commands {
        let relation = schema
            .relation(&command.relation_id)
            .ok_or(Error::SchemaUnknown(SchemaEntity::Relation, command.relation_id))?;
        access::require_relation_write(schema, roles, &relation.id)?;

        // Partition the value set: scalars go into the statement, file
        // values into the attribute's record table afterwards.
        let mut scalar: Vec<(Attribute, BindValue, serde_json::Value)> = Vec::new();
        let mut file_values: Vec<(Attribute, serde_json::Value)> = Vec::new();
        for DataSetAttribute {
            attribute_id,
            value,
        } in &command.attributes
        {
            let attribute = schema
                .attribute(attribute_id)
                .ok_or(Error::SchemaUnknown(SchemaEntity::Attribute, *attribute_id))?;
            access::require_attribute_write(schema, roles, &attribute.id)?;

            match attribute.content {
                AttributeContent::Files => file_values.push((attribute, value.clone())),
                AttributeContent::RelNm => {
                    // n:m is modelled as an own relation with two n:1 sides;
                    // nothing to write here.
                    return Err(Error::Internal(
                        "n:m attributes are written through their own relation".into(),
                    ));
                }
                _ => {
                    let bind = bind_for_attribute(&attribute, value)?;
                    scalar.push((attribute, bind, value.clone()));
                }
            }
        }

        // Relationship wiring to the parent index.
        if let Some(attribute_id) = command.attribute_id {
            let attribute = schema
                .attribute(&attribute_id)
                .ok_or(Error::SchemaUnknown(SchemaEntity::Attribute, attribute_id))?;
            if attribute.relation_id == command.relation_id {
                // fk on this record, pointing at the parent.
                let parent_id = *index_record_ids.get(&command.index_from).ok_or_else(|| {
                    Error::Internal(format!(
                        "relation index {} resolves before {}",
                        command.index_from, command.index
                    ))
                })?;
                scalar.push((
                    attribute,
                    BindValue::Int(parent_id),
                    serde_json::json!(parent_id),
                ));
            } else {
                // fk on the parent; wired after this record exists.
                deferred.push(DeferredParentUpdate {
                    parent_relation_id: attribute.relation_id,
                    parent_index: command.index_from,
                    attribute,
                    child_index: command.index,
                });
            }
        }

        let record_id = if command.record_id == 0 {
            create_record(schema, conn, &relation, &scalar, login_id).await?
        } else {
            update_record(schema, conn, roles, &relation, command.record_id, &scalar, login_id)
                .await?;
            command.record_id
        };
        index_record_ids.insert(command.index, record_id);

        for (attribute, value) in file_values {
            files::apply_attribute_changes(conn, &attribute, record_id, &value).await?;
        }
    }

    // Parent-side fks now that every index has its record id.
    for update in deferred {
        let parent = schema
            .relation(&update.parent_relation_id)
            .ok_or(Error::SchemaUnknown(SchemaEntity::Relation, update.parent_relation_id))?;
        let parent_id = index_record_ids
            .get(&update.parent_index)
            .ok_or_else(|| Error::Internal("parent index without record".into()))?;
        let child_id = index_record_ids
            .get(&update.child_index)
            .ok_or_else(|| Error::Internal("child index without record".into()))?;

        let sql = format!(
            "UPDATE {} SET {} = $1 WHERE \"id\" = $2",
            table_name(schema, &parent)?,
            quote_ident(&update.attribute.name)
        );
        sqlx::query(&sql)
            .bind(child_id)
            .bind(parent_id)
            .execute(&mut *conn)
            .await
            .map_err(classify_db_error)?;
    }

    Ok(DataSetResult { index_record_ids })
}

async fn create_record(
    schema: &SchemaCache,
    conn: &mut PgConnection,
    relation: &Relation,
    scalar: &[(Attribute, BindValue, serde_json::Value)],
    login_id: i64,
) -> Result<i64> {
    let table = table_name(schema, relation)?;

    let record_id: i64 = if scalar.is_empty() {
        let sql = format!("INSERT INTO {table} DEFAULT VALUES RETURNING \"id\"");
        sqlx::query_scalar(&sql)
            .fetch_one(&mut *conn)
            .await
            .map_err(classify_db_error)?
    } else {
        let columns: Vec<String> = scalar
            .iter()
            .map(|(attribute, _, _)| quote_ident(&attribute.name))
            .collect();
        let placeholders: Vec<String> =
            (1..=scalar.len()).map(|n| format!("${n}")).collect();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({}) RETURNING \"id\"",
            columns.join(", "),
            placeholders.join(", ")
        );
        let binds: Vec<BindValue> = scalar.iter().map(|(_, bind, _)| bind.clone()).collect();
        apply_binds(sqlx::query(&sql), &binds)
            .fetch_one(&mut *conn)
            .await
            .map_err(classify_db_error)?
            .try_get(0)
            .map_err(classify_db_error)?
    };

    if relation.has_retention() {
        let changes: Vec<(Uuid, serde_json::Value, serde_json::Value)> = scalar
            .iter()
            .map(|(attribute, _, value)| {
                (attribute.id, serde_json::Value::Null, value.clone())
            })
            .collect();
        datalog::record(conn, relation, record_id, login_id, &changes).await?;
    }

    Ok(record_id)
}

async fn update_record(
    schema: &SchemaCache,
    conn: &mut PgConnection,
    roles: &HashSet<Uuid>,
    relation: &Relation,
    record_id: i64,
    scalar: &[(Attribute, BindValue, serde_json::Value)],
    login_id: i64,
) -> Result<()> {
    if scalar.is_empty() {
        return Ok(());
    }
    if is_preset_protected(conn, relation, record_id).await? {
        return Err(Error::AppPresetProtected);
    }

    let table = table_name(schema, relation)?;

    // Old values feed the change log; the row lock serialises concurrent
    // writers on the same record.
    let old_values: Option<Vec<serde_json::Value>> = if relation.has_retention() {
        let columns: Vec<String> = scalar
            .iter()
            .map(|(attribute, _, _)| format!("TO_JSONB({})", quote_ident(&attribute.name)))
            .collect();
        let sql = format!(
            "SELECT {} FROM {table} WHERE \"id\" = $1 FOR UPDATE",
            columns.join(", ")
        );
        let row = sqlx::query(&sql)
            .bind(record_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(classify_db_error)?;
        row.map(|row| {
            (0..scalar.len())
                .map(|column| {
                    row.try_get::<Option<serde_json::Value>, _>(column)
                        .ok()
                        .flatten()
                        .unwrap_or(serde_json::Value::Null)
                })
                .collect()
        })
    } else {
        None
    };

    let assignments: Vec<String> = scalar
        .iter()
        .enumerate()
        .map(|(position, (attribute, _, _))| {
            format!("{} = ${}", quote_ident(&attribute.name), position + 1)
        })
        .collect();
    let mut sql = format!(
        "UPDATE {table} SET {} WHERE \"id\" = ${}",
        assignments.join(", "),
        scalar.len() + 1
    );
    if let Some(predicate) =
        policy_predicate(schema, roles, relation, PolicyAction::Update, &relation.name)?
    {
        // The policy predicate addresses the table by alias; in an UPDATE
        // the alias is the bare table name.
        sql.push_str(&format!(" AND {predicate}"));
    }

    let mut binds: Vec<BindValue> = scalar.iter().map(|(_, bind, _)| bind.clone()).collect();
    binds.push(BindValue::Int(record_id));

    let affected = apply_binds(sqlx::query(&sql), &binds)
        .execute(&mut *conn)
        .await
        .map_err(classify_db_error)?
        .rows_affected();

    // Zero affected rows means the policy filtered the record (or it is
    // gone); either way the caller may not touch it.
    if affected == 0 {
        return Err(Error::Unauthorized);
    }

    if relation.has_retention() {
        let old_values = old_values.unwrap_or_default();
        let changes: Vec<(Uuid, serde_json::Value, serde_json::Value)> = scalar
            .iter()
            .enumerate()
            .map(|(position, (attribute, _, value))| {
                (
                    attribute.id,
                    old_values
                        .get(position)
                        .cloned()
                        .unwrap_or(serde_json::Value::Null),
                    value.clone(),
                )
            })
            .filter(|(_, old, new)| old != new)
            .collect();
        if !changes.is_empty() {
            datalog::record(conn, relation, record_id, login_id, &changes).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bp_domain::schema::AttributeContentUse;

    fn attribute(content: AttributeContent) -> Attribute {
        Attribute {
            id: Uuid::new_v4(),
            relation_id: Uuid::new_v4(),
            relationship_id: None,
            icon_id: None,
            name: "a".into(),
            content,
            content_use: AttributeContentUse::Default,
            length: 0,
            nullable: true,
            encrypted: false,
            def: String::new(),
            on_update: None,
            on_delete: None,
        }
    }

    #[test]
    fn binds_follow_attribute_content() {
        let a = attribute(AttributeContent::Bigint);
        assert_eq!(
            bind_for_attribute(&a, &serde_json::json!(7)).unwrap(),
            BindValue::Int(7)
        );
        assert!(bind_for_attribute(&a, &serde_json::json!("seven")).is_err());

        let a = attribute(AttributeContent::Text);
        assert_eq!(
            bind_for_attribute(&a, &serde_json::json!("x")).unwrap(),
            BindValue::Text("x".into())
        );

        let a = attribute(AttributeContent::Boolean);
        assert_eq!(
            bind_for_attribute(&a, &serde_json::json!(true)).unwrap(),
            BindValue::Bool(true)
        );

        let a = attribute(AttributeContent::Uuid);
        let id = Uuid::new_v4();
        assert_eq!(
            bind_for_attribute(&a, &serde_json::json!(id.to_string())).unwrap(),
            BindValue::Uuid(id)
        );

        let a = attribute(AttributeContent::RelN1);
        assert_eq!(
            bind_for_attribute(&a, &serde_json::json!(12)).unwrap(),
            BindValue::Int(12)
        );
    }

    #[test]
    fn null_binds_regardless_of_content() {
        let a = attribute(AttributeContent::Bigint);
        assert_eq!(
            bind_for_attribute(&a, &serde_json::Value::Null).unwrap(),
            BindValue::Null
        );
    }
}
