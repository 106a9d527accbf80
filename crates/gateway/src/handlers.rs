//! Request routing: each `(ressource, action)` pair maps to one handler.
//! Handlers receive the batch transaction's connection and run inside the
//! dispatcher's storage transaction; they return the response payload or a
//! typed error for the dispatcher to convert.

use std::collections::HashSet;

use serde::Deserialize;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Error, Result, SchemaEntity};
use bp_domain::login::DeviceKind;
use bp_protocol::{ClusterEvent, Request};

use crate::cluster::{self, EventTarget};
use crate::data;
use crate::state::AppState;

/// Connection facts a handler may depend on.
#[derive(Debug, Clone)]
pub struct ReqCtx {
    pub conn_id: Uuid,
    pub address: String,
    pub device: DeviceKind,
    pub login_id: i64,
    pub admin: bool,
}

pub async fn run_request(
    state: &AppState,
    conn: &mut PgConnection,
    ctx: &ReqCtx,
    roles: &HashSet<Uuid>,
    request: &Request,
) -> Result<serde_json::Value> {
    match (request.ressource.as_str(), request.action.as_str()) {
        ("data", "get") => {
            let get: data::DataGet = serde_json::from_value(request.payload.clone())?;
            let result =
                data::get::run(&state.schema, conn, roles, ctx.login_id, &get).await?;
            Ok(serde_json::to_value(result)?)
        }
        ("data", "set") => {
            let commands: Vec<data::DataSetCommand> =
                serde_json::from_value(request.payload.clone())?;
            let result =
                data::set::run(&state.schema, conn, roles, ctx.login_id, commands).await?;
            Ok(serde_json::to_value(result)?)
        }
        ("data", "del") => {
            let delete: data::DataDelete = serde_json::from_value(request.payload.clone())?;
            data::delete::run(&state.schema, conn, roles, &delete).await?;
            Ok(serde_json::json!({}))
        }
        ("data", "getLog") => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Payload {
                relation_id: Uuid,
                record_id: i64,
            }
            let payload: Payload = serde_json::from_value(request.payload.clone())?;
            data::access::require_relation_read(&state.schema, roles, &payload.relation_id)?;
            let entries =
                data::datalog::get_for_record(state, payload.relation_id, payload.record_id)
                    .await?;
            Ok(serde_json::to_value(entries)?)
        }
        ("pgFunction", "exec") => exec_pg_function(state, conn, ctx, request).await,
        ("task", "run") => run_task(conn, ctx, request).await,
        ("schema", "reload") => schema_reload(state, ctx, request).await,
        ("login", "getNames") => login_get_names(conn, request).await,
        ("login", "setTokenFixed") => login_set_token_fixed(state, conn, ctx, request).await,
        ("login", "delTokenFixed") => login_del_token_fixed(conn, ctx, request).await,
        ("clientEvents", "get") => client_events_get(state, roles),
        ("lookup", "get") => lookup_get(state, ctx, roles, request),
        ("file", "request") => file_request(state, ctx, request).await,
        ("file", "paste") => file_paste(state, ctx, request).await,
        (ressource, action) => {
            tracing::warn!(ressource, action, "unknown request route");
            Err(Error::Internal(format!(
                "unknown request {ressource}/{action}"
            )))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Functions & tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn exec_pg_function(
    state: &AppState,
    conn: &mut PgConnection,
    ctx: &ReqCtx,
    request: &Request,
) -> Result<serde_json::Value> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Payload {
        id: Uuid,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    }
    let payload: Payload = serde_json::from_value(request.payload.clone())?;

    let function = state
        .schema
        .pg_function(&payload.id)
        .ok_or(Error::SchemaUnknown(SchemaEntity::PgFunction, payload.id))?;
    // Only functions marked for frontend execution are callable by
    // non-admin clients.
    if !function.is_frontend_exec && !ctx.admin {
        return Err(Error::Unauthorized);
    }
    let module = state
        .schema
        .module(&function.module_id)
        .ok_or(Error::SchemaUnknown(SchemaEntity::Module, function.module_id))?;

    let placeholders: Vec<String> = (1..=payload.args.len()).map(|n| format!("${n}")).collect();
    let sql = format!(
        "SELECT {}.{}({})::TEXT",
        bp_store::migrate::quote_ident(&module.name),
        bp_store::migrate::quote_ident(&function.name),
        placeholders.join(", ")
    );

    let binds: Vec<data::query::BindValue> = payload
        .args
        .iter()
        .map(data::query::BindValue::from_json)
        .collect();
    let row = data::query::apply_binds(sqlx::query(&sql), &binds)
        .fetch_one(conn)
        .await
        .map_err(classify_db_error)?;
    let result: Option<String> = row.try_get(0).map_err(classify_db_error)?;
    Ok(serde_json::json!(result))
}

async fn run_task(
    conn: &mut PgConnection,
    ctx: &ReqCtx,
    request: &Request,
) -> Result<serde_json::Value> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Payload {
        #[serde(default)]
        task_name: String,
        #[serde(default)]
        pg_function_id: Option<Uuid>,
        #[serde(default)]
        pg_function_schedule_id: Option<Uuid>,
    }
    if !ctx.admin {
        return Err(Error::Unauthorized);
    }
    let payload: Payload = serde_json::from_value(request.payload.clone())?;

    sqlx::query("SELECT instance_cluster.run_task($1, $2, $3)")
        .bind(&payload.task_name)
        .bind(payload.pg_function_id)
        .bind(payload.pg_function_schedule_id)
        .execute(conn)
        .await
        .map_err(classify_db_error)?;
    Ok(serde_json::json!({}))
}

async fn schema_reload(
    state: &AppState,
    ctx: &ReqCtx,
    request: &Request,
) -> Result<serde_json::Value> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Payload {
        #[serde(default)]
        module_id: Option<Uuid>,
    }
    if !ctx.admin {
        return Err(Error::Unauthorized);
    }
    let payload: Payload = serde_json::from_value(request.payload.clone())?;

    let module_ids = match payload.module_id {
        Some(id) => vec![id],
        None => Vec::new(),
    };
    cluster::publish(
        &state.db,
        &ClusterEvent::SchemaChanged { module_ids },
        EventTarget::AllNodes,
        &Default::default(),
    )
    .await?;
    Ok(serde_json::json!({}))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Login sub-resources
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn login_get_names(
    conn: &mut PgConnection,
    request: &Request,
) -> Result<serde_json::Value> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Payload {
        #[serde(default)]
        by_id: i64,
        #[serde(default)]
        by_string: String,
    }
    let payload: Payload = serde_json::from_value(request.payload.clone())?;

    let rows = if payload.by_id != 0 {
        sqlx::query("SELECT id, name FROM instance.login WHERE active AND id = $1")
            .bind(payload.by_id)
            .fetch_all(conn)
            .await
            .map_err(classify_db_error)?
    } else {
        sqlx::query(
            "SELECT id, name FROM instance.login
             WHERE active AND name ILIKE $1 ORDER BY name LIMIT 10",
        )
        .bind(format!("%{}%", payload.by_string))
        .fetch_all(conn)
        .await
        .map_err(classify_db_error)?
    };

    let names: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            Ok(serde_json::json!({
                "id": row.try_get::<i64, _>("id").map_err(classify_db_error)?,
                "name": row.try_get::<String, _>("name").map_err(classify_db_error)?,
            }))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(serde_json::Value::Array(names))
}

async fn login_set_token_fixed(
    state: &AppState,
    conn: &mut PgConnection,
    ctx: &ReqCtx,
    request: &Request,
) -> Result<serde_json::Value> {
    use bp_domain::login::TokenFixedContext;

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Payload {
        #[serde(default)]
        name: String,
        context: String,
    }
    let payload: Payload = serde_json::from_value(request.payload.clone())?;
    let context = TokenFixedContext::parse(&payload.context)
        .ok_or_else(|| Error::Internal(format!("unknown token context '{}'", payload.context)))?;

    if !state.runtime.get_bool("tokenKeepEnable") {
        return Err(Error::Unauthorized);
    }

    let token = match context {
        TokenFixedContext::Totp => crate::auth::totp::generate_secret(),
        _ => crate::auth::token::generate_fixed(),
    };

    sqlx::query(
        "INSERT INTO instance.login_token_fixed (login_id, name, context, token, date_create)
         VALUES ($1, $2, $3::instance.login_token_fixed_context, $4, $5)",
    )
    .bind(ctx.login_id)
    .bind(&payload.name)
    .bind(context.as_str())
    .bind(&token)
    .bind(chrono::Utc::now().timestamp())
    .execute(conn)
    .await
    .map_err(classify_db_error)?;

    Ok(serde_json::json!({ "tokenFixed": token }))
}

async fn login_del_token_fixed(
    conn: &mut PgConnection,
    ctx: &ReqCtx,
    request: &Request,
) -> Result<serde_json::Value> {
    #[derive(Deserialize)]
    struct Payload {
        id: i64,
    }
    let payload: Payload = serde_json::from_value(request.payload.clone())?;

    // Own tokens only; the login id is part of the predicate.
    sqlx::query("DELETE FROM instance.login_token_fixed WHERE id = $1 AND login_id = $2")
        .bind(payload.id)
        .bind(ctx.login_id)
        .execute(conn)
        .await
        .map_err(classify_db_error)?;
    Ok(serde_json::json!({}))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lookups & file events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The client events this login may register, across all loaded modules.
fn client_events_get(
    state: &AppState,
    roles: &HashSet<Uuid>,
) -> Result<serde_json::Value> {
    let mut events = Vec::new();
    for module_id in state.schema.module_ids() {
        let Some(module) = state.schema.module(&module_id) else {
            continue;
        };
        for event in &module.client_events {
            if data::access::require_client_event_access(&state.schema, roles, &event.id).is_ok()
            {
                events.push(serde_json::to_value(event)?);
            }
        }
    }
    Ok(serde_json::Value::Array(events))
}

fn lookup_get(
    state: &AppState,
    ctx: &ReqCtx,
    roles: &HashSet<Uuid>,
    request: &Request,
) -> Result<serde_json::Value> {
    #[derive(Deserialize)]
    struct Payload {
        name: String,
    }
    let payload: Payload = serde_json::from_value(request.payload.clone())?;

    match payload.name.as_str() {
        // The client's effective access map, used to render what the login
        // may touch.
        "access" => {
            let mut relations = serde_json::Map::new();
            let mut attributes = serde_json::Map::new();
            for role_id in roles {
                let Some(role) = state.schema.role(role_id) else {
                    continue;
                };
                for (id, access) in &role.access_relations {
                    let entry = relations.entry(id.to_string()).or_insert(serde_json::json!(0));
                    if entry.as_i64().unwrap_or(0) < *access as i64 {
                        *entry = serde_json::json!(access);
                    }
                }
                for (id, access) in &role.access_attributes {
                    let entry = attributes.entry(id.to_string()).or_insert(serde_json::json!(0));
                    if entry.as_i64().unwrap_or(0) < *access as i64 {
                        *entry = serde_json::json!(access);
                    }
                }
            }
            Ok(serde_json::json!({
                "relation": relations,
                "attribute": attributes,
            }))
        }
        "loginId" => Ok(serde_json::json!(ctx.login_id)),
        other => Err(Error::Internal(format!("unknown lookup '{other}'"))),
    }
}

async fn file_request(
    state: &AppState,
    ctx: &ReqCtx,
    request: &Request,
) -> Result<serde_json::Value> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Payload {
        attribute_id: Uuid,
        file_id: Uuid,
        record_id: i64,
        #[serde(default)]
        choose_app: bool,
    }
    let payload: Payload = serde_json::from_value(request.payload.clone())?;

    // Fat clients of this login handle the request wherever they are
    // connected in the cluster.
    cluster::publish(
        &state.db,
        &ClusterEvent::FileRequested {
            login_id: ctx.login_id,
            attribute_id: payload.attribute_id,
            file_id: payload.file_id,
            record_id: payload.record_id,
            choose_app: payload.choose_app,
        },
        EventTarget::AllNodes,
        &bp_protocol::AddressFilter {
            device: Some(DeviceKind::FatClient),
            login_id: Some(ctx.login_id),
            ..Default::default()
        },
    )
    .await?;
    Ok(serde_json::json!({}))
}

async fn file_paste(
    state: &AppState,
    ctx: &ReqCtx,
    request: &Request,
) -> Result<serde_json::Value> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Payload {
        attribute_id: Uuid,
        file_ids: Vec<Uuid>,
        record_id: i64,
    }
    let payload: Payload = serde_json::from_value(request.payload.clone())?;

    cluster::publish(
        &state.db,
        &ClusterEvent::FilesCopied {
            login_id: ctx.login_id,
            attribute_id: payload.attribute_id,
            file_ids: payload.file_ids,
            record_id: payload.record_id,
        },
        EventTarget::AllNodes,
        &bp_protocol::AddressFilter::login(ctx.login_id),
    )
    .await?;
    Ok(serde_json::json!({}))
}
