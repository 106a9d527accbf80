//! REST spool drain.
//!
//! `instance.rest_spool` rows are produced by the `instance.rest_call` SQL
//! function. Each row is one outbound HTTP call; the optional callback PG
//! function receives the response status and body. Failures advance
//! `attempt_count`; rows past the configurable `restSpoolRetryMax` cap are
//! logged and dropped instead of retrying forever.

use std::time::Duration;

use chrono::Utc;
use reqwest::Method;
use sqlx::Row;
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Error, Result};
use bp_store::migrate::quote_ident;
use bp_store::LogContext;

use crate::state::AppState;

const BATCH_SIZE: i64 = 100;

/// The `restCall` task body.
pub async fn drain(state: &AppState) -> Result<()> {
    let retry_max = match state.runtime.get_i64("restSpoolRetryMax") {
        0 => 10,
        n => n,
    };

    // Rows past the retry cap are dead; surface them once and drop them.
    let expired = sqlx::query(
        "DELETE FROM instance.rest_spool WHERE attempt_count >= $1 RETURNING id, url",
    )
    .bind(retry_max)
    .fetch_all(state.db.pool())
    .await
    .map_err(classify_db_error)?;
    for row in &expired {
        let id: i64 = row.try_get("id").map_err(classify_db_error)?;
        let url: String = row.try_get("url").map_err(classify_db_error)?;
        state
            .log
            .error(
                LogContext::Api,
                &format!("rest call {id} to {url} dropped after {retry_max} attempts"),
            )
            .await;
    }

    let rows = sqlx::query(
        "SELECT id, method, url, headers, body, skip_verify, callback_pg_function_id
         FROM instance.rest_spool ORDER BY id LIMIT $1",
    )
    .bind(BATCH_SIZE)
    .fetch_all(state.db.pool())
    .await
    .map_err(classify_db_error)?;

    for row in rows {
        let call_id: i64 = row.try_get("id").map_err(classify_db_error)?;
        match call_one(state, &row).await {
            Ok(()) => {
                sqlx::query("DELETE FROM instance.rest_spool WHERE id = $1")
                    .bind(call_id)
                    .execute(state.db.pool())
                    .await
                    .map_err(classify_db_error)?;
            }
            Err(err) => {
                tracing::warn!(call_id, %err, "rest call failed");
                state
                    .log
                    .warning(LogContext::Api, &format!("rest call {call_id} failed: {err}"))
                    .await;
                sqlx::query(
                    "UPDATE instance.rest_spool SET attempt_count = attempt_count + 1 WHERE id = $1",
                )
                .bind(call_id)
                .execute(state.db.pool())
                .await
                .map_err(classify_db_error)?;
            }
        }
    }
    Ok(())
}

async fn call_one(state: &AppState, row: &sqlx::postgres::PgRow) -> Result<()> {
    let method_raw: String = row.try_get("method").map_err(classify_db_error)?;
    let url: String = row.try_get("url").map_err(classify_db_error)?;
    let headers: Option<serde_json::Value> = row.try_get("headers").map_err(classify_db_error)?;
    let body: Option<String> = row.try_get("body").map_err(classify_db_error)?;
    let skip_verify: bool = row.try_get("skip_verify").map_err(classify_db_error)?;
    let callback: Option<Uuid> = row
        .try_get("callback_pg_function_id")
        .map_err(classify_db_error)?;

    let method = Method::from_bytes(method_raw.as_bytes())
        .map_err(|_| Error::Internal(format!("bad HTTP method '{method_raw}'")))?;

    let timeout = Duration::from_secs(state.runtime.get_u64("dbTimeoutDataRest").max(10));
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(skip_verify)
        .timeout(timeout)
        .build()
        .map_err(|err| Error::Internal(format!("http client: {err}")))?;

    let mut request = client.request(method, &url);
    if let Some(serde_json::Value::Object(headers)) = headers {
        for (name, value) in headers {
            if let Some(value) = value.as_str() {
                request = request.header(&name, value);
            }
        }
    }
    if let Some(body) = body {
        request = request.body(body);
    }

    let response = request
        .send()
        .await
        .map_err(|err| Error::Internal(format!("request failed: {err}")))?;
    let status = response.status().as_u16() as i32;
    let response_body = response
        .text()
        .await
        .map_err(|err| Error::Internal(format!("response read failed: {err}")))?;

    if let Some(function_id) = callback {
        run_callback(state, &function_id, status, &response_body).await?;
    }
    Ok(())
}

/// Hand the response to the caller's PG function: `fn(status, body)`.
async fn run_callback(
    state: &AppState,
    function_id: &Uuid,
    status: i32,
    body: &str,
) -> Result<()> {
    let function = state
        .schema
        .pg_function(function_id)
        .ok_or(Error::SchemaUnknown(
            bp_domain::error::SchemaEntity::PgFunction,
            *function_id,
        ))?;
    let module = state
        .schema
        .module(&function.module_id)
        .ok_or(Error::SchemaUnknown(
            bp_domain::error::SchemaEntity::Module,
            function.module_id,
        ))?;

    let sql = format!(
        "SELECT {}.{}($1, $2)",
        quote_ident(&module.name),
        quote_ident(&function.name)
    );
    sqlx::query(&sql)
        .bind(status)
        .bind(body)
        .execute(state.db.pool())
        .await
        .map_err(classify_db_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn http_methods_parse() {
        for method in ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"] {
            assert!(reqwest::Method::from_bytes(method.as_bytes()).is_ok());
        }
    }
}
