//! Transaction dispatcher.
//!
//! Multiplexes per-connection requests under the process-wide handler bound,
//! authenticates, routes batches, and converts every error to its stable
//! wire code. Non-auth batches execute atomically inside one storage
//! transaction; a statement-cache signature mismatch triggers exactly one
//! retry with a cleared cache.

use std::time::Duration;

use uuid::Uuid;

use bp_domain::error::{classify_db_error, Error, Result};
use bp_domain::login::DeviceKind;
use bp_protocol::{Request, RequestTransaction, Response, ResponseTransaction};
use bp_store::LogContext;

use crate::auth;
use crate::handlers::{self, ReqCtx};
use crate::state::AppState;

/// Opaque auth failure answer; internals never reach the client.
const AUTH_ERROR: &str = "AUTH_ERROR";

/// Connection facts the reader loop hands to every dispatch.
#[derive(Debug, Clone)]
pub struct ConnSnapshot {
    pub conn_id: Uuid,
    pub address: String,
    pub device: DeviceKind,
    pub pwa_module_id: Option<Uuid>,
}

/// Handle one inbound text frame and produce the reply frame.
pub async fn handle_message(state: &AppState, conn: &ConnSnapshot, raw: &str) -> String {
    // Malformed messages get an empty object; the connection stays open.
    let tx: RequestTransaction = match serde_json::from_str(raw) {
        Ok(tx) => tx,
        Err(err) => {
            tracing::warn!(conn_id = %conn.conn_id, %err, "malformed request envelope");
            state
                .log
                .warning(LogContext::Websocket, &format!("malformed envelope: {err}"))
                .await;
            return "{}".to_string();
        }
    };
    let transaction_nr = tx.transaction_nr;

    // One slot of the process-wide handler pool; a hard cap, waiters queue.
    let _permit = state
        .dispatch_permits
        .acquire()
        .await
        .expect("dispatch semaphore never closes");

    let budget = Duration::from_secs(match state.runtime.get_u64("dbTimeoutDataWs") {
        0 => 300,
        n => n,
    });

    let response = if tx.is_auth() {
        handle_auth(state, conn, &tx).await
    } else {
        match tokio::time::timeout(budget, handle_batch(state, conn, &tx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ContextDeadlineExceeded),
        }
    };

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            convert_error(state, conn, transaction_nr, tx.is_auth(), err).await
        }
    };

    serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string())
}

/// Render the error for the wire; unclassified errors are logged and become
/// the generic code, auth failures strike the host and become the opaque
/// token (license codes excepted so clients may prompt).
async fn convert_error(
    state: &AppState,
    conn: &ConnSnapshot,
    transaction_nr: u64,
    was_auth: bool,
    err: Error,
) -> ResponseTransaction {
    if was_auth {
        state.bruteforce.strike(&conn.address);
        let code = match &err {
            Error::License(code) => code.clone(),
            _ => AUTH_ERROR.to_string(),
        };
        tracing::warn!(conn_id = %conn.conn_id, %err, "authentication failed");
        return ResponseTransaction::error(transaction_nr, code);
    }

    match &err {
        Error::Unauthorized
        | Error::BruteforceBlocked
        | Error::AppPresetProtected
        | Error::License(_)
        | Error::ContextDeadlineExceeded
        | Error::SchemaUnknown(..) => {}
        other => {
            tracing::warn!(conn_id = %conn.conn_id, err = %other, "request failed");
            state
                .log
                .warning(LogContext::Websocket, &format!("request failed: {other}"))
                .await;
        }
    }
    ResponseTransaction::error(transaction_nr, err.client_code())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Authentication transactions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_auth(
    state: &AppState,
    conn: &ConnSnapshot,
    tx: &RequestTransaction,
) -> Result<ResponseTransaction> {
    if state.bruteforce.check(&conn.address) {
        return Err(Error::BruteforceBlocked);
    }

    let request = &tx.requests[0];
    let result = match request.action.as_str() {
        "user" => {
            let payload: auth::AuthUserPayload = serde_json::from_value(request.payload.clone())
                .map_err(|err| Error::Auth(format!("bad auth payload: {err}")))?;
            auth::by_user(state, payload).await?
        }
        "token" => {
            let payload: auth::AuthTokenPayload = serde_json::from_value(request.payload.clone())
                .map_err(|err| Error::Auth(format!("bad auth payload: {err}")))?;
            auth::by_token(state, payload).await?
        }
        "tokenFixed" => {
            let payload: auth::AuthTokenFixedPayload =
                serde_json::from_value(request.payload.clone())
                    .map_err(|err| Error::Auth(format!("bad auth payload: {err}")))?;
            auth::by_token_fixed(state, conn.device, payload).await?
        }
        "openId" => {
            let payload: auth::AuthOpenIdPayload = serde_json::from_value(request.payload.clone())
                .map_err(|err| Error::Auth(format!("bad auth payload: {err}")))?;
            auth::by_open_id(state, payload).await?
        }
        other => return Err(Error::Auth(format!("unknown auth action '{other}'"))),
    };

    // MFA-incomplete results do not establish a session.
    if result.id != 0 {
        state
            .hub
            .set_auth(&conn.conn_id, result.id, result.admin, result.no_auth);
        auth::session::register(state, conn.conn_id, conn.device, result.id, &conn.address)
            .await?;
        tracing::info!(
            conn_id = %conn.conn_id,
            login_id = result.id,
            admin = result.admin,
            "authenticated"
        );
    }

    Ok(ResponseTransaction {
        transaction_nr: tx.transaction_nr,
        responses: vec![Response {
            payload: serde_json::to_value(&result)?,
        }],
        error: None,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Batch transactions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_batch(
    state: &AppState,
    conn: &ConnSnapshot,
    tx: &RequestTransaction,
) -> Result<ResponseTransaction> {
    let login_id = state.hub.login_id(&conn.conn_id).unwrap_or(0);
    if login_id == 0 {
        return Err(Error::Unauthorized);
    }

    match run_batch(state, conn, login_id, &tx.requests).await {
        Ok(responses) => Ok(ResponseTransaction {
            transaction_nr: tx.transaction_nr,
            responses,
            error: None,
        }),
        // A schema swap can leave stale statement signatures behind; retry
        // the whole batch once on a cleaned connection.
        Err(err) if err.is_cache_stale() => {
            tracing::warn!(conn_id = %conn.conn_id, "stale statement cache, retrying batch");
            state.db.clear_statement_cache().await?;
            let responses = run_batch(state, conn, login_id, &tx.requests).await?;
            Ok(ResponseTransaction {
                transaction_nr: tx.transaction_nr,
                responses,
                error: None,
            })
        }
        Err(err) => Err(err),
    }
}

/// All requests of the batch succeed inside one storage transaction, or the
/// batch rolls back and no partial mutation is observable.
async fn run_batch(
    state: &AppState,
    conn: &ConnSnapshot,
    login_id: i64,
    requests: &[Request],
) -> Result<Vec<Response>> {
    // Admin flag travels with the connection after auth.
    let admin = state.hub.is_admin(&conn.conn_id).unwrap_or(false);

    let mut db_tx = state.db.begin().await?;
    set_login_context(&mut db_tx, login_id).await?;

    let assigned = crate::data::access::assigned_role_ids(&mut db_tx, login_id).await?;
    let roles = crate::data::access::effective_role_ids(&state.schema, &assigned);

    let ctx = ReqCtx {
        conn_id: conn.conn_id,
        address: conn.address.clone(),
        device: conn.device,
        login_id,
        admin,
    };

    let mut responses = Vec::with_capacity(requests.len());
    for request in requests {
        let payload = handlers::run_request(state, &mut db_tx, &ctx, &roles, request).await?;
        responses.push(Response { payload });
    }

    db_tx.commit().await.map_err(classify_db_error)?;
    Ok(responses)
}

/// Expose the acting login to SQL (`instance.get_login_id()`), scoped to the
/// transaction.
async fn set_login_context(
    tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
    login_id: i64,
) -> Result<()> {
    sqlx::query("SELECT SET_CONFIG('baseplate.login_id', $1, TRUE)")
        .bind(login_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(classify_db_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DISPATCH_PERMITS;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    #[tokio::test]
    async fn handler_pool_is_a_hard_cap() {
        // The user-code section never exceeds the permit count, regardless
        // of offered load.
        let permits = Arc::new(Semaphore::new(DISPATCH_PERMITS));
        let in_section = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let permits = permits.clone();
            let in_section = in_section.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permits.acquire().await.unwrap();
                let current = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= DISPATCH_PERMITS);
        assert!(peak.load(Ordering::SeqCst) > 1, "pool actually parallel");
    }

    #[test]
    fn auth_error_token_is_opaque() {
        assert_eq!(AUTH_ERROR, "AUTH_ERROR");
    }
}
