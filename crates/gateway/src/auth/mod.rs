//! Authentication: the four credential validators and their shared login
//! lookup. On success the dispatcher imprints the result onto the connection
//! and registers a session-log entry; on failure it emits a brute-force
//! strike and answers with an opaque error token.

pub mod openid;
pub mod password;
pub mod session;
pub mod token;
pub mod totp;

use chrono::Utc;
use serde::Deserialize;
use sqlx::Row;

use bp_domain::error::{classify_db_error, Error, Result};
use bp_domain::login::{AuthResult, DeviceKind, MfaToken, TokenFixedContext};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUserPayload {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub mfa_token_id: Option<i64>,
    #[serde(default)]
    pub mfa_token_pin: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuthTokenPayload {
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokenFixedPayload {
    pub login_id: i64,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOpenIdPayload {
    pub oauth_client_id: i32,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub code_verifier: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Login lookup
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct LoginRow {
    pub id: i64,
    pub name: String,
    pub salt: Option<String>,
    pub hash: Option<String>,
    pub salt_kdf: String,
    pub admin: bool,
    pub no_auth: bool,
    pub language_code: String,
}

fn login_from_row(row: &sqlx::postgres::PgRow) -> Result<LoginRow> {
    let language: String = row.try_get("language_code").map_err(classify_db_error)?;
    let salt_kdf: String = row.try_get("salt_kdf").map_err(classify_db_error)?;
    Ok(LoginRow {
        id: row.try_get("id").map_err(classify_db_error)?,
        name: row.try_get("name").map_err(classify_db_error)?,
        salt: row.try_get("salt").map_err(classify_db_error)?,
        hash: row.try_get("hash").map_err(classify_db_error)?,
        salt_kdf: salt_kdf.trim_end().to_string(),
        admin: row.try_get("admin").map_err(classify_db_error)?,
        no_auth: row.try_get("no_auth").map_err(classify_db_error)?,
        language_code: language.trim_end().to_string(),
    })
}

const LOGIN_COLUMNS: &str =
    "id, name, salt, hash, salt_kdf, admin, no_auth, language_code";

async fn login_by_name(state: &AppState, name: &str) -> Result<Option<LoginRow>> {
    let sql = format!("SELECT {LOGIN_COLUMNS} FROM instance.login WHERE name = $1 AND active");
    let row = sqlx::query(&sql)
        .bind(name)
        .fetch_optional(state.db.pool())
        .await
        .map_err(classify_db_error)?;
    row.as_ref().map(login_from_row).transpose()
}

async fn login_by_id(state: &AppState, id: i64) -> Result<Option<LoginRow>> {
    let sql = format!("SELECT {LOGIN_COLUMNS} FROM instance.login WHERE id = $1 AND active");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(state.db.pool())
        .await
        .map_err(classify_db_error)?;
    row.as_ref().map(login_from_row).transpose()
}

fn result_for(state: &AppState, login: &LoginRow) -> Result<AuthResult> {
    let secret = state.runtime.get_string("tokenSecret");
    let bearer = token::create(
        &secret,
        login.id,
        login.admin,
        login.no_auth,
        state.runtime.get_u64("tokenExpiryHours"),
    )?;
    Ok(AuthResult {
        admin: login.admin,
        id: login.id,
        name: login.name.clone(),
        token: bearer,
        language_code: Some(login.language_code.clone()),
        salt_kdf: Some(login.salt_kdf.clone()),
        mfa_tokens: None,
        no_auth: login.no_auth,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validators
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Username + password, with TOTP as an optional second factor. MFA is only
/// presented after primary success; the incomplete state is signalled by
/// `id == 0` plus the offered token list.
pub async fn by_user(state: &AppState, payload: AuthUserPayload) -> Result<AuthResult> {
    let login = login_by_name(state, &payload.username)
        .await?
        .ok_or_else(|| Error::Auth("unknown or disabled login".into()))?;

    let (Some(salt), Some(hash)) = (&login.salt, &login.hash) else {
        return Err(Error::Auth("login has no local credentials".into()));
    };
    if !password::verify(salt.trim(), hash, &payload.password) {
        return Err(Error::Auth("bad password".into()));
    }

    let mfa_rows = sqlx::query(
        "SELECT id, name, token FROM instance.login_token_fixed
         WHERE login_id = $1 AND context = 'totp'",
    )
    .bind(login.id)
    .fetch_all(state.db.pool())
    .await
    .map_err(classify_db_error)?;

    if !mfa_rows.is_empty() {
        match (payload.mfa_token_id, payload.mfa_token_pin.as_deref()) {
            (Some(token_id), Some(pin)) => {
                let secret = mfa_rows
                    .iter()
                    .find_map(|row| {
                        let id: i64 = row.try_get("id").ok()?;
                        (id == token_id).then(|| row.try_get::<String, _>("token").ok())?
                    })
                    .ok_or_else(|| Error::Auth("unknown MFA token".into()))?;

                if !totp::verify(&secret, pin, Utc::now().timestamp()) {
                    return Err(Error::Auth("bad MFA pin".into()));
                }
            }
            _ => {
                let mut offered = Vec::with_capacity(mfa_rows.len());
                for row in &mfa_rows {
                    offered.push(MfaToken {
                        id: row.try_get("id").map_err(classify_db_error)?,
                        name: row
                            .try_get::<Option<String>, _>("name")
                            .map_err(classify_db_error)?
                            .unwrap_or_default(),
                    });
                }
                return Ok(AuthResult {
                    id: 0,
                    mfa_tokens: Some(offered),
                    salt_kdf: Some(login.salt_kdf.clone()),
                    ..Default::default()
                });
            }
        }
    }

    result_for(state, &login)
}

/// A previously issued bearer token.
pub async fn by_token(state: &AppState, payload: AuthTokenPayload) -> Result<AuthResult> {
    let secret = state.runtime.get_string("tokenSecret");
    let claims = token::verify(&secret, &payload.token)?;

    let login = login_by_id(state, claims.login_id)
        .await?
        .ok_or_else(|| Error::Auth("login gone or disabled".into()))?;

    // Keep the presented token; renewal is the client's choice.
    let mut result = result_for(state, &login)?;
    result.token = payload.token;
    Ok(result)
}

/// A long-lived fixed token. Context binding is strict: `client` tokens
/// authenticate only the fat-client channel, `ics` tokens only the calendar
/// surface, `totp` tokens never authenticate a transport.
pub async fn by_token_fixed(
    state: &AppState,
    device: DeviceKind,
    payload: AuthTokenFixedPayload,
) -> Result<AuthResult> {
    if device != DeviceKind::FatClient {
        return Err(Error::Auth("fixed token login is fat-client only".into()));
    }
    let login =
        validate_fixed(state, payload.login_id, &payload.token, TokenFixedContext::Client)
            .await?;
    result_for(state, &login)
}

/// Validate a fixed token for one specific surface context.
pub async fn validate_fixed(
    state: &AppState,
    login_id: i64,
    fixed_token: &str,
    context: TokenFixedContext,
) -> Result<LoginRow> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT login_id FROM instance.login_token_fixed
         WHERE login_id = $1 AND token = $2 AND context = $3::instance.login_token_fixed_context",
    )
    .bind(login_id)
    .bind(fixed_token)
    .bind(context.as_str())
    .fetch_optional(state.db.pool())
    .await
    .map_err(classify_db_error)?;

    if found.is_none() {
        return Err(Error::Auth("unknown fixed token for context".into()));
    }

    login_by_id(state, login_id)
        .await?
        .ok_or_else(|| Error::Auth("login gone or disabled".into()))
}

/// Open ID Connect: Authorization Code + PKCE or Client Credentials,
/// depending on the configured client flow.
pub async fn by_open_id(state: &AppState, payload: AuthOpenIdPayload) -> Result<AuthResult> {
    let client = openid::client_by_id(state, payload.oauth_client_id).await?;

    let claims = match client.flow.as_str() {
        "clientCreds" => openid::client_credentials(&client).await?,
        _ => {
            let code = payload
                .code
                .as_deref()
                .ok_or_else(|| Error::Auth("authorization code missing".into()))?;
            let verifier = payload
                .code_verifier
                .as_deref()
                .ok_or_else(|| Error::Auth("code verifier missing".into()))?;
            openid::exchange_code(&client, code, verifier).await?
        }
    };

    let login_id = openid::resolve_login(state, &client, &claims).await?;
    let login = login_by_id(state, login_id)
        .await?
        .ok_or_else(|| Error::Auth("login gone or disabled".into()))?;
    result_for(state, &login)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_parse_wire_names() {
        let raw = r#"{"username":"ada","password":"pw","mfaTokenId":3,"mfaTokenPin":"123456"}"#;
        let payload: AuthUserPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.username, "ada");
        assert_eq!(payload.mfa_token_id, Some(3));

        let raw = r#"{"loginId":9,"token":"abc"}"#;
        let payload: AuthTokenFixedPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.login_id, 9);

        let raw = r#"{"oauthClientId":1,"code":"c","codeVerifier":"v"}"#;
        let payload: AuthOpenIdPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.oauth_client_id, 1);
    }
}
