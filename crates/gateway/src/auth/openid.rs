//! Open ID Connect authentication against configured providers.
//!
//! Two flows: Authorization Code with PKCE (the client completed the
//! redirect dance and submits code + verifier) and Client Credentials.
//! Claims from the ID token map onto a login, created on first sight, with
//! role assignments resolved through `instance.login_role_assign`.

use base64::Engine;
use serde::Deserialize;
use sqlx::Row;
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Error, Result};

use crate::state::AppState;

/// A row of `instance.oauth_client`.
#[derive(Debug, Clone)]
pub struct OauthClient {
    pub id: i32,
    pub name: String,
    pub flow: String,
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub redirect_url: String,
    pub scopes: Vec<String>,
    pub claim_username: Option<String>,
    pub claim_roles: Option<String>,
}

pub async fn client_by_id(state: &AppState, id: i32) -> Result<OauthClient> {
    let row = sqlx::query(
        "SELECT id, name, flow, client_id, client_secret, token_url, redirect_url,
                scopes, claim_username, claim_roles
         FROM instance.oauth_client WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(state.db.pool())
    .await
    .map_err(classify_db_error)?
    .ok_or_else(|| Error::Auth(format!("unknown oauth client {id}")))?;

    Ok(OauthClient {
        id: row.try_get("id").map_err(classify_db_error)?,
        name: row.try_get("name").map_err(classify_db_error)?,
        flow: row.try_get("flow").map_err(classify_db_error)?,
        client_id: row.try_get("client_id").map_err(classify_db_error)?,
        client_secret: row.try_get("client_secret").map_err(classify_db_error)?,
        token_url: row.try_get("token_url").map_err(classify_db_error)?,
        redirect_url: row.try_get("redirect_url").map_err(classify_db_error)?,
        scopes: row.try_get("scopes").map_err(classify_db_error)?,
        claim_username: row.try_get("claim_username").map_err(classify_db_error)?,
        claim_roles: row.try_get("claim_roles").map_err(classify_db_error)?,
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    id_token: String,
}

/// Exchange an authorization code (PKCE) for tokens at the provider.
pub async fn exchange_code(
    client: &OauthClient,
    code: &str,
    code_verifier: &str,
) -> Result<serde_json::Value> {
    let http = reqwest::Client::new();
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("code_verifier", code_verifier),
        ("client_id", &client.client_id),
        ("client_secret", &client.client_secret),
        ("redirect_uri", &client.redirect_url),
    ];

    let response = http
        .post(&client.token_url)
        .form(&params)
        .send()
        .await
        .map_err(|err| Error::Auth(format!("token endpoint unreachable: {err}")))?;

    if !response.status().is_success() {
        return Err(Error::Auth(format!(
            "token endpoint rejected code exchange: {}",
            response.status()
        )));
    }

    let tokens: TokenResponse = response
        .json()
        .await
        .map_err(|err| Error::Auth(format!("bad token response: {err}")))?;

    let raw = if tokens.id_token.is_empty() {
        tokens.access_token
    } else {
        tokens.id_token
    };
    decode_claims(&raw)
}

/// Client-Credentials flow: authenticate the client itself.
pub async fn client_credentials(client: &OauthClient) -> Result<serde_json::Value> {
    let scope = client.scopes.join(" ");
    let http = reqwest::Client::new();
    let params = [
        ("grant_type", "client_credentials"),
        ("client_id", &client.client_id),
        ("client_secret", &client.client_secret),
        ("scope", &scope),
    ];

    let response = http
        .post(&client.token_url)
        .form(&params)
        .send()
        .await
        .map_err(|err| Error::Auth(format!("token endpoint unreachable: {err}")))?;

    if !response.status().is_success() {
        return Err(Error::Auth(format!(
            "token endpoint rejected client credentials: {}",
            response.status()
        )));
    }

    let tokens: TokenResponse = response
        .json()
        .await
        .map_err(|err| Error::Auth(format!("bad token response: {err}")))?;
    decode_claims(&tokens.access_token)
}

/// Extract the claim set from a JWT obtained directly from the provider's
/// token endpoint over TLS.
pub fn decode_claims(jwt: &str) -> Result<serde_json::Value> {
    let mut parts = jwt.split('.');
    let (_, payload) = (
        parts.next().ok_or_else(|| Error::Auth("malformed token".into()))?,
        parts.next().ok_or_else(|| Error::Auth("malformed token".into()))?,
    );
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| Error::Auth("malformed token payload".into()))?;
    serde_json::from_slice(&bytes).map_err(|_| Error::Auth("malformed token claims".into()))
}

/// Read a claim as string; arrays are not valid here.
pub fn claim_string(claims: &serde_json::Value, name: &str) -> Option<String> {
    claims.get(name).and_then(|v| v.as_str()).map(str::to_string)
}

/// Read a claim as a list of strings; a scalar claim becomes a one-element
/// list.
pub fn claim_strings(claims: &serde_json::Value, name: &str) -> Vec<String> {
    match claims.get(name) {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Resolve or create the login for a verified claim set, then sync its role
/// assignments from `login_role_assign`. Returns the login id.
pub async fn resolve_login(
    state: &AppState,
    client: &OauthClient,
    claims: &serde_json::Value,
) -> Result<i64> {
    let issuer = claim_string(claims, "iss").unwrap_or_default();
    let subject = claim_string(claims, "sub")
        .ok_or_else(|| Error::Auth("token misses sub claim".into()))?;

    let username_claim = client.claim_username.as_deref().unwrap_or("preferred_username");
    let username = claim_string(claims, username_claim)
        .or_else(|| claim_string(claims, "email"))
        .unwrap_or_else(|| format!("{}@{}", subject, client.name));

    let existing: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM instance.login
         WHERE oauth_client_id = $1 AND oauth_sub = $2 AND active",
    )
    .bind(client.id)
    .bind(&subject)
    .fetch_optional(state.db.pool())
    .await
    .map_err(classify_db_error)?;

    let login_id = match existing {
        Some(id) => id,
        None => {
            let salt_kdf = crate::auth::password::generate_salt();
            sqlx::query_scalar(
                "INSERT INTO instance.login
                    (name, salt_kdf, admin, no_auth, active, oauth_client_id, oauth_iss, oauth_sub)
                 VALUES ($1, $2, FALSE, FALSE, TRUE, $3, $4, $5)
                 RETURNING id",
            )
            .bind(&username)
            .bind(&salt_kdf)
            .bind(client.id)
            .bind(&issuer)
            .bind(&subject)
            .fetch_one(state.db.pool())
            .await
            .map_err(classify_db_error)?
        }
    };

    sync_roles(state, client, claims, login_id).await?;
    Ok(login_id)
}

/// Replace the login's role set with the assignments whose search strings
/// appear in the role claim. Runs on every OIDC authentication so revoked
/// provider roles propagate.
async fn sync_roles(
    state: &AppState,
    client: &OauthClient,
    claims: &serde_json::Value,
    login_id: i64,
) -> Result<()> {
    let Some(roles_claim) = client.claim_roles.as_deref() else {
        return Ok(());
    };
    let provider_roles = claim_strings(claims, roles_claim);

    let assigns = sqlx::query(
        "SELECT search_string, role_id FROM instance.login_role_assign
         WHERE oauth_client_id = $1",
    )
    .bind(client.id)
    .fetch_all(state.db.pool())
    .await
    .map_err(classify_db_error)?;

    let mut role_ids: Vec<Uuid> = Vec::new();
    for row in &assigns {
        let search: String = row.try_get("search_string").map_err(classify_db_error)?;
        let role_id: Uuid = row.try_get("role_id").map_err(classify_db_error)?;
        if provider_roles.iter().any(|r| r == &search) {
            role_ids.push(role_id);
        }
    }

    let mut tx = state.db.begin().await?;
    sqlx::query("DELETE FROM instance.login_role WHERE login_id = $1")
        .bind(login_id)
        .execute(&mut *tx)
        .await
        .map_err(classify_db_error)?;
    for role_id in role_ids {
        sqlx::query("INSERT INTO instance.login_role (login_id, role_id) VALUES ($1, $2)")
            .bind(login_id)
            .bind(role_id)
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;
    }
    tx.commit().await.map_err(classify_db_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jwt(claims: serde_json::Value) -> String {
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"alg\":\"RS256\"}");
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&claims).unwrap());
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn decode_claims_reads_payload() {
        let jwt = fake_jwt(serde_json::json!({
            "iss": "https://idp.example",
            "sub": "user-1",
            "preferred_username": "ada",
        }));
        let claims = decode_claims(&jwt).unwrap();
        assert_eq!(claim_string(&claims, "sub").unwrap(), "user-1");
        assert_eq!(claim_string(&claims, "preferred_username").unwrap(), "ada");
    }

    #[test]
    fn decode_claims_rejects_garbage() {
        assert!(decode_claims("no-dots-here").is_err());
        assert!(decode_claims("a.%%%.c").is_err());
    }

    #[test]
    fn claim_strings_handles_scalar_and_array() {
        let claims = serde_json::json!({
            "roles": ["admin", "staff"],
            "group": "one",
        });
        assert_eq!(claim_strings(&claims, "roles"), vec!["admin", "staff"]);
        assert_eq!(claim_strings(&claims, "group"), vec!["one"]);
        assert!(claim_strings(&claims, "missing").is_empty());
    }
}
