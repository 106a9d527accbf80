//! Login, token and session types shared between the auth layer, the
//! dispatcher and the cluster event consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client device kind carried on every connection and session-log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    Browser,
    FatClient,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Browser => "browser",
            DeviceKind::FatClient => "fatClient",
        }
    }
}

/// Purpose tag of a long-lived fixed token. A fixed token authenticates only
/// against the surface its context names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenFixedContext {
    /// Calendar feed access.
    Ics,
    /// Fat-client channel access.
    Client,
    /// TOTP secret for the second factor; never authenticates a transport.
    Totp,
}

impl TokenFixedContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenFixedContext::Ics => "ics",
            TokenFixedContext::Client => "client",
            TokenFixedContext::Totp => "totp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ics" => Some(TokenFixedContext::Ics),
            "client" => Some(TokenFixedContext::Client),
            "totp" => Some(TokenFixedContext::Totp),
            _ => None,
        }
    }
}

/// Claims carried in the bearer token issued on successful authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Login id.
    pub login_id: i64,
    /// Admin flag at issue time.
    pub admin: bool,
    /// Login may not authenticate regular data access (public user).
    pub no_auth: bool,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Result of a successful (or MFA-pending) authentication.
///
/// MFA-incomplete is signalled by `id == 0` together with a non-empty
/// `mfa_tokens` list; the client then re-submits with a TOTP code.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    pub admin: bool,
    pub id: i64,
    pub name: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt_kdf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mfa_tokens: Option<Vec<MfaToken>>,
    pub no_auth: bool,
}

/// A pending second factor offered to the client after primary success.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MfaToken {
    pub id: i64,
    pub name: String,
}

/// A row in `instance.login_session`, one per established connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLogEntry {
    pub id: Uuid,
    pub device: DeviceKind,
    pub login_id: i64,
    pub node_id: Uuid,
    pub date: DateTime<Utc>,
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_token_context_round_trip() {
        for ctx in [
            TokenFixedContext::Ics,
            TokenFixedContext::Client,
            TokenFixedContext::Totp,
        ] {
            assert_eq!(TokenFixedContext::parse(ctx.as_str()), Some(ctx));
        }
        assert_eq!(TokenFixedContext::parse("backup"), None);
    }

    #[test]
    fn mfa_incomplete_signal() {
        let res = AuthResult {
            id: 0,
            mfa_tokens: Some(vec![MfaToken {
                id: 7,
                name: "authenticator".into(),
            }]),
            ..Default::default()
        };
        // id == 0 plus offered tokens is the MFA-incomplete contract.
        assert_eq!(res.id, 0);
        assert!(!res.mfa_tokens.as_ref().unwrap().is_empty());
    }
}
