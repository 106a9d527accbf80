//! Bearer token issue and verification (HS256), plus fixed token generation.
//!
//! The signing secret lives in `instance.config` key `tokenSecret` and is
//! generated on first start; rotating it invalidates every issued token.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::distributions::Alphanumeric;
use rand::Rng;

use bp_domain::error::{Error, Result};
use bp_domain::login::TokenClaims;
use bp_store::{ConfigCache, Db};

/// Issue a bearer token for a login. `expiry_hours == 0` falls back to 24h.
pub fn create(
    secret: &str,
    login_id: i64,
    admin: bool,
    no_auth: bool,
    expiry_hours: u64,
) -> Result<String> {
    let hours = if expiry_hours == 0 { 24 } else { expiry_hours };
    let claims = TokenClaims {
        login_id,
        admin,
        no_auth,
        exp: Utc::now().timestamp() + (hours as i64) * 3600,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|err| Error::Internal(format!("token signing failed: {err}")))
}

/// Verify a bearer token; expiry is enforced by validation.
pub fn verify(secret: &str, token: &str) -> Result<TokenClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| Error::Auth("token invalid or expired".into()))
}

/// 48 random alphanumeric characters, the storage format of
/// `instance.login_token_fixed.token`.
pub fn generate_fixed() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

/// Make sure a signing secret exists; generated once per instance.
pub async fn ensure_secret(db: &Db, config: &ConfigCache) -> Result<()> {
    if !config.get_string("tokenSecret").is_empty() {
        return Ok(());
    }
    let secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect();
    config.set(db, "tokenSecret", &secret).await?;
    tracing::info!("token secret generated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_claims() {
        let token = create("s3cret", 42, true, false, 1).unwrap();
        let claims = verify("s3cret", &token).unwrap();
        assert_eq!(claims.login_id, 42);
        assert!(claims.admin);
        assert!(!claims.no_auth);
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn wrong_secret_fails() {
        let token = create("s3cret", 42, false, false, 1).unwrap();
        assert!(verify("other", &token).is_err());
    }

    #[test]
    fn expired_token_fails() {
        let claims = TokenClaims {
            login_id: 42,
            admin: false,
            no_auth: false,
            exp: Utc::now().timestamp() - 3600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"s3cret"),
        )
        .unwrap();
        assert!(verify("s3cret", &token).is_err());
    }

    #[test]
    fn fixed_tokens_fit_their_column() {
        let token = generate_fixed();
        assert_eq!(token.len(), 48);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, generate_fixed());
    }
}
