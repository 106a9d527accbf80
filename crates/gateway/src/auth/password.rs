//! Password hashing and complexity rules.
//!
//! Each login stores a per-login salt and the hex SHA-256 of salt+password.
//! Comparison always runs over fixed-length digests in constant time.

use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use bp_domain::error::{Error, Result};
use bp_store::ConfigCache;

/// Hex-encoded 16 random bytes, the storage format of `instance.login.salt`.
pub fn generate_salt() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Hex SHA-256 over salt+password.
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison via digests; hashing normalises lengths so the
/// comparison always covers 32 bytes.
pub fn verify(salt: &str, stored_hash: &str, password: &str) -> bool {
    let computed = Sha256::digest(hash_password(salt, password).as_bytes());
    let stored = Sha256::digest(stored_hash.trim().as_bytes());
    computed.ct_eq(&stored).into()
}

/// Enforce the configured password rules (`pwLengthMin`, `pwForce*`).
pub fn check_complexity(config: &ConfigCache, password: &str) -> Result<()> {
    let min_length = config.get_u64("pwLengthMin").max(1) as usize;
    if password.chars().count() < min_length {
        return Err(Error::License("errorPwTooShort".into()));
    }
    if config.get_bool("pwForceDigit") && !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(Error::License("errorPwRequiresDigit".into()));
    }
    if config.get_bool("pwForceLower") && !password.chars().any(|c| c.is_lowercase()) {
        return Err(Error::License("errorPwRequiresLower".into()));
    }
    if config.get_bool("pwForceUpper") && !password.chars().any(|c| c.is_uppercase()) {
        return Err(Error::License("errorPwRequiresUpper".into()));
    }
    if config.get_bool("pwForceSpecial") && !password.chars().any(|c| !c.is_alphanumeric()) {
        return Err(Error::License("errorPwRequiresSpecial".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn hash_round_trip() {
        let salt = generate_salt();
        assert_eq!(salt.len(), 32);
        let hash = hash_password(&salt, "correct horse");
        assert_eq!(hash.len(), 64);
        assert!(verify(&salt, &hash, "correct horse"));
        assert!(!verify(&salt, &hash, "wrong horse"));
    }

    #[test]
    fn salts_individualise_hashes() {
        let a = hash_password(&generate_salt(), "same password");
        let b = hash_password(&generate_salt(), "same password");
        assert_ne!(a, b);
    }

    #[test]
    fn verify_tolerates_char_padding() {
        // CHAR(64) columns come back space-padded.
        let salt = generate_salt();
        let hash = format!("{}  ", hash_password(&salt, "pw-with-padding1!"));
        assert!(verify(&salt, &hash, "pw-with-padding1!"));
    }

    #[test]
    fn complexity_rules() {
        let config = Arc::new(ConfigCache::new());
        config.set_local("pwLengthMin", "8");
        config.set_local("pwForceDigit", "1");
        config.set_local("pwForceLower", "1");
        config.set_local("pwForceUpper", "1");
        config.set_local("pwForceSpecial", "1");

        assert!(check_complexity(&config, "Ab1!efgh").is_ok());
        assert!(check_complexity(&config, "Ab1!e").is_err(), "too short");
        assert!(check_complexity(&config, "AB1!EFGH").is_err(), "no lower");
        assert!(check_complexity(&config, "ab1!efgh").is_err(), "no upper");
        assert!(check_complexity(&config, "Abc!efgh").is_err(), "no digit");
        assert!(check_complexity(&config, "Ab1defgh").is_err(), "no special");
    }
}
