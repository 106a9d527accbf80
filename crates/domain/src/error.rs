//! Shared error type used across all Baseplate crates.
//!
//! Internal errors are typed; only [`Error::client_code`] converts them to the
//! stable wire codes clients are allowed to see. Anything unclassified renders
//! as the generic code and is logged server-side instead.

/// Schema entity kinds referenced by [`Error::SchemaUnknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaEntity {
    Module,
    Relation,
    Attribute,
    Role,
    Api,
    ClientEvent,
    PgFunction,
    Collection,
    Form,
}

impl SchemaEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaEntity::Module => "Module",
            SchemaEntity::Relation => "Relation",
            SchemaEntity::Attribute => "Attribute",
            SchemaEntity::Role => "Role",
            SchemaEntity::Api => "Api",
            SchemaEntity::ClientEvent => "ClientEvent",
            SchemaEntity::PgFunction => "PgFunction",
            SchemaEntity::Collection => "Collection",
            SchemaEntity::Form => "Form",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("access denied")]
    Unauthorized,

    #[error("host blocked by brute-force protection")]
    BruteforceBlocked,

    #[error("unknown {0:?}: {1}")]
    SchemaUnknown(SchemaEntity, uuid::Uuid),

    #[error("row is protected by a schema preset")]
    AppPresetProtected,

    #[error("expected integer, got '{value}'")]
    CsvParseInt { value: String },

    #[error("expected float, got '{value}'")]
    CsvParseFloat { value: String },

    #[error("expected '{expect}' datetime, got '{value}'")]
    CsvParseDateTime { expect: String, value: String },

    #[error("attribute type cannot be imported: {value}")]
    CsvBadAttributeType { value: String },

    #[error("encrypted attribute cannot be imported")]
    CsvEncryptedAttribute,

    /// License-gated feature used without a valid license. The message is a
    /// stable license code, surfaced verbatim so clients may prompt.
    #[error("{0}")]
    License(String),

    /// DB statement cache signature mismatch after a schema swap. Recoverable:
    /// the dispatcher retries the batch once with a cleared cache.
    #[error("database statement cache is stale")]
    DbCacheStale,

    #[error("request deadline exceeded")]
    ContextDeadlineExceeded,

    /// The stored schema version has no registered migration path.
    #[error("no migration registered for database version '{0}', platform update required")]
    PlatformVersionUnknown(String),

    #[error("config: {0}")]
    Config(String),

    #[error("database: {0}")]
    Db(#[from] sqlx::Error),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("auth: {0}")]
    Auth(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The stable, client-safe wire code for this error.
    ///
    /// Codes never carry server paths, SQL fragments or stack traces. License
    /// codes pass through verbatim; everything unclassified becomes the
    /// generic code and the caller is expected to log the original.
    pub fn client_code(&self) -> String {
        match self {
            Error::Unauthorized | Error::Auth(_) => "errorUnauthorized".into(),
            Error::BruteforceBlocked => "errorBruteforceBlock".into(),
            Error::SchemaUnknown(entity, id) => {
                format!("errorSchemaUnknown{}{{id:{}}}", entity.as_str(), id)
            }
            Error::AppPresetProtected => "errorPresetProtected".into(),
            Error::CsvParseInt { value } => {
                format!("errorCsvParseInt{{value:{value}}}")
            }
            Error::CsvParseFloat { value } => {
                format!("errorCsvParseFloat{{value:{value}}}")
            }
            Error::CsvParseDateTime { expect, value } => {
                format!("errorCsvParseDateTime{{expect:{expect}}}{{value:{value}}}")
            }
            Error::CsvBadAttributeType { value } => {
                format!("errorCsvBadAttributeType{{value:{value}}}")
            }
            Error::CsvEncryptedAttribute => "errorCsvEncryptedAttribute".into(),
            Error::License(code) => code.clone(),
            Error::ContextDeadlineExceeded => "errorContextDeadlineExceeded".into(),
            // Recoverable internally; if it still reaches the client after the
            // one-shot retry it is a generic failure.
            Error::DbCacheStale => "errorGeneral".into(),
            _ => "errorGeneral".into(),
        }
    }

    /// Whether this error warrants the dispatcher's one-shot batch retry with
    /// a cleared statement cache.
    pub fn is_cache_stale(&self) -> bool {
        matches!(self, Error::DbCacheStale)
    }
}

/// Classify a raw sqlx error, detecting the recoverable statement-cache
/// signature mismatch Postgres reports after a schema swap.
pub fn classify_db_error(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err
            .message()
            .contains("cached plan must not change result type")
        {
            return Error::DbCacheStale;
        }
    }
    Error::Db(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_codes_are_stable() {
        assert_eq!(Error::Unauthorized.client_code(), "errorUnauthorized");
        assert_eq!(
            Error::BruteforceBlocked.client_code(),
            "errorBruteforceBlock"
        );
        assert_eq!(
            Error::AppPresetProtected.client_code(),
            "errorPresetProtected"
        );
        assert_eq!(
            Error::ContextDeadlineExceeded.client_code(),
            "errorContextDeadlineExceeded"
        );
    }

    #[test]
    fn license_codes_pass_through_verbatim() {
        let err = Error::License("errorLicenseLoginsReached".into());
        assert_eq!(err.client_code(), "errorLicenseLoginsReached");
    }

    #[test]
    fn internals_never_leak() {
        let err = Error::Internal("/var/lib/baseplate/files: permission denied".into());
        assert_eq!(err.client_code(), "errorGeneral");

        let err = Error::Config("bad DSN postgres://user:pw@host".into());
        assert_eq!(err.client_code(), "errorGeneral");
    }

    #[test]
    fn schema_unknown_names_the_entity() {
        let id = uuid::Uuid::nil();
        let err = Error::SchemaUnknown(SchemaEntity::Relation, id);
        assert!(err.client_code().starts_with("errorSchemaUnknownRelation"));
    }

    #[test]
    fn csv_codes_carry_expect_and_value() {
        let err = Error::CsvParseDateTime {
            expect: "Y-m-d".into(),
            value: "yesterday".into(),
        };
        let code = err.client_code();
        assert!(code.contains("{expect:Y-m-d}"));
        assert!(code.contains("{value:yesterday}"));
    }
}
