//! In-process migration engine.
//!
//! On startup the engine compares the persisted schema version
//! (`instance.config` key `dbVersionCut`, `major.minor`) with the binary's
//! [`bp_domain::VERSION_CUT`] and applies the registered upgrade steps, one
//! transaction per step, until they match. The step table is append-only and
//! strictly linear; a failed step rolls back and leaves the stored version on
//! the step's input version, so an administrator may simply retry.

mod ddl;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::{PgConnection, Postgres, Row, Transaction};
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Error, Result};
use bp_domain::VERSION_CUT;

use crate::config_cache::CONFIG_DEFAULTS;
use crate::db::Db;

/// Budget for one migration step, matching the system-task timeout.
const STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Context handed to every step; some versions include filesystem fixups.
pub struct MigrateCtx {
    pub files_root: PathBuf,
}

pub struct Migration {
    pub from: &'static str,
    pub to: &'static str,
}

/// Registered steps, append-only across releases, ordered oldest first.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        from: "1.0",
        to: "1.1",
    },
    Migration {
        from: "1.1",
        to: "1.2",
    },
    Migration {
        from: "1.2",
        to: "1.3",
    },
    Migration {
        from: "1.3",
        to: "1.4",
    },
];

/// Dispatch to the upgrade step whose source version is `from`.
///
/// Dispatched by direct match rather than a stored function-pointer table:
/// `sqlx::raw_sql(..).execute(conn)` inside an `async fn` reached through a
/// higher-ranked (`for<'a> fn(...)`) pointer hits a known rustc/sqlx trait
/// solver limitation ("implementation of `Executor` is not general enough").
/// A plain match keeps every call site's lifetime concrete and avoids it.
async fn run_step(conn: &mut PgConnection, ctx: &MigrateCtx, from: &str) -> Result<()> {
    match from {
        "1.0" => up_1_0(conn, ctx).await,
        "1.1" => up_1_1(conn, ctx).await,
        "1.2" => up_1_2(conn, ctx).await,
        "1.3" => up_1_3(conn, ctx).await,
        other => Err(Error::PlatformVersionUnknown(other.to_string())),
    }
}

/// Quote an SQL identifier for dynamically assembled DDL/DML. Double quotes
/// inside the name are stripped; schema entity names are validated by the
/// Builder but the storage layer never trusts them.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', ""))
}

/// Bring the database to the binary's version.
///
/// A database without an `instance.config` table is treated as empty and
/// initialized from the embedded baseline DDL at the current version. A
/// database that has the table but an empty `dbVersionCut` is in an undefined
/// state and startup halts with a clear message.
pub async fn run(db: &Db, ctx: &MigrateCtx) -> Result<()> {
    if !instance_exists(db).await? {
        initialize(db).await?;
        return Ok(());
    }

    let mut stored = read_version(db).await?;
    if stored.is_empty() {
        return Err(Error::Config(
            "database has platform tables but no schema version; \
             restore a backup or start with an empty database"
                .into(),
        ));
    }

    while stored != VERSION_CUT {
        let step = MIGRATIONS
            .iter()
            .find(|m| m.from == stored)
            .ok_or_else(|| Error::PlatformVersionUnknown(stored.clone()))?;

        tracing::info!(from = step.from, to = step.to, "applying migration");

        let res = tokio::time::timeout(STEP_TIMEOUT, apply_step(db, step, ctx)).await;
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(from = step.from, to = step.to, %err, "migration failed");
                return Err(err);
            }
            Err(_) => {
                tracing::error!(from = step.from, to = step.to, "migration timed out");
                return Err(Error::ContextDeadlineExceeded);
            }
        }

        stored = step.to.to_string();
        tracing::info!(version = %stored, "migration step committed");
    }
    Ok(())
}

async fn apply_step(db: &Db, step: &Migration, ctx: &MigrateCtx) -> Result<()> {
    let mut tx = db.begin().await?;
    run_step(&mut tx, ctx, step.from).await?;
    set_version(&mut tx, step.to).await?;
    tx.commit().await.map_err(classify_db_error)?;
    Ok(())
}

async fn instance_exists(db: &Db) -> Result<bool> {
    let reg: Option<String> =
        sqlx::query_scalar("SELECT to_regclass('instance.config')::TEXT")
            .fetch_one(db.pool())
            .await
            .map_err(classify_db_error)?;
    Ok(reg.is_some())
}

async fn read_version(db: &Db) -> Result<String> {
    let value: Option<String> =
        sqlx::query_scalar("SELECT value FROM instance.config WHERE name = 'dbVersionCut'")
            .fetch_optional(db.pool())
            .await
            .map_err(classify_db_error)?;
    Ok(value.unwrap_or_default())
}

async fn set_version(tx: &mut Transaction<'static, Postgres>, version: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO instance.config (name, value) VALUES ('dbVersionCut', $1)
         ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value",
    )
    .bind(version)
    .execute(&mut **tx)
    .await
    .map_err(classify_db_error)?;
    Ok(())
}

/// First start against an empty database: create everything at the current
/// version and seed config defaults plus the system task table.
async fn initialize(db: &Db) -> Result<()> {
    tracing::info!(version = VERSION_CUT, "empty database, applying baseline");

    let mut tx = db.begin().await?;

    sqlx::raw_sql(ddl::BASELINE_TABLES)
        .execute(&mut *tx)
        .await
        .map_err(classify_db_error)?;
    sqlx::raw_sql(ddl::BASELINE_FUNCTIONS)
        .execute(&mut *tx)
        .await
        .map_err(classify_db_error)?;
    sqlx::raw_sql(ddl::BASELINE_TASKS)
        .execute(&mut *tx)
        .await
        .map_err(classify_db_error)?;

    for (name, value) in CONFIG_DEFAULTS {
        sqlx::query("INSERT INTO instance.config (name, value) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;
    }

    sqlx::query("UPDATE instance.config SET value = $1 WHERE name = 'instanceId'")
        .bind(Uuid::new_v4().to_string())
        .execute(&mut *tx)
        .await
        .map_err(classify_db_error)?;

    set_version(&mut tx, VERSION_CUT).await?;
    tx.commit().await.map_err(classify_db_error)?;

    tracing::info!("baseline applied");
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 1.0 → 1.1: fixed login tokens (ICS, fat client, TOTP) and the mail
/// traffic audit table.
async fn up_1_0(tx: &mut PgConnection, _ctx: &MigrateCtx) -> Result<()> {
    sqlx::raw_sql(
        r#"
        CREATE TYPE instance.login_token_fixed_context AS ENUM ('ics', 'client', 'totp');
        CREATE TABLE instance.login_token_fixed (
            id BIGSERIAL PRIMARY KEY,
            login_id BIGINT NOT NULL REFERENCES instance.login (id) ON DELETE CASCADE,
            name VARCHAR(64),
            context instance.login_token_fixed_context NOT NULL,
            token CHAR(48) NOT NULL,
            date_create BIGINT NOT NULL,
            UNIQUE (login_id, token)
        );
        CREATE TABLE instance.mail_traffic (
            from_list TEXT NOT NULL DEFAULT '',
            to_list TEXT NOT NULL DEFAULT '',
            cc_list TEXT NOT NULL DEFAULT '',
            bcc_list TEXT NOT NULL DEFAULT '',
            subject TEXT NOT NULL,
            date BIGINT NOT NULL,
            outgoing BOOLEAN NOT NULL,
            files TEXT[] NOT NULL DEFAULT '{}',
            mail_account_id INTEGER
        );
        CREATE INDEX idx_mail_traffic_date ON instance.mail_traffic (date);
        INSERT INTO instance.config (name, value) VALUES
            ('mailTrafficKeepDays', '90'), ('tokenKeepEnable', '1')
        ON CONFLICT (name) DO NOTHING;
        "#,
    )
    .execute(tx)
    .await
    .map_err(classify_db_error)?;
    Ok(())
}

/// 1.1 → 1.2: REST call spool with attempt counting.
async fn up_1_1(tx: &mut PgConnection, _ctx: &MigrateCtx) -> Result<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE instance.rest_spool (
            id BIGSERIAL PRIMARY KEY,
            method VARCHAR(12) NOT NULL,
            url TEXT NOT NULL,
            headers JSONB,
            body TEXT,
            skip_verify BOOLEAN NOT NULL DEFAULT FALSE,
            callback_pg_function_id UUID,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            date_added BIGINT NOT NULL
        );
        CREATE FUNCTION instance.rest_call(
            http_method TEXT,
            url TEXT,
            body TEXT DEFAULT NULL,
            headers JSONB DEFAULT NULL,
            callback_function_id UUID DEFAULT NULL,
            skip_verify BOOLEAN DEFAULT FALSE)
        RETURNS VOID AS $$
        BEGIN
            INSERT INTO instance.rest_spool (method, url, headers, body, skip_verify, callback_pg_function_id, date_added)
            VALUES (UPPER(http_method), url, headers, body, skip_verify, callback_function_id,
                EXTRACT(EPOCH FROM NOW())::BIGINT);
        END;
        $$ LANGUAGE plpgsql;
        INSERT INTO instance.config (name, value) VALUES
            ('dbTimeoutDataRest', '60'), ('restSpoolRetryMax', '10')
        ON CONFLICT (name) DO NOTHING;
        INSERT INTO instance.task (name, interval_seconds, cluster_master_only, embedded_only, active_only, active)
        VALUES ('restCall', 15, TRUE, FALSE, FALSE, TRUE);
        INSERT INTO instance.schedule (task_name, date_attempt, date_success)
        VALUES ('restCall', 0, 0);
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(classify_db_error)?;
    Ok(())
}

/// 1.2 → 1.3: versioned file storage. Adds `instance.file_version`, converts
/// the single-version metadata and moves blobs from the flat layout
/// `<files>/<fileId>` into `<files>/<first-3>/<fileId>_<version>`. The blob
/// move is idempotent so a retried step never corrupts data.
async fn up_1_2(tx: &mut PgConnection, ctx: &MigrateCtx) -> Result<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE instance.file_version (
            file_id UUID NOT NULL REFERENCES instance.file (id) ON DELETE CASCADE,
            version INTEGER NOT NULL,
            hash CHAR(64),
            size_kb INTEGER NOT NULL DEFAULT 0,
            login_id BIGINT,
            date_change BIGINT NOT NULL,
            PRIMARY KEY (file_id, version)
        );
        INSERT INTO instance.file_version (file_id, version, hash, size_kb, date_change)
        SELECT id, 0, hash, size_kb, date_change FROM instance.file;
        ALTER TABLE instance.file DROP COLUMN hash;
        ALTER TABLE instance.file DROP COLUMN size_kb;
        ALTER TABLE instance.file DROP COLUMN date_change;
        INSERT INTO instance.config (name, value) VALUES
            ('fileVersionsKeepCount', '30'), ('fileVersionsKeepDays', '90')
        ON CONFLICT (name) DO NOTHING;
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(classify_db_error)?;

    move_flat_file_blobs(&ctx.files_root)?;
    Ok(())
}

/// Move pre-1.3 flat blobs into the bucketed, versioned layout. Already-moved
/// blobs and foreign directory entries are skipped.
fn move_flat_file_blobs(files_root: &std::path::Path) -> Result<()> {
    if !files_root.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(files_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if Uuid::parse_str(name).is_err() {
            continue;
        }

        let dir = files_root.join(&name[..3]);
        std::fs::create_dir_all(&dir)?;
        let target = dir.join(format!("{name}_0"));
        if target.exists() {
            // Retried step, blob already migrated; drop the stale source.
            std::fs::remove_file(entry.path())?;
            continue;
        }
        std::fs::rename(entry.path(), &target)?;
        tracing::info!(file = name, "moved file blob to versioned layout");
    }
    Ok(())
}

/// 1.3 → 1.4: synthesize a surrogate `id` primary key for every existing
/// relation. The step refuses to run when any relation already owns an
/// attribute named `id`; replaying it over such a schema would shadow user
/// data, so the conflict is surfaced instead of guessed around.
async fn up_1_3(tx: &mut PgConnection, _ctx: &MigrateCtx) -> Result<()> {
    let conflict: Option<String> = sqlx::query_scalar(
        "SELECT r.name FROM app.relation r
         JOIN app.attribute a ON a.relation_id = r.id AND a.name = 'id'
         LIMIT 1",
    )
    .fetch_optional(&mut *tx)
    .await
    .map_err(classify_db_error)?;

    if let Some(relation) = conflict {
        return Err(Error::Config(format!(
            "relation '{relation}' already has an attribute named 'id'; \
             rename it before upgrading to 1.4"
        )));
    }

    let relations = sqlx::query(
        "SELECT r.id, r.name, m.name AS module_name
         FROM app.relation r
         JOIN app.module m ON m.id = r.module_id",
    )
    .fetch_all(&mut *tx)
    .await
    .map_err(classify_db_error)?;

    for row in relations {
        let relation_id: Uuid = row.try_get("id").map_err(classify_db_error)?;
        let relation_name: String = row.try_get("name").map_err(classify_db_error)?;
        let module_name: String = row.try_get("module_name").map_err(classify_db_error)?;

        sqlx::query(
            "INSERT INTO app.attribute
                (id, relation_id, name, content, content_use, length, nullable, def)
             VALUES ($1, $2, 'id', 'bigint', 'default', 0, FALSE, '')",
        )
        .bind(Uuid::new_v4())
        .bind(relation_id)
        .execute(&mut *tx)
        .await
        .map_err(classify_db_error)?;

        let alter = format!(
            "ALTER TABLE {}.{} ADD COLUMN \"id\" BIGSERIAL PRIMARY KEY",
            quote_ident(&module_name),
            quote_ident(&relation_name),
        );
        sqlx::query(&alter)
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_is_linear_and_ends_at_binary_version() {
        // Each step's target is the next step's source; the last target is
        // the binary's version cut (P4 precondition).
        for pair in MIGRATIONS.windows(2) {
            assert_eq!(pair[0].to, pair[1].from, "chain must be gapless");
        }
        assert_eq!(MIGRATIONS.last().unwrap().to, VERSION_CUT);
    }

    #[test]
    fn every_source_version_is_unique() {
        let mut froms: Vec<&str> = MIGRATIONS.iter().map(|m| m.from).collect();
        froms.sort_unstable();
        froms.dedup();
        assert_eq!(froms.len(), MIGRATIONS.len());
    }

    #[test]
    fn quote_ident_strips_embedded_quotes() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("or\"ders"), "\"orders\"");
    }

    #[test]
    fn blob_move_skips_foreign_entries() {
        let dir = std::env::temp_dir().join(format!("bp-migrate-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        // One real blob (uuid name), one foreign file, one directory.
        let file_id = Uuid::new_v4().to_string();
        std::fs::write(dir.join(&file_id), b"blob").unwrap();
        std::fs::write(dir.join("readme.txt"), b"not a blob").unwrap();
        std::fs::create_dir(dir.join("abc")).unwrap();

        move_flat_file_blobs(&dir).unwrap();

        let target = dir.join(&file_id[..3]).join(format!("{file_id}_0"));
        assert!(target.is_file(), "blob must land in bucketed layout");
        assert!(dir.join("readme.txt").is_file(), "foreign files untouched");
        assert!(!dir.join(&file_id).exists());

        // Idempotence: a second run over the same tree is a no-op.
        move_flat_file_blobs(&dir).unwrap();
        assert!(target.is_file());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
