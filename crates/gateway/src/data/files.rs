//! File attribute lifecycle.
//!
//! Assignment rows live in `instance_file."<attributeId>_record"`; file
//! bytes in `<files>/<first-3-of-id>/<id>_<version>` with thumbnails beside
//! them as `<id>.webp`. Deletion is logical (`date_delete`); the retention
//! worker removes old versions, expired deleted links and unreferenced
//! files. A database trigger maintains `instance.file.ref_counter` as links
//! come and go.
//!
//! Names are unique per record among non-deleted files: a colliding name is
//! coerced to `base_(n).ext` with n increasing monotonically over every name
//! ever present on the record.

use std::path::{Path, PathBuf};

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Error, Result};
use bp_domain::schema::Attribute;
use bp_store::migrate::quote_ident;
use bp_store::LogContext;

use crate::state::AppState;

/// One entry of a file attribute value.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAssign {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub delete: bool,
}

/// Blob path for one file version.
pub fn file_path(files_root: &Path, file_id: &Uuid, version: i64) -> PathBuf {
    let id = file_id.to_string();
    files_root.join(&id[..3]).join(format!("{id}_{version}"))
}

/// Thumbnail path for a file.
pub fn thumb_path(files_root: &Path, file_id: &Uuid) -> PathBuf {
    let id = file_id.to_string();
    files_root.join(&id[..3]).join(format!("{id}.webp"))
}

fn record_table(attribute_id: &Uuid) -> String {
    format!("instance_file.{}", quote_ident(&format!("{attribute_id}_record")))
}

/// Split a file name into (stem, extension-with-dot).
fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(position) if position > 0 => name.split_at(position),
        _ => (name, ""),
    }
}

/// Coerce `want` to uniqueness among the record's files.
///
/// `active_others` are the names currently held by other non-deleted files;
/// `all_names` is every name present on the record, deleted and own included,
/// which keeps the `_(n)` counter monotone.
pub fn assign_unique_name(active_others: &[String], all_names: &[String], want: &str) -> String {
    if !active_others.iter().any(|n| n == want) {
        return want.to_string();
    }

    let (stem, ext) = split_name(want);
    let pattern = Regex::new(&format!(
        "^{}_\\((\\d+)\\){}$",
        regex::escape(stem),
        regex::escape(ext)
    ))
    .expect("escaped pattern is valid");

    let max_n = all_names
        .iter()
        .filter_map(|name| {
            pattern
                .captures(name)
                .and_then(|captures| captures[1].parse::<u64>().ok())
        })
        .max()
        .unwrap_or(0);

    format!("{stem}_({}){ext}", max_n + 1)
}

/// Apply one file attribute value to a record: link new files, rename
/// existing ones, logically delete removed ones. Blob bytes are written by
/// the upload surface before the value ever reaches the data layer.
pub async fn apply_attribute_changes(
    conn: &mut PgConnection,
    attribute: &Attribute,
    record_id: i64,
    value: &serde_json::Value,
) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    let assigns: Vec<FileAssign> = serde_json::from_value(value.clone())
        .map_err(|err| Error::Internal(format!("bad file attribute value: {err}")))?;

    let table = record_table(&attribute.id);

    for assign in &assigns {
        if assign.delete {
            let sql = format!(
                "UPDATE {table} SET date_delete = $1 WHERE file_id = $2 AND record_id = $3"
            );
            sqlx::query(&sql)
                .bind(Utc::now().timestamp())
                .bind(assign.id)
                .bind(record_id)
                .execute(&mut *conn)
                .await
                .map_err(classify_db_error)?;
            continue;
        }

        // Name state of the record, re-read per assignment so a batch of
        // identical names coerces in sequence.
        let sql = format!("SELECT file_id, name, date_delete FROM {table} WHERE record_id = $1");
        let rows = sqlx::query(&sql)
            .bind(record_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(classify_db_error)?;

        let mut active_others = Vec::new();
        let mut all_names = Vec::new();
        let mut current_name: Option<String> = None;
        for row in &rows {
            let file_id: Uuid = row.try_get("file_id").map_err(classify_db_error)?;
            let name: String = row.try_get("name").map_err(classify_db_error)?;
            let deleted: Option<i64> = row.try_get("date_delete").map_err(classify_db_error)?;
            all_names.push(name.clone());
            if file_id == assign.id {
                current_name = Some(name);
            } else if deleted.is_none() {
                active_others.push(name);
            }
        }

        match current_name {
            Some(current) if current == assign.name => {
                // Unchanged; make sure a previous logical delete is undone.
                let sql = format!(
                    "UPDATE {table} SET date_delete = NULL WHERE file_id = $1 AND record_id = $2"
                );
                sqlx::query(&sql)
                    .bind(assign.id)
                    .bind(record_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(classify_db_error)?;
            }
            Some(_) => {
                let unique = assign_unique_name(&active_others, &all_names, &assign.name);
                let sql = format!(
                    "UPDATE {table} SET name = $1, date_delete = NULL
                     WHERE file_id = $2 AND record_id = $3"
                );
                sqlx::query(&sql)
                    .bind(&unique)
                    .bind(assign.id)
                    .bind(record_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(classify_db_error)?;
            }
            None => {
                // New link. The file row may already exist (copied file).
                sqlx::query(
                    "INSERT INTO instance.file (id, ref_counter) VALUES ($1, 0)
                     ON CONFLICT (id) DO NOTHING",
                )
                .bind(assign.id)
                .execute(&mut *conn)
                .await
                .map_err(classify_db_error)?;

                let unique = assign_unique_name(&active_others, &all_names, &assign.name);
                let sql = format!(
                    "INSERT INTO {table} (file_id, record_id, name, date_delete)
                     VALUES ($1, $2, $3, NULL)"
                );
                sqlx::query(&sql)
                    .bind(assign.id)
                    .bind(record_id)
                    .bind(&unique)
                    .execute(&mut *conn)
                    .await
                    .map_err(classify_db_error)?;
            }
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retention (cleanupFiles task)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Enforce version retention, expire logically deleted links and drop
/// unreferenced files with their blobs.
pub async fn cleanup(state: &AppState) -> Result<()> {
    let now = Utc::now().timestamp();
    let files_root = &state.cfg.paths.files;

    // 1. Old versions: beyond the keep-count AND older than keep-days.
    let keep_count = state.runtime.get_i64("fileVersionsKeepCount").max(1);
    let keep_days = state.runtime.get_i64("fileVersionsKeepDays").max(1);
    let version_cutoff = now - keep_days * 86_400;

    let stale_versions = sqlx::query(
        "SELECT file_id, version FROM (
            SELECT file_id, version, date_change,
                   ROW_NUMBER() OVER (PARTITION BY file_id ORDER BY version DESC) AS rank
            FROM instance.file_version
         ) ranked
         WHERE rank > $1 AND date_change < $2",
    )
    .bind(keep_count)
    .bind(version_cutoff)
    .fetch_all(state.db.pool())
    .await
    .map_err(classify_db_error)?;

    for row in &stale_versions {
        let file_id: Uuid = row.try_get("file_id").map_err(classify_db_error)?;
        let version: i32 = row.try_get("version").map_err(classify_db_error)?;

        remove_blob(state, &file_path(files_root, &file_id, version as i64)).await;
        sqlx::query("DELETE FROM instance.file_version WHERE file_id = $1 AND version = $2")
            .bind(file_id)
            .bind(version)
            .execute(state.db.pool())
            .await
            .map_err(classify_db_error)?;
    }

    // 2. Expired logical deletes across every file attribute's record table.
    let delete_cutoff = now - state.runtime.get_i64("filesKeepDaysDeleted").max(1) * 86_400;
    for attribute_id in state.schema.attribute_ids_files() {
        let sql = format!(
            "DELETE FROM {} WHERE date_delete IS NOT NULL AND date_delete < $1",
            record_table(&attribute_id)
        );
        let res = sqlx::query(&sql)
            .bind(delete_cutoff)
            .execute(state.db.pool())
            .await
            .map_err(classify_db_error)?;
        if res.rows_affected() > 0 {
            tracing::info!(
                attribute_id = %attribute_id,
                removed = res.rows_affected(),
                "expired deleted file links removed"
            );
        }
    }

    // 3. Unreferenced files: delete remaining versions, blobs, thumbnail and
    // the file row. The ref counter is trigger-maintained.
    let orphans = sqlx::query("SELECT id FROM instance.file WHERE ref_counter <= 0")
        .fetch_all(state.db.pool())
        .await
        .map_err(classify_db_error)?;

    for row in &orphans {
        let file_id: Uuid = row.try_get("id").map_err(classify_db_error)?;
        let versions: Vec<i32> =
            sqlx::query_scalar("SELECT version FROM instance.file_version WHERE file_id = $1")
                .bind(file_id)
                .fetch_all(state.db.pool())
                .await
                .map_err(classify_db_error)?;
        for version in versions {
            remove_blob(state, &file_path(files_root, &file_id, version as i64)).await;
        }
        remove_blob(state, &thumb_path(files_root, &file_id)).await;

        sqlx::query("DELETE FROM instance.file WHERE id = $1")
            .bind(file_id)
            .execute(state.db.pool())
            .await
            .map_err(classify_db_error)?;
    }

    if !stale_versions.is_empty() || !orphans.is_empty() {
        state
            .log
            .info(
                LogContext::File,
                &format!(
                    "file cleanup: {} versions, {} orphaned files",
                    stale_versions.len(),
                    orphans.len()
                ),
            )
            .await;
    }
    Ok(())
}

async fn remove_blob(state: &AppState, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            state
                .log
                .warning(
                    LogContext::File,
                    &format!("could not remove blob {}: {err}", path.display()),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn blob_paths_follow_bucket_layout() {
        let id = Uuid::parse_str("a1b2c3d4-0000-0000-0000-000000000000").unwrap();
        let path = file_path(Path::new("/srv/files"), &id, 3);
        assert_eq!(
            path,
            PathBuf::from("/srv/files/a1b/a1b2c3d4-0000-0000-0000-000000000000_3")
        );
        let thumb = thumb_path(Path::new("/srv/files"), &id);
        assert_eq!(
            thumb,
            PathBuf::from("/srv/files/a1b/a1b2c3d4-0000-0000-0000-000000000000.webp")
        );
    }

    #[test]
    fn first_name_is_kept() {
        assert_eq!(assign_unique_name(&[], &[], "x.txt"), "x.txt");
    }

    #[test]
    fn collisions_append_counter() {
        // Second and third upload of the same name.
        assert_eq!(
            assign_unique_name(&strings(&["x.txt"]), &strings(&["x.txt"]), "x.txt"),
            "x_(1).txt"
        );
        assert_eq!(
            assign_unique_name(
                &strings(&["x.txt", "x_(1).txt"]),
                &strings(&["x.txt", "x_(1).txt"]),
                "x.txt"
            ),
            "x_(2).txt"
        );
    }

    #[test]
    fn rename_counter_is_monotone() {
        // Three files x.txt, x_(1).txt, x_(2).txt; the third is renamed to
        // x.txt. Its own current name keeps the counter moving forward.
        let active_others = strings(&["x.txt", "x_(1).txt"]);
        let all = strings(&["x.txt", "x_(1).txt", "x_(2).txt"]);
        assert_eq!(assign_unique_name(&active_others, &all, "x.txt"), "x_(3).txt");
    }

    #[test]
    fn deleted_names_do_not_block_but_do_count() {
        // A deleted file released its name, so the exact name is reusable.
        let active_others = strings(&[]);
        let all = strings(&["x.txt"]);
        assert_eq!(assign_unique_name(&active_others, &all, "x.txt"), "x.txt");

        // But once a collision exists, deleted names still push the counter.
        let active_others = strings(&["x.txt"]);
        let all = strings(&["x.txt", "x_(4).txt"]);
        assert_eq!(assign_unique_name(&active_others, &all, "x.txt"), "x_(5).txt");
    }

    #[test]
    fn extension_less_names_and_dotfiles() {
        assert_eq!(
            assign_unique_name(&strings(&["notes"]), &strings(&["notes"]), "notes"),
            "notes_(1)"
        );
        // A leading dot is not an extension separator.
        assert_eq!(
            assign_unique_name(&strings(&[".env"]), &strings(&[".env"]), ".env"),
            ".env_(1)"
        );
    }

    #[test]
    fn regex_metacharacters_in_names_are_literal() {
        let want = "report (final).txt";
        assert_eq!(
            assign_unique_name(&strings(&[want]), &strings(&[want]), want),
            "report (final)_(1).txt"
        );
    }
}
