//! Mail spool drain.
//!
//! `instance.mail_spool` rows are produced by the `instance.mail_send` SQL
//! function; this worker drains outgoing rows oldest-first through the
//! [`MailTransport`] seam (SMTP itself is an external collaborator). Sent
//! mails leave an audit copy in `instance.mail_traffic` and the spool row is
//! deleted; failures advance the attempt counter and stay queued until the
//! attempt cap.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Error, Result};
use bp_store::LogContext;

use crate::data::files::file_path;
use crate::state::AppState;

const MAIL_ATTEMPTS_MAX: i32 = 5;
const BATCH_SIZE: i64 = 50;

#[derive(Debug, Clone)]
pub struct MailAccount {
    pub id: i32,
    pub name: String,
    pub username: String,
    pub password: String,
    pub start_tls: bool,
    pub send_as: Option<String>,
    pub host_name: String,
    pub host_port: i32,
}

#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to_list: String,
    pub cc_list: String,
    pub bcc_list: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<MailAttachment>,
}

#[derive(Debug, Clone)]
pub struct MailAttachment {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Seam to the actual mail submission; the platform only moves spool rows.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, account: &MailAccount, mail: &OutgoingMail) -> Result<()>;
}

/// Placeholder transport for instances without SMTP wiring; keeps mails
/// spooled so configuring an account later delivers them.
pub struct NoMailTransport;

#[async_trait]
impl MailTransport for NoMailTransport {
    async fn send(&self, _account: &MailAccount, _mail: &OutgoingMail) -> Result<()> {
        Err(Error::Internal("no mail transport configured".into()))
    }
}

async fn smtp_account(conn: &mut PgConnection, account_id: Option<i32>) -> Result<Option<MailAccount>> {
    let row = match account_id {
        Some(id) => sqlx::query(
            "SELECT id, name, username, password, start_tls, send_as, host_name, host_port
             FROM instance.mail_account WHERE id = $1 AND mode = 'smtp'",
        )
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(classify_db_error)?,
        None => sqlx::query(
            "SELECT id, name, username, password, start_tls, send_as, host_name, host_port
             FROM instance.mail_account WHERE mode = 'smtp' ORDER BY id LIMIT 1",
        )
        .fetch_optional(conn)
        .await
        .map_err(classify_db_error)?,
    };

    row.map(|row| {
        Ok(MailAccount {
            id: row.try_get("id").map_err(classify_db_error)?,
            name: row.try_get("name").map_err(classify_db_error)?,
            username: row.try_get("username").map_err(classify_db_error)?,
            password: row.try_get("password").map_err(classify_db_error)?,
            start_tls: row.try_get("start_tls").map_err(classify_db_error)?,
            send_as: row.try_get("send_as").map_err(classify_db_error)?,
            host_name: row.try_get("host_name").map_err(classify_db_error)?,
            host_port: row.try_get("host_port").map_err(classify_db_error)?,
        })
    })
    .transpose()
}

/// The `mailSend` task body.
pub async fn drain(state: &AppState) -> Result<()> {
    let rows = sqlx::query(
        "SELECT id, to_list, cc_list, bcc_list, subject, body, mail_account_id,
                record_id_wofk, attribute_id, attempt_count
         FROM instance.mail_spool
         WHERE outgoing AND attempt_count < $1
         ORDER BY id LIMIT $2",
    )
    .bind(MAIL_ATTEMPTS_MAX)
    .bind(BATCH_SIZE)
    .fetch_all(state.db.pool())
    .await
    .map_err(classify_db_error)?;

    for row in rows {
        let mail_id: i64 = row.try_get("id").map_err(classify_db_error)?;
        if let Err(err) = send_one(state, &row).await {
            tracing::warn!(mail_id, %err, "mail send failed");
            state
                .log
                .warning(LogContext::Mail, &format!("mail {mail_id} failed: {err}"))
                .await;
            sqlx::query(
                "UPDATE instance.mail_spool
                 SET attempt_count = attempt_count + 1, attempt_date = $1 WHERE id = $2",
            )
            .bind(Utc::now().timestamp())
            .bind(mail_id)
            .execute(state.db.pool())
            .await
            .map_err(classify_db_error)?;
        }
    }
    Ok(())
}

async fn send_one(state: &AppState, row: &sqlx::postgres::PgRow) -> Result<()> {
    let mail_id: i64 = row.try_get("id").map_err(classify_db_error)?;
    let account_id: Option<i32> = row.try_get("mail_account_id").map_err(classify_db_error)?;

    let mut conn = state.db.pool().acquire().await.map_err(classify_db_error)?;
    let account = smtp_account(&mut conn, account_id)
        .await?
        .ok_or_else(|| Error::Internal("no SMTP account configured".into()))?;

    let mut attachments = spool_attachments(&mut conn, mail_id).await?;

    // Record-attached files ride along as attachments.
    let record_id: Option<i64> = row.try_get("record_id_wofk").map_err(classify_db_error)?;
    let attribute_id: Option<Uuid> = row.try_get("attribute_id").map_err(classify_db_error)?;
    if let (Some(record_id), Some(attribute_id)) = (record_id, attribute_id) {
        attachments
            .extend(record_attachments(state, &mut conn, record_id, &attribute_id).await?);
    }

    let mail = OutgoingMail {
        to_list: row.try_get("to_list").map_err(classify_db_error)?,
        cc_list: row.try_get("cc_list").map_err(classify_db_error)?,
        bcc_list: row.try_get("bcc_list").map_err(classify_db_error)?,
        subject: row.try_get("subject").map_err(classify_db_error)?,
        body: row.try_get("body").map_err(classify_db_error)?,
        attachments,
    };

    state.mailer.send(&account, &mail).await?;

    let file_names: Vec<String> = mail.attachments.iter().map(|a| a.name.clone()).collect();
    sqlx::query(
        "INSERT INTO instance.mail_traffic
            (from_list, to_list, cc_list, bcc_list, subject, date, outgoing, files, mail_account_id)
         VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $8)",
    )
    .bind(account.send_as.clone().unwrap_or_default())
    .bind(&mail.to_list)
    .bind(&mail.cc_list)
    .bind(&mail.bcc_list)
    .bind(&mail.subject)
    .bind(Utc::now().timestamp())
    .bind(&file_names)
    .bind(account.id)
    .execute(&mut *conn)
    .await
    .map_err(classify_db_error)?;

    sqlx::query("DELETE FROM instance.mail_spool WHERE id = $1")
        .bind(mail_id)
        .execute(&mut *conn)
        .await
        .map_err(classify_db_error)?;

    tracing::info!(mail_id, to = %mail.to_list, "mail sent");
    Ok(())
}

async fn spool_attachments(
    conn: &mut PgConnection,
    mail_id: i64,
) -> Result<Vec<MailAttachment>> {
    let rows = sqlx::query(
        "SELECT file, file_name FROM instance.mail_spool_file
         WHERE mail_id = $1 ORDER BY position_order",
    )
    .bind(mail_id)
    .fetch_all(conn)
    .await
    .map_err(classify_db_error)?;

    rows.iter()
        .map(|row| {
            Ok(MailAttachment {
                name: row.try_get("file_name").map_err(classify_db_error)?,
                bytes: row.try_get("file").map_err(classify_db_error)?,
            })
        })
        .collect()
}

/// Load the latest version bytes of every non-deleted file on the record
/// attribute.
async fn record_attachments(
    state: &AppState,
    conn: &mut PgConnection,
    record_id: i64,
    attribute_id: &Uuid,
) -> Result<Vec<MailAttachment>> {
    let table = format!(
        "instance_file.{}",
        bp_store::migrate::quote_ident(&format!("{attribute_id}_record"))
    );
    let sql = format!(
        "SELECT file_id, name FROM {table} WHERE record_id = $1 AND date_delete IS NULL"
    );
    let rows = sqlx::query(&sql)
        .bind(record_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify_db_error)?;

    let mut attachments = Vec::with_capacity(rows.len());
    for row in &rows {
        let file_id: Uuid = row.try_get("file_id").map_err(classify_db_error)?;
        let name: String = row.try_get("name").map_err(classify_db_error)?;

        let version: Option<i32> = sqlx::query_scalar(
            "SELECT MAX(version) FROM instance.file_version WHERE file_id = $1",
        )
        .bind(file_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(classify_db_error)?;
        let Some(version) = version else { continue };

        let path = file_path(&state.cfg.paths.files, &file_id, version as i64);
        let bytes = tokio::fs::read(&path).await?;
        attachments.push(MailAttachment { name, bytes });
    }
    Ok(attachments)
}
