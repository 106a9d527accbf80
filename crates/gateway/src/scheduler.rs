//! Task scheduler.
//!
//! Timer-driven invocation of named system tasks and user-defined scheduled
//! PG functions. A task fires when `now − date_attempt ≥ interval`;
//! `date_attempt` advances before the run so a failing task backs off by its
//! own interval, `date_success` moves only on success. Master-only tasks run
//! on the elected master; per-node tasks additionally gate on
//! `node_schedule` rows so every node runs them on its own clock.

use std::time::Duration;

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use bp_domain::error::{classify_db_error, Error, Result};
use bp_store::LogContext;

use crate::state::AppState;

const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Budget for one task run, shared with user PG function execution.
const TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// The scheduler loop; spawned once at boot.
pub async fn run_loop(state: AppState) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(err) = tick(&state).await {
            tracing::error!(%err, "scheduler tick failed");
            state
                .log
                .error(LogContext::Scheduler, &format!("tick failed: {err}"))
                .await;
        }
    }
}

async fn tick(state: &AppState) -> Result<()> {
    run_due_system_tasks(state).await?;
    if state.cluster.is_master() {
        run_due_function_schedules(state).await?;
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// System tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TaskRow {
    name: String,
    interval_seconds: i64,
    cluster_master_only: bool,
    schedule_id: i64,
    date_attempt: i64,
}

async fn run_due_system_tasks(state: &AppState) -> Result<()> {
    let rows = sqlx::query(
        "SELECT t.name, t.interval_seconds, t.cluster_master_only,
                s.id AS schedule_id, s.date_attempt
         FROM instance.task t
         JOIN instance.schedule s ON s.task_name = t.name
         WHERE t.active AND NOT t.embedded_only",
    )
    .fetch_all(state.db.pool())
    .await
    .map_err(classify_db_error)?;

    let now = Utc::now().timestamp();
    for row in rows {
        let task = TaskRow {
            name: row.try_get("name").map_err(classify_db_error)?,
            interval_seconds: row.try_get("interval_seconds").map_err(classify_db_error)?,
            cluster_master_only: row
                .try_get("cluster_master_only")
                .map_err(classify_db_error)?,
            schedule_id: row.try_get("schedule_id").map_err(classify_db_error)?,
            date_attempt: row.try_get("date_attempt").map_err(classify_db_error)?,
        };

        if task.cluster_master_only {
            if !state.cluster.is_master() {
                continue;
            }
            if now - task.date_attempt < task.interval_seconds {
                continue;
            }
            run_system_task(state, &task.name, Gate::Global(task.schedule_id)).await;
        } else {
            // Per-node pinning: each node gates on its own schedule row.
            let node_attempt = node_schedule_attempt(state, task.schedule_id).await?;
            if now - node_attempt < task.interval_seconds {
                continue;
            }
            run_system_task(state, &task.name, Gate::Node(task.schedule_id)).await;
        }
    }
    Ok(())
}

/// Which schedule row records this run.
enum Gate {
    Global(i64),
    Node(i64),
}

async fn node_schedule_attempt(state: &AppState, schedule_id: i64) -> Result<i64> {
    let attempt: Option<i64> = sqlx::query_scalar(
        "SELECT date_attempt FROM instance_cluster.node_schedule
         WHERE node_id = $1 AND schedule_id = $2",
    )
    .bind(state.node_id)
    .bind(schedule_id)
    .fetch_optional(state.db.pool())
    .await
    .map_err(classify_db_error)?;

    match attempt {
        Some(attempt) => Ok(attempt),
        None => {
            sqlx::query(
                "INSERT INTO instance_cluster.node_schedule
                    (node_id, schedule_id, date_attempt, date_success)
                 VALUES ($1, $2, 0, 0) ON CONFLICT DO NOTHING",
            )
            .bind(state.node_id)
            .bind(schedule_id)
            .execute(state.db.pool())
            .await
            .map_err(classify_db_error)?;
            Ok(0)
        }
    }
}

async fn mark(state: &AppState, gate: &Gate, success: bool) -> Result<()> {
    let now = Utc::now().timestamp();
    match gate {
        Gate::Global(schedule_id) => {
            let sql = if success {
                "UPDATE instance.schedule SET date_attempt = $1, date_success = $1 WHERE id = $2"
            } else {
                "UPDATE instance.schedule SET date_attempt = $1 WHERE id = $2"
            };
            sqlx::query(sql)
                .bind(now)
                .bind(schedule_id)
                .execute(state.db.pool())
                .await
                .map_err(classify_db_error)?;
        }
        Gate::Node(schedule_id) => {
            let sql = if success {
                "UPDATE instance_cluster.node_schedule
                 SET date_attempt = $1, date_success = $1
                 WHERE node_id = $2 AND schedule_id = $3"
            } else {
                "UPDATE instance_cluster.node_schedule
                 SET date_attempt = $1
                 WHERE node_id = $2 AND schedule_id = $3"
            };
            sqlx::query(sql)
                .bind(now)
                .bind(state.node_id)
                .bind(schedule_id)
                .execute(state.db.pool())
                .await
                .map_err(classify_db_error)?;
        }
    }
    Ok(())
}

async fn run_system_task(state: &AppState, name: &str, gate: Gate) {
    // Attempt advances first: a crashing task backs off by its interval.
    if let Err(err) = mark(state, &gate, false).await {
        tracing::error!(task = name, %err, "failed to advance task attempt");
        return;
    }

    let started = std::time::Instant::now();
    let result = tokio::time::timeout(TASK_TIMEOUT, execute_system_task(state, name)).await;

    match result {
        Ok(Ok(())) => {
            tracing::debug!(task = name, elapsed_ms = started.elapsed().as_millis() as u64, "task done");
            if let Err(err) = mark(state, &gate, true).await {
                tracing::error!(task = name, %err, "failed to record task success");
            }
        }
        Ok(Err(err)) => {
            tracing::warn!(task = name, %err, "task failed");
            state
                .log
                .warning(LogContext::Scheduler, &format!("task {name} failed: {err}"))
                .await;
        }
        Err(_) => {
            tracing::warn!(task = name, "task timed out");
            state
                .log
                .warning(LogContext::Scheduler, &format!("task {name} timed out"))
                .await;
        }
    }
}

async fn execute_system_task(state: &AppState, name: &str) -> Result<()> {
    match name {
        "cleanupBruteforce" => {
            state.bruteforce.reset();
            Ok(())
        }
        "cleanupFiles" => crate::data::files::cleanup(state).await,
        "cleanupLogs" => state.log.cleanup().await.map(|_| ()),
        "cleanupMailTraffic" => cleanup_mail_traffic(state).await,
        "clusterCheckIn" => crate::cluster::check_in(state).await,
        "clusterProcessEvents" => crate::cluster::drain(state).await.map(|_| ()),
        "mailSend" => crate::spooler::mail::drain(state).await,
        "restCall" => crate::spooler::rest::drain(state).await,
        "sessionsLog" => crate::auth::session::log_count(state).await,
        "updateCheck" => update_check(state).await,
        other => {
            tracing::warn!(task = other, "unknown system task");
            Ok(())
        }
    }
}

async fn cleanup_mail_traffic(state: &AppState) -> Result<()> {
    let keep_days = state.runtime.get_i64("mailTrafficKeepDays").max(1);
    let cutoff = Utc::now().timestamp() - keep_days * 86_400;
    sqlx::query("DELETE FROM instance.mail_traffic WHERE date < $1")
        .bind(cutoff)
        .execute(state.db.pool())
        .await
        .map_err(classify_db_error)?;
    Ok(())
}

/// Query the configured update URL and remember the published version for
/// the admin surface.
async fn update_check(state: &AppState) -> Result<()> {
    let url = state.runtime.get_string("updateCheckUrl");
    if url.is_empty() {
        return Ok(());
    }

    #[derive(serde::Deserialize)]
    struct UpdateInfo {
        version: String,
    }

    let info: UpdateInfo = reqwest::Client::new()
        .get(&url)
        .query(&[("version", bp_domain::VERSION_FULL)])
        .send()
        .await
        .map_err(|err| Error::Internal(format!("update check failed: {err}")))?
        .json()
        .await
        .map_err(|err| Error::Internal(format!("bad update check response: {err}")))?;

    state
        .runtime
        .set(&state.db, "updateCheckVersion", &info.version)
        .await?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// User-defined PG function schedules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Interval length in seconds; month/year lengths are calendar
/// approximations, good enough for a back-off gate.
fn interval_seconds(interval_type: &str, value: i64) -> Option<i64> {
    let unit = match interval_type {
        "seconds" => 1,
        "minutes" => 60,
        "hours" => 3_600,
        "days" => 86_400,
        "weeks" => 604_800,
        "months" => 2_592_000,
        "years" => 31_536_000,
        _ => return None,
    };
    Some(unit * value.max(1))
}

async fn run_due_function_schedules(state: &AppState) -> Result<()> {
    let rows = sqlx::query(
        "SELECT s.id AS schedule_id, s.date_attempt,
                fs.id AS fn_schedule_id, fs.pg_function_id, fs.interval_type, fs.interval_value
         FROM instance.schedule s
         JOIN app.pg_function_schedule fs ON fs.id = s.pg_function_schedule_id",
    )
    .fetch_all(state.db.pool())
    .await
    .map_err(classify_db_error)?;

    let now = Utc::now().timestamp();
    for row in rows {
        let schedule_id: i64 = row.try_get("schedule_id").map_err(classify_db_error)?;
        let date_attempt: i64 = row.try_get("date_attempt").map_err(classify_db_error)?;
        let interval_type: String = row.try_get("interval_type").map_err(classify_db_error)?;
        let interval_value: i32 = row.try_get("interval_value").map_err(classify_db_error)?;
        let pg_function_id: Uuid = row.try_get("pg_function_id").map_err(classify_db_error)?;

        let due = match interval_type.as_str() {
            // One-shot schedules run exactly once.
            "once" => date_attempt == 0,
            other => match interval_seconds(other, interval_value as i64) {
                Some(seconds) => now - date_attempt >= seconds,
                None => {
                    tracing::warn!(interval = other, "unknown schedule interval type");
                    false
                }
            },
        };
        if !due {
            continue;
        }

        run_pg_function_schedule(state, schedule_id, &pg_function_id).await;
    }
    Ok(())
}

async fn run_pg_function_schedule(state: &AppState, schedule_id: i64, pg_function_id: &Uuid) {
    let gate = Gate::Global(schedule_id);
    if let Err(err) = mark(state, &gate, false).await {
        tracing::error!(%err, "failed to advance function schedule attempt");
        return;
    }

    match execute_pg_function(state, pg_function_id).await {
        Ok(()) => {
            if let Err(err) = mark(state, &gate, true).await {
                tracing::error!(%err, "failed to record function schedule success");
            }
        }
        Err(err) => {
            tracing::warn!(function_id = %pg_function_id, %err, "scheduled function failed");
            state
                .log
                .warning(
                    LogContext::Scheduler,
                    &format!("scheduled function {pg_function_id} failed: {err}"),
                )
                .await;
        }
    }
}

/// Execute a user PG function without arguments under the system budget.
pub async fn execute_pg_function(state: &AppState, pg_function_id: &Uuid) -> Result<()> {
    let function = state
        .schema
        .pg_function(pg_function_id)
        .ok_or(Error::SchemaUnknown(
            bp_domain::error::SchemaEntity::PgFunction,
            *pg_function_id,
        ))?;
    let module = state
        .schema
        .module(&function.module_id)
        .ok_or(Error::SchemaUnknown(
            bp_domain::error::SchemaEntity::Module,
            function.module_id,
        ))?;

    let sql = format!(
        "SELECT {}.{}()",
        bp_store::migrate::quote_ident(&module.name),
        bp_store::migrate::quote_ident(&function.name),
    );

    state
        .db
        .deadline(TASK_TIMEOUT, async {
            sqlx::query(&sql)
                .execute(state.db.pool())
                .await
                .map_err(classify_db_error)?;
            Ok(())
        })
        .await
}

/// Immediate out-of-band run requested through a `taskTriggered` event.
pub async fn run_triggered(
    state: &AppState,
    task_name: &str,
    pg_function_schedule_id: Option<Uuid>,
) {
    if !task_name.is_empty() {
        let schedule_id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM instance.schedule WHERE task_name = $1")
                .bind(task_name)
                .fetch_optional(state.db.pool())
                .await
                .ok()
                .flatten();
        let Some(schedule_id) = schedule_id else {
            tracing::warn!(task = task_name, "triggered task has no schedule row");
            return;
        };
        run_system_task(state, task_name, Gate::Global(schedule_id)).await;
        return;
    }

    if let Some(fn_schedule_id) = pg_function_schedule_id {
        let row = sqlx::query(
            "SELECT s.id AS schedule_id, fs.pg_function_id
             FROM instance.schedule s
             JOIN app.pg_function_schedule fs ON fs.id = s.pg_function_schedule_id
             WHERE fs.id = $1",
        )
        .bind(fn_schedule_id)
        .fetch_optional(state.db.pool())
        .await;

        match row {
            Ok(Some(row)) => {
                let schedule_id: i64 = match row.try_get("schedule_id") {
                    Ok(id) => id,
                    Err(_) => return,
                };
                let pg_function_id: Uuid = match row.try_get("pg_function_id") {
                    Ok(id) => id,
                    Err(_) => return,
                };
                run_pg_function_schedule(state, schedule_id, &pg_function_id).await;
            }
            _ => {
                tracing::warn!(%fn_schedule_id, "triggered function schedule not found");
            }
        }
    }
}

/// Make sure every PG function schedule has its `instance.schedule` row;
/// called at boot and on `tasksChanged`/`schemaChanged` events.
pub async fn ensure_function_schedules(state: &AppState) -> Result<()> {
    sqlx::query(
        "INSERT INTO instance.schedule (pg_function_schedule_id, date_attempt, date_success)
         SELECT fs.id, 0, 0 FROM app.pg_function_schedule fs
         WHERE NOT EXISTS (
            SELECT 1 FROM instance.schedule s WHERE s.pg_function_schedule_id = fs.id
         )",
    )
    .execute(state.db.pool())
    .await
    .map_err(classify_db_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_conversion() {
        assert_eq!(interval_seconds("seconds", 30), Some(30));
        assert_eq!(interval_seconds("minutes", 5), Some(300));
        assert_eq!(interval_seconds("hours", 2), Some(7_200));
        assert_eq!(interval_seconds("days", 1), Some(86_400));
        assert_eq!(interval_seconds("weeks", 1), Some(604_800));
        assert_eq!(interval_seconds("fortnights", 1), None);
    }

    #[test]
    fn interval_floors_at_one() {
        // A zero or negative interval value must not produce a hot loop.
        assert_eq!(interval_seconds("seconds", 0), Some(1));
        assert_eq!(interval_seconds("minutes", -3), Some(60));
    }
}
