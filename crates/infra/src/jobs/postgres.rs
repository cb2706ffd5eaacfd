//! Postgres-backed task store.
//!
//! ## Atomicity
//!
//! - `claim_pending` is a single `UPDATE ... WHERE status = 'PENDING' RETURNING`, so two
//!   racing dispatchers see exactly one winner.
//! - `update` loads the row with `SELECT ... FOR UPDATE`, applies the mutator in memory
//!   and writes every mutable column back inside the same transaction.
//! - `reset_stuck` and `delete_expired` are single statements.
//!
//! ## Threading
//!
//! The trait is synchronous. Calls are driven to completion on the tokio runtime handle
//! given at construction, so they must come from plain threads (the export workers),
//! never from inside an async task running on that runtime.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;

use reportforge_core::{ErrorCode, OwnerId, TaskId, WorkerId};

use super::store::{TaskMutator, TaskStore, TaskStoreError};
use super::types::{ExportTask, TaskFailure, TaskStatus};

/// Schema for the `export_task` table.
pub const MIGRATION: &str = include_str!("../../migrations/0001_export_task.sql");

const COLUMNS: &str = "id, owner_id, status, progress, total_rows, processed_rows, sheet_count, \
     artifact_path, download_ref, error_code, error_message, worker_id, attempt, \
     last_heartbeat, created_at, updated_at, expire_at, request_json";

#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Create the table and indexes if they do not exist.
    pub fn migrate(&self) -> Result<(), TaskStoreError> {
        let pool = self.pool.clone();
        self.block_on(async move {
            sqlx::raw_sql(MIGRATION)
                .execute(&*pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
            Ok(())
        })
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }

    fn fetch_many(
        &self,
        op: &'static str,
        sql: String,
        bind: impl FnOnce(
            sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<ExportTask>, TaskStoreError> {
        let pool = self.pool.clone();
        self.block_on(async move {
            let rows = bind(sqlx::query(&sql))
                .fetch_all(&*pool)
                .await
                .map_err(|e| map_sqlx_error(op, e))?;
            rows.iter().map(task_from_row).collect()
        })
    }
}

impl TaskStore for PostgresTaskStore {
    fn create(&self, task: ExportTask) -> Result<TaskId, TaskStoreError> {
        let pool = self.pool.clone();
        let id = task.id;
        self.block_on(async move {
            let sql = format!(
                "INSERT INTO export_task ({COLUMNS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
            );
            sqlx::query(&sql)
                .bind(*task.id.as_uuid())
                .bind(task.owner.as_str())
                .bind(task.status.as_str())
                .bind(task.progress.map(i16::from))
                .bind(task.total_rows.map(to_i64))
                .bind(task.processed_rows.map(to_i64))
                .bind(to_i32(task.sheet_count))
                .bind(task.artifact_path.as_deref())
                .bind(task.download_ref.as_deref())
                .bind(task.error.as_ref().map(|e| e.code.as_str()))
                .bind(task.error.as_ref().map(|e| e.message.as_str()))
                .bind(task.worker_id.map(|w| *w.as_uuid()))
                .bind(to_i32(task.attempt))
                .bind(task.last_heartbeat)
                .bind(task.created_at)
                .bind(task.updated_at)
                .bind(task.expire_at)
                .bind(task.request.as_deref())
                .execute(&*pool)
                .await
                .map_err(|e| {
                    let duplicate = matches!(
                        &e,
                        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
                    );
                    if duplicate {
                        TaskStoreError::AlreadyExists(id)
                    } else {
                        map_sqlx_error("create", e)
                    }
                })?;
            Ok(id)
        })
    }

    fn get(&self, id: TaskId) -> Result<Option<ExportTask>, TaskStoreError> {
        let pool = self.pool.clone();
        self.block_on(async move {
            let sql = format!("SELECT {COLUMNS} FROM export_task WHERE id = $1");
            let row = sqlx::query(&sql)
                .bind(*id.as_uuid())
                .fetch_optional(&*pool)
                .await
                .map_err(|e| map_sqlx_error("get", e))?;
            row.as_ref().map(task_from_row).transpose()
        })
    }

    fn update(&self, id: TaskId, mutate: TaskMutator<'_>) -> Result<ExportTask, TaskStoreError> {
        let pool = self.pool.clone();
        self.block_on(async move {
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;

            let sql = format!("SELECT {COLUMNS} FROM export_task WHERE id = $1 FOR UPDATE");
            let row = sqlx::query(&sql)
                .bind(*id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("lock_task", e))?
                .ok_or(TaskStoreError::NotFound(id))?;

            let mut task = task_from_row(&row)?;
            let locked_status = task.status;
            let locked_worker = task.worker_id;
            mutate(&mut task)?;

            let written = sqlx::query(
                r#"
                UPDATE export_task SET
                    status = $2,
                    progress = $3,
                    total_rows = $4,
                    processed_rows = $5,
                    artifact_path = $6,
                    download_ref = $7,
                    error_code = $8,
                    error_message = $9,
                    worker_id = $10,
                    attempt = $11,
                    last_heartbeat = $12,
                    updated_at = $13,
                    expire_at = $14
                WHERE id = $1 AND status = $15 AND worker_id IS NOT DISTINCT FROM $16
                "#,
            )
            .bind(*task.id.as_uuid())
            .bind(task.status.as_str())
            .bind(task.progress.map(i16::from))
            .bind(task.total_rows.map(to_i64))
            .bind(task.processed_rows.map(to_i64))
            .bind(task.artifact_path.as_deref())
            .bind(task.download_ref.as_deref())
            .bind(task.error.as_ref().map(|e| e.code.as_str()))
            .bind(task.error.as_ref().map(|e| e.message.as_str()))
            .bind(task.worker_id.map(|w| *w.as_uuid()))
            .bind(to_i32(task.attempt))
            .bind(task.last_heartbeat)
            .bind(task.updated_at)
            .bind(task.expire_at)
            .bind(locked_status.as_str())
            .bind(locked_worker.map(|w| *w.as_uuid()))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_task", e))?;

            // Status and owner are what the mutator checked against.
            if written.rows_affected() != 1 {
                return Err(TaskStoreError::Storage(format!(
                    "task {id} changed while locked for update"
                )));
            }

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit", e))?;
            Ok(task)
        })
    }

    fn claim_pending(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<ExportTask>, TaskStoreError> {
        let pool = self.pool.clone();
        self.block_on(async move {
            let sql = format!(
                "UPDATE export_task SET status = 'RUNNING', worker_id = $2, \
                 attempt = attempt + 1, last_heartbeat = $3, updated_at = $3 \
                 WHERE id = $1 AND status = 'PENDING' RETURNING {COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(*id.as_uuid())
                .bind(*worker.as_uuid())
                .bind(now)
                .fetch_optional(&*pool)
                .await
                .map_err(|e| map_sqlx_error("claim_pending", e))?;
            row.as_ref().map(task_from_row).transpose()
        })
    }

    fn list_by_status(&self, status: TaskStatus) -> Result<Vec<ExportTask>, TaskStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM export_task WHERE status = $1 ORDER BY created_at ASC, id ASC"
        );
        self.fetch_many("list_by_status", sql, |q| q.bind(status.as_str()))
    }

    fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<ExportTask>, TaskStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM export_task WHERE owner_id = $1 ORDER BY created_at DESC, id DESC"
        );
        let owner = owner.as_str().to_string();
        self.fetch_many("list_by_owner", sql, move |q| q.bind(owner))
    }

    fn list_all(&self) -> Result<Vec<ExportTask>, TaskStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM export_task ORDER BY created_at DESC, id DESC");
        self.fetch_many("list_all", sql, |q| q)
    }

    fn reset_stuck(
        &self,
        threshold: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExportTask>, TaskStoreError> {
        let sql = format!(
            "UPDATE export_task SET status = 'PENDING', worker_id = NULL, \
             last_heartbeat = NULL, updated_at = $2 \
             WHERE status = 'RUNNING' AND (last_heartbeat IS NULL OR last_heartbeat < $1) \
             RETURNING {COLUMNS}"
        );
        let mut reset = self.fetch_many("reset_stuck", sql, move |q| q.bind(threshold).bind(now))?;
        reset.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(reset)
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<ExportTask>, TaskStoreError> {
        let sql = format!("DELETE FROM export_task WHERE expire_at < $1 RETURNING {COLUMNS}");
        self.fetch_many("delete_expired", sql, move |q| q.bind(now))
    }
}

fn task_from_row(row: &PgRow) -> Result<ExportTask, TaskStoreError> {
    let get_err = |e| map_sqlx_error("decode_task", e);

    let status: String = row.try_get("status").map_err(get_err)?;
    let status = TaskStatus::parse(&status)
        .ok_or_else(|| TaskStoreError::Storage(format!("unknown task status `{status}`")))?;

    let error_code: Option<String> = row.try_get("error_code").map_err(get_err)?;
    let error_message: Option<String> = row.try_get("error_message").map_err(get_err)?;
    let error = match error_code {
        Some(code) => Some(TaskFailure {
            code: ErrorCode::parse(&code).ok_or_else(|| {
                TaskStoreError::Storage(format!("unknown error code `{code}`"))
            })?,
            message: error_message.unwrap_or_default(),
        }),
        None => None,
    };

    let progress: Option<i16> = row.try_get("progress").map_err(get_err)?;
    let total_rows: Option<i64> = row.try_get("total_rows").map_err(get_err)?;
    let processed_rows: Option<i64> = row.try_get("processed_rows").map_err(get_err)?;
    let sheet_count: i32 = row.try_get("sheet_count").map_err(get_err)?;
    let attempt: i32 = row.try_get("attempt").map_err(get_err)?;
    let worker_id: Option<uuid::Uuid> = row.try_get("worker_id").map_err(get_err)?;
    let owner: String = row.try_get("owner_id").map_err(get_err)?;

    Ok(ExportTask {
        id: TaskId::from_uuid(row.try_get("id").map_err(get_err)?),
        owner: OwnerId::new(owner),
        status,
        progress: progress.map(|p| p.clamp(0, 100) as u8),
        total_rows: total_rows.map(from_i64),
        processed_rows: processed_rows.map(from_i64),
        sheet_count: u32::try_from(sheet_count).unwrap_or(0),
        artifact_path: row.try_get("artifact_path").map_err(get_err)?,
        download_ref: row.try_get("download_ref").map_err(get_err)?,
        error,
        worker_id: worker_id.map(WorkerId::from_uuid),
        attempt: u32::try_from(attempt).unwrap_or(0),
        last_heartbeat: row.try_get("last_heartbeat").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
        expire_at: row.try_get("expire_at").map_err(get_err)?,
        request: row.try_get("request_json").map_err(get_err)?,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    tracing::error!(operation, error = %err, "export_task query failed");
    TaskStoreError::Storage(format!("{operation}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_saturate_instead_of_wrapping() {
        assert_eq!(to_i64(u64::MAX), i64::MAX);
        assert_eq!(from_i64(-5), 0);
        assert_eq!(to_i32(u32::MAX), i32::MAX);
    }

    #[test]
    fn migration_defines_the_columns_the_store_reads() {
        for column in COLUMNS.split(',').map(str::trim) {
            assert!(MIGRATION.contains(column), "missing column {column}");
        }
        assert!(MIGRATION.contains("CREATE TABLE IF NOT EXISTS export_task"));
    }
}
