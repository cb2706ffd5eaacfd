//! Durable export task and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reportforge_core::{
    ErrorCode, ExportError, ExportRequest, ExportResult, OwnerId, TaskId, WorkerId,
};

/// Task lifecycle status.
///
/// `Pending` is the only initial state; `Success`, `Failed` and `Canceled` are terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "RUNNING" => Some(TaskStatus::Running),
            "SUCCESS" => Some(TaskStatus::Success),
            "FAILED" => Some(TaskStatus::Failed),
            "CANCELED" => Some(TaskStatus::Canceled),
            _ => None,
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error code and message recorded on a FAILED task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl TaskFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&ExportError> for TaskFailure {
    fn from(err: &ExportError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<ExportError> for TaskFailure {
    fn from(err: ExportError) -> Self {
        Self::from(&err)
    }
}

/// A lifecycle transition the task does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("task {task} cannot move from {from} to {to}")]
    Status {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// A worker wrote to a RUNNING task it no longer owns (it was reset and re-claimed).
    #[error("task {task} is not owned by worker {worker}")]
    NotOwner {
        task: TaskId,
        worker: WorkerId,
        owner: Option<WorkerId>,
    },
}

/// Durable record of one asynchronous export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportTask {
    pub id: TaskId,
    pub owner: OwnerId,
    pub status: TaskStatus,
    /// Percentage 0..=100; `None` while the total is unknown.
    pub progress: Option<u8>,
    pub total_rows: Option<u64>,
    pub processed_rows: Option<u64>,
    pub sheet_count: u32,
    pub artifact_path: Option<String>,
    pub download_ref: Option<String>,
    pub error: Option<TaskFailure>,
    pub worker_id: Option<WorkerId>,
    pub attempt: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    /// The submitted request as JSON, needed to resume after a crash.
    pub request: Option<String>,
}

impl ExportTask {
    /// A fresh PENDING task carrying its serialized request.
    pub fn new(
        owner: OwnerId,
        request: &ExportRequest,
        now: DateTime<Utc>,
        expire_at: DateTime<Utc>,
    ) -> ExportResult<Self> {
        Ok(Self {
            id: TaskId::new(),
            owner,
            status: TaskStatus::Pending,
            progress: None,
            total_rows: None,
            processed_rows: None,
            sheet_count: u32::try_from(request.sheets.len()).unwrap_or(u32::MAX),
            artifact_path: None,
            download_ref: None,
            error: None,
            worker_id: None,
            attempt: 0,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
            expire_at,
            request: Some(serde_json::to_string(request)?),
        })
    }

    /// Deserialize the stored request.
    pub fn stored_request(&self) -> Option<ExportResult<ExportRequest>> {
        self.request
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| serde_json::from_str(raw).map_err(Into::into))
    }

    /// RUNNING with no heartbeat since `threshold`.
    pub fn is_stale(&self, threshold: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running
            && self.last_heartbeat.is_none_or(|beat| beat < threshold)
    }

    fn require(&self, to: TaskStatus, allowed: &[TaskStatus]) -> Result<(), TransitionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TransitionError::Status {
                task: self.id,
                from: self.status,
                to,
            })
        }
    }

    /// RUNNING and claimed by `worker`.
    fn require_owned(&self, worker: WorkerId, to: TaskStatus) -> Result<(), TransitionError> {
        self.require(to, &[TaskStatus::Running])?;
        if self.worker_id == Some(worker) {
            Ok(())
        } else {
            Err(TransitionError::NotOwner {
                task: self.id,
                worker,
                owner: self.worker_id,
            })
        }
    }

    /// PENDING -> RUNNING: take ownership and count an attempt.
    pub fn mark_running(&mut self, worker: WorkerId, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(TaskStatus::Running, &[TaskStatus::Pending])?;
        self.status = TaskStatus::Running;
        self.worker_id = Some(worker);
        self.attempt += 1;
        self.last_heartbeat = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Progress checkpoint from the owning worker. Counters never move backwards.
    pub fn record_progress(
        &mut self,
        worker: WorkerId,
        processed: u64,
        total: Option<u64>,
        percent: Option<u8>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.require_owned(worker, TaskStatus::Running)?;
        self.processed_rows = Some(self.processed_rows.map_or(processed, |old| old.max(processed)));
        if total.is_some() {
            self.total_rows = total;
        }
        if let Some(percent) = percent {
            let percent = percent.min(100);
            self.progress = Some(self.progress.map_or(percent, |old| old.max(percent)));
        }
        self.last_heartbeat = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// RUNNING -> SUCCESS, by the owning worker.
    pub fn mark_succeeded(
        &mut self,
        worker: WorkerId,
        processed: u64,
        artifact_path: impl Into<String>,
        download_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.require_owned(worker, TaskStatus::Success)?;
        let processed = self.processed_rows.map_or(processed, |old| old.max(processed));
        self.status = TaskStatus::Success;
        self.progress = Some(100);
        self.processed_rows = Some(processed);
        self.total_rows = self.total_rows.or(Some(processed));
        self.artifact_path = Some(artifact_path.into());
        self.download_ref = Some(download_ref.into());
        self.error = None;
        self.last_heartbeat = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// PENDING -> FAILED: rejected before any worker ran it.
    pub fn mark_failed(&mut self, failure: TaskFailure, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(TaskStatus::Failed, &[TaskStatus::Pending])?;
        self.status = TaskStatus::Failed;
        self.error = Some(failure);
        self.updated_at = now;
        Ok(())
    }

    /// RUNNING -> FAILED, by the owning worker. Counters keep their last reported values.
    pub fn mark_run_failed(
        &mut self,
        worker: WorkerId,
        failure: TaskFailure,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.require_owned(worker, TaskStatus::Failed)?;
        self.status = TaskStatus::Failed;
        self.error = Some(failure);
        self.updated_at = now;
        Ok(())
    }

    /// PENDING/RUNNING -> CANCELED.
    pub fn mark_canceled(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(TaskStatus::Canceled, &[TaskStatus::Pending, TaskStatus::Running])?;
        self.status = TaskStatus::Canceled;
        self.updated_at = now;
        Ok(())
    }

    /// RUNNING -> PENDING after a missed heartbeat: drop ownership.
    pub fn reset_to_pending(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(TaskStatus::Pending, &[TaskStatus::Running])?;
        self.status = TaskStatus::Pending;
        self.worker_id = None;
        self.last_heartbeat = None;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use reportforge_core::{ColumnNode, SheetSpec};

    fn task() -> ExportTask {
        let request = ExportRequest::new(vec![
            SheetSpec::new("users", vec![ColumnNode::leaf("Id", "id")]),
            SheetSpec::new("orders", vec![ColumnNode::leaf("Id", "id")]),
        ]);
        let now = Utc::now();
        ExportTask::new(OwnerId::new("alice"), &request, now, now + Duration::days(7)).unwrap()
    }

    #[test]
    fn new_task_is_pending_with_request() {
        let task = task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.sheet_count, 2);
        assert_eq!(task.attempt, 0);
        let request = task.stored_request().unwrap().unwrap();
        assert_eq!(request.sheets.len(), 2);
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut task = task();
        let now = Utc::now();
        let worker = WorkerId::new();

        task.mark_running(worker, now).unwrap();
        assert_eq!(task.attempt, 1);
        assert_eq!(task.last_heartbeat, Some(now));

        task.record_progress(worker, 500, Some(1000), Some(50), now).unwrap();
        task.mark_succeeded(worker, 1000, "/tmp/a.jsonl", "/export/task/x/download", now)
            .unwrap();

        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.progress, Some(100));
        assert_eq!(task.processed_rows, Some(1000));
        assert_eq!(task.total_rows, Some(1000));
    }

    #[test]
    fn success_fills_unknown_total_from_processed() {
        let mut task = task();
        let worker = WorkerId::new();
        task.mark_running(worker, Utc::now()).unwrap();
        task.mark_succeeded(worker, 7, "a", "b", Utc::now()).unwrap();
        assert_eq!(task.total_rows, Some(7));
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut task = task();
        let now = Utc::now();
        let worker = WorkerId::new();
        task.mark_running(worker, now).unwrap();
        task.record_progress(worker, 300, Some(1000), Some(30), now).unwrap();
        task.record_progress(worker, 200, None, Some(20), now).unwrap();
        assert_eq!(task.processed_rows, Some(300));
        assert_eq!(task.progress, Some(30));
        assert_eq!(task.total_rows, Some(1000));
    }

    #[test]
    fn terminal_tasks_are_frozen() {
        let mut task = task();
        let now = Utc::now();
        let worker = WorkerId::new();
        task.mark_running(worker, now).unwrap();
        task.mark_run_failed(worker, TaskFailure::new(ErrorCode::SourceFailure, "boom"), now)
            .unwrap();

        let err = task.record_progress(worker, 10, None, None, now).unwrap_err();
        assert!(matches!(err, TransitionError::Status { from: TaskStatus::Failed, .. }));
        assert!(task.mark_succeeded(worker, 10, "a", "b", now).is_err());
        assert!(task.mark_failed(TaskFailure::new(ErrorCode::Rejected, "late"), now).is_err());
        assert!(task.mark_canceled(now).is_err());
        assert!(task.reset_to_pending(now).is_err());
    }

    #[test]
    fn reset_drops_ownership() {
        let mut task = task();
        let now = Utc::now();
        task.mark_running(WorkerId::new(), now).unwrap();
        assert!(task.is_stale(now + Duration::seconds(1)));
        assert!(!task.is_stale(now));

        task.reset_to_pending(now).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.worker_id, None);
        assert_eq!(task.last_heartbeat, None);
        assert_eq!(task.attempt, 1);
    }

    #[test]
    fn only_the_claiming_worker_may_write_a_running_task() {
        let mut task = task();
        let now = Utc::now();
        let stalled = WorkerId::new();
        let current = WorkerId::new();
        task.mark_running(stalled, now).unwrap();
        task.reset_to_pending(now).unwrap();
        task.mark_running(current, now).unwrap();

        let err = task.record_progress(stalled, 50, None, None, now).unwrap_err();
        assert_eq!(
            err,
            TransitionError::NotOwner {
                task: task.id,
                worker: stalled,
                owner: Some(current),
            }
        );
        assert!(task.mark_succeeded(stalled, 50, "a", "b", now).is_err());
        assert!(
            task.mark_run_failed(stalled, TaskFailure::new(ErrorCode::Io, "disk"), now)
                .is_err()
        );
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.processed_rows, None);

        task.mark_succeeded(current, 3, "a", "b", now).unwrap();
        assert_eq!(task.status, TaskStatus::Success);
    }

    #[test]
    fn pre_run_failure_requires_a_pending_task() {
        let mut task = task();
        let now = Utc::now();
        task.mark_running(WorkerId::new(), now).unwrap();
        assert!(task.mark_failed(TaskFailure::new(ErrorCode::Rejected, "queue full"), now).is_err());
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[test]
    fn only_pending_tasks_can_be_claimed() {
        let mut task = task();
        task.mark_canceled(Utc::now()).unwrap();
        assert!(task.mark_running(WorkerId::new(), Utc::now()).is_err());
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failed,
            TaskStatus::Canceled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
    }
}
