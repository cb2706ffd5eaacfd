//! Crash recovery for durable export tasks.
//!
//! Run once at startup (and safe to run again at any time):
//!
//! 1. RUNNING tasks whose heartbeat is older than the heartbeat timeout go back to PENDING.
//! 2. Every PENDING task is resubmitted from its stored request, unless it already sits in
//!    this process's queue, has used up its attempts, or its request can no longer be
//!    read or resolved. Those last cases are failed with a recovery error code.

use tracing::{info, warn};

use reportforge_core::{ErrorCode, ExportRequest, TaskId};

use crate::jobs::{ExportTask, TaskFailure, TaskStatus, TaskStoreError};

use super::service::{DispatchOutcome, ExportService};

/// What a recovery pass did, by task id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stale RUNNING tasks moved back to PENDING.
    pub reset: Vec<TaskId>,
    /// PENDING tasks handed to the worker pool.
    pub resumed: Vec<TaskId>,
    /// PENDING tasks marked FAILED instead of resumed.
    pub failed: Vec<TaskId>,
    /// PENDING tasks left alone because they are already queued here.
    pub skipped: Vec<TaskId>,
}

pub struct RecoveryCoordinator<'a> {
    service: &'a ExportService,
}

impl<'a> RecoveryCoordinator<'a> {
    pub fn new(service: &'a ExportService) -> Self {
        Self { service }
    }

    pub fn run(&self) -> Result<RecoveryReport, TaskStoreError> {
        let mut report = RecoveryReport::default();
        let store = self.service.store();
        let now = self.service.clock().now();

        let timeout = chrono::Duration::from_std(self.service.config().heartbeat_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let threshold = now.checked_sub_signed(timeout).unwrap_or(now);
        for task in store.reset_stuck(threshold, now)? {
            warn!(
                phase = "recovery.reset",
                task_id = %task.id,
                owner = %task.owner,
                attempt = task.attempt,
                "stale running task reset to pending"
            );
            report.reset.push(task.id);
        }

        for task in store.list_by_status(TaskStatus::Pending)? {
            self.resume(task, &mut report);
        }

        info!(
            phase = "recovery",
            reset = report.reset.len(),
            resumed = report.resumed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "export recovery finished"
        );
        Ok(report)
    }

    fn resume(&self, task: ExportTask, report: &mut RecoveryReport) {
        if self.service.is_queued(task.id) {
            report.skipped.push(task.id);
            return;
        }

        let max_attempts = self.service.config().max_attempts;
        if task.attempt >= max_attempts {
            self.fail(
                &task,
                TaskFailure::new(
                    ErrorCode::RetryExceeded,
                    format!("gave up after {} attempts", task.attempt),
                ),
                report,
            );
            return;
        }

        let request = match self.resolve(&task) {
            Ok(request) => request,
            Err(failure) => {
                self.fail(&task, failure, report);
                return;
            }
        };

        match self.service.dispatch(task.id, request, task.owner.clone()) {
            DispatchOutcome::Enqueued => {
                info!(
                    phase = "recovery.resume",
                    task_id = %task.id,
                    owner = %task.owner,
                    attempt = task.attempt,
                    "pending task resubmitted"
                );
                report.resumed.push(task.id);
            }
            DispatchOutcome::AlreadyQueued => report.skipped.push(task.id),
            DispatchOutcome::QueueSaturated | DispatchOutcome::Rejected => {
                report.failed.push(task.id)
            }
        }
    }

    /// Stored request, parsed and checked against the registries.
    fn resolve(&self, task: &ExportTask) -> Result<ExportRequest, TaskFailure> {
        let request = match task.stored_request() {
            None => {
                return Err(TaskFailure::new(
                    ErrorCode::RecoveryMissingRequest,
                    "task has no stored request",
                ));
            }
            Some(Err(err)) => {
                return Err(TaskFailure::new(
                    ErrorCode::RecoveryMissingRequest,
                    format!("stored request is unreadable: {err}"),
                ));
            }
            Some(Ok(request)) => request,
        };

        let builder = self.service.builder();
        builder
            .validate(&request)
            .and_then(|()| builder.check_keys(&request))
            .map_err(|err| TaskFailure::new(ErrorCode::RecoveryError, err.to_string()))?;
        Ok(request)
    }

    fn fail(&self, task: &ExportTask, failure: TaskFailure, report: &mut RecoveryReport) {
        warn!(
            phase = "recovery.fail",
            task_id = %task.id,
            owner = %task.owner,
            attempt = task.attempt,
            code = %failure.code,
            error = %failure.message,
            "pending task cannot be resumed"
        );
        self.service.fail_task(task.id, failure);
        report.failed.push(task.id);
    }
}
