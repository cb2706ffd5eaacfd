//! Export orchestration: synchronous exports, durable asynchronous tasks and their
//! lifecycle.
//!
//! ## Asynchronous path
//!
//! 1. `submit_async` validates the request, persists a PENDING task carrying the
//!    serialized request, then dispatches it.
//! 2. Dispatch fails the task fast with `QUEUE_SATURATED` when the worker queue is
//!    deeper than the configured threshold, or with `REJECTED` when the pool refuses it.
//! 3. A worker claims the task (PENDING -> RUNNING), then asks admission control for a
//!    slot. Rejection fails the task with the rejection code and nothing is written.
//! 4. Sheets are built and streamed into `export-{task_id}.{ext}` under the artifact
//!    directory while progress checkpoints refresh the heartbeat.
//! 5. The task ends SUCCESS with its artifact and download reference, or FAILED with
//!    an error code and message. Panics are caught and recorded as `PANICKED`.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use reportforge_core::{ErrorCode, ExportRequest, ExportResult, OwnerId, TaskId, WorkerId};
use reportforge_report::{ProgressSink, SheetWriter, StreamingReportBuilder};

use crate::config::ExportConfig;
use crate::jobs::{
    AdmissionController, AdmissionLimits, Clock, ExportTask, PoolRejected, ProgressReporter,
    SystemClock, TaskFailure, TaskStatus, TaskStore, TaskStoreError, WorkerPool,
};

use super::recovery::{RecoveryCoordinator, RecoveryReport};

const DEFAULT_RETENTION_DAYS: i64 = 7;

/// What happened to a dispatch attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Enqueued,
    /// The task is already waiting in this process's worker queue.
    AlreadyQueued,
    /// Failed fast with `QUEUE_SATURATED`.
    QueueSaturated,
    /// Failed with `REJECTED`.
    Rejected,
}

/// Why an artifact cannot be handed out.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("export task not found: {0}")]
    NotFound(TaskId),
    #[error("not allowed to download export task {0}")]
    Forbidden(TaskId),
    #[error("export task {task} is {status}, not ready for download")]
    NotReady { task: TaskId, status: TaskStatus },
    #[error("artifact of export task {0} is missing")]
    Missing(TaskId),
    #[error(transparent)]
    Store(#[from] TaskStoreError),
}

struct Inner {
    config: ExportConfig,
    builder: StreamingReportBuilder,
    writer: Arc<dyn SheetWriter>,
    store: Arc<dyn TaskStore>,
    admission: AdmissionController,
    pool: WorkerPool,
    clock: Arc<dyn Clock>,
    queued: Mutex<HashSet<TaskId>>,
}

/// Export engine entry point. Cheap to clone; clones share the pool and admission state.
#[derive(Clone)]
pub struct ExportService {
    inner: Arc<Inner>,
}

impl ExportService {
    pub fn new(
        config: ExportConfig,
        builder: StreamingReportBuilder,
        writer: impl SheetWriter + 'static,
        store: Arc<dyn TaskStore>,
    ) -> ExportResult<Self> {
        Self::with_clock(config, builder, writer, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ExportConfig,
        builder: StreamingReportBuilder,
        writer: impl SheetWriter + 'static,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
    ) -> ExportResult<Self> {
        let pool = WorkerPool::spawn("export-exec", config.worker_threads, config.queue_capacity)?;
        let admission = AdmissionController::with_clock(
            AdmissionLimits {
                max_system: config.max_system_concurrent,
                max_per_owner: config.max_owner_concurrent,
            },
            clock.clone(),
        );
        info!(
            max_system = config.max_system_concurrent,
            max_owner = config.max_owner_concurrent,
            threads = config.worker_threads,
            queue_capacity = config.queue_capacity,
            "export service started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                builder: builder.with_default_batch_size(config.default_page_size),
                config,
                writer: Arc::new(writer),
                store,
                admission,
                pool,
                clock,
                queued: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.inner.config
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    pub fn builder(&self) -> &StreamingReportBuilder {
        &self.inner.builder
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.pool.queue_depth()
    }

    pub fn active_count(&self) -> usize {
        self.inner.pool.active_count()
    }

    /// Export on the calling thread, straight into `out`.
    ///
    /// No task is recorded. The admission slot is held for the duration of the call and
    /// every error is returned as is.
    pub fn export_sync(
        &self,
        request: &ExportRequest,
        out: &mut dyn Write,
        owner: &OwnerId,
    ) -> ExportResult<()> {
        let started = Instant::now();
        self.inner.builder.validate(request)?;

        let _permit = self.inner.admission.try_admit(owner)?;
        self.log_concurrency_checked(owner);

        self.perform_export(request, out, None)?;

        info!(
            phase = "export_sync",
            owner = %owner,
            sheet_count = request.sheets.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "synchronous export finished"
        );
        Ok(())
    }

    /// Persist a PENDING task and hand it to the worker pool.
    ///
    /// Structural validation errors are returned and no task is created. Unknown provider
    /// or aggregator keys create the task and fail it before dispatch. Queue saturation
    /// and pool rejection also fail the task; the id is returned in all those cases.
    pub fn submit_async(&self, request: &ExportRequest, owner: &OwnerId) -> ExportResult<TaskId> {
        let started = Instant::now();
        self.inner.builder.validate(request)?;

        let now = self.inner.clock.now();
        let expire_at = self.expire_at(now);
        let task = ExportTask::new(owner.clone(), request, now, expire_at)?;
        let task_id = self.inner.store.create(task)?;

        let outcome = match self.inner.builder.check_keys(request) {
            Ok(()) => Some(self.dispatch(task_id, request.clone(), owner.clone())),
            Err(err) => {
                warn!(task_id = %task_id, owner = %owner, error = %err, "export request references unknown keys");
                self.fail_task(task_id, TaskFailure::from(&err));
                None
            }
        };

        info!(
            phase = "submit_async",
            task_id = %task_id,
            owner = %owner,
            sheet_count = request.sheets.len(),
            dispatch = ?outcome,
            duration_ms = started.elapsed().as_millis() as u64,
            "export task submitted"
        );
        Ok(task_id)
    }

    /// `now + expire_after`, clamped to the seven-day default when that overflows.
    fn expire_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let expire_after = self.inner.config.expire_after;
        chrono::Duration::from_std(expire_after)
            .ok()
            .and_then(|retention| now.checked_add_signed(retention))
            .unwrap_or_else(|| {
                warn!(
                    expire_after_secs = expire_after.as_secs(),
                    "retention out of range, using the default"
                );
                now.checked_add_signed(chrono::Duration::days(DEFAULT_RETENTION_DAYS))
                    .unwrap_or(now)
            })
    }

    /// Hand a PENDING task to the worker pool.
    pub(crate) fn dispatch(
        &self,
        task_id: TaskId,
        request: ExportRequest,
        owner: OwnerId,
    ) -> DispatchOutcome {
        let mut queued = self.queued();
        if queued.contains(&task_id) {
            debug!(task_id = %task_id, "task already queued");
            return DispatchOutcome::AlreadyQueued;
        }

        let depth = self.inner.pool.queue_depth();
        if depth > self.inner.config.queue_reject_threshold {
            drop(queued);
            self.fail_task(
                task_id,
                TaskFailure::new(
                    ErrorCode::QueueSaturated,
                    "too many export tasks queued, try again later",
                ),
            );
            warn!(
                phase = "run_task.rejected.queue",
                task_id = %task_id,
                owner = %owner,
                queue_depth = depth,
                active = self.inner.pool.active_count(),
                "export task rejected, queue saturated"
            );
            return DispatchOutcome::QueueSaturated;
        }

        queued.insert(task_id);
        drop(queued);

        let service = self.clone();
        let job_owner = owner.clone();
        let submitted = self
            .inner
            .pool
            .try_execute(Box::new(move || service.run_task(task_id, request, job_owner)));

        match submitted {
            Ok(()) => DispatchOutcome::Enqueued,
            Err(rejected) => {
                self.queued().remove(&task_id);
                let message = match rejected {
                    PoolRejected::Full => "too many export tasks queued, try again later",
                    PoolRejected::ShutDown => "export workers are shutting down",
                };
                self.fail_task(task_id, TaskFailure::new(ErrorCode::Rejected, message));
                warn!(
                    phase = "run_task.rejected",
                    task_id = %task_id,
                    owner = %owner,
                    error = %rejected,
                    queue_depth = self.inner.pool.queue_depth(),
                    active = self.inner.pool.active_count(),
                    "export task rejected by worker pool"
                );
                DispatchOutcome::Rejected
            }
        }
    }

    pub(crate) fn is_queued(&self, task_id: TaskId) -> bool {
        self.queued().contains(&task_id)
    }

    fn queued(&self) -> MutexGuard<'_, HashSet<TaskId>> {
        self.inner.queued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Job body executed on a pool worker.
    ///
    /// Every run claims the task under a fresh [`WorkerId`], so a run that was declared
    /// dead and superseded can no longer write to the task.
    fn run_task(&self, task_id: TaskId, request: ExportRequest, owner: OwnerId) {
        let started = Instant::now();
        self.queued().remove(&task_id);

        let worker = WorkerId::new();
        let task = match self
            .inner
            .store
            .claim_pending(task_id, worker, self.inner.clock.now())
        {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(task_id = %task_id, "task no longer pending, skipping");
                return;
            }
            Err(err) => {
                error!(task_id = %task_id, error = %err, "failed to claim export task");
                return;
            }
        };

        let estimate = catch_unwind(AssertUnwindSafe(|| self.inner.builder.estimate_total(&request)))
            .unwrap_or_default();
        let reporter = Arc::new(ProgressReporter::new(
            self.inner.store.clone(),
            task_id,
            worker,
            estimate,
            self.inner.clock.clone(),
            self.inner.config.progress_row_interval,
            self.inner.config.progress_time_interval,
        ));
        if let Err(err) = reporter.flush(true) {
            warn!(task_id = %task_id, error = %err, "initial progress checkpoint failed");
        }

        let result = catch_unwind(AssertUnwindSafe(|| {
            self.execute(task_id, &request, &owner, &reporter)
        }))
        .unwrap_or_else(|panic| {
            Err(TaskFailure::new(ErrorCode::Panicked, panic_message(panic.as_ref())))
        });

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(artifact) => {
                let processed = reporter.processed();
                let artifact = artifact.to_string_lossy().into_owned();
                let download_ref = self.download_ref(task_id);
                let now = self.inner.clock.now();
                match self.inner.store.update(task_id, &mut |t| {
                    t.mark_succeeded(worker, processed, artifact.clone(), download_ref.clone(), now)
                }) {
                    Ok(done) => info!(
                        phase = "run_task.success",
                        task_id = %task_id,
                        worker_id = %worker,
                        owner = %owner,
                        attempt = task.attempt,
                        processed_rows = processed,
                        total_rows = ?done.total_rows,
                        sheet_count = request.sheets.len(),
                        artifact = %artifact,
                        duration_ms,
                        "export task succeeded"
                    ),
                    Err(err) => warn!(
                        task_id = %task_id,
                        error = %err,
                        "export finished but the task could not be marked successful"
                    ),
                }
            }
            Err(failure) => {
                if let Err(err) = reporter.flush(true) {
                    debug!(task_id = %task_id, error = %err, "final progress checkpoint rejected");
                }
                error!(
                    phase = "run_task.failed",
                    task_id = %task_id,
                    worker_id = %worker,
                    owner = %owner,
                    attempt = task.attempt,
                    code = %failure.code,
                    error = %failure.message,
                    processed_rows = reporter.processed(),
                    duration_ms,
                    "export task failed"
                );
                let now = self.inner.clock.now();
                if let Err(err) = self
                    .inner
                    .store
                    .update(task_id, &mut |t| t.mark_run_failed(worker, failure.clone(), now))
                {
                    warn!(task_id = %task_id, code = %failure.code, error = %err, "could not mark task failed");
                }
            }
        }
    }

    /// Admission, artifact creation and the export itself. The slot is released on
    /// every exit path, unwinding included.
    fn execute(
        &self,
        task_id: TaskId,
        request: &ExportRequest,
        owner: &OwnerId,
        reporter: &Arc<ProgressReporter>,
    ) -> Result<PathBuf, TaskFailure> {
        let _permit = self
            .inner
            .admission
            .try_admit(owner)
            .map_err(|rejection| TaskFailure::new(rejection.code(), rejection.to_string()))?;
        self.log_concurrency_checked(owner);

        let path = self.artifact_file(task_id);
        let written = (|| -> ExportResult<()> {
            fs::create_dir_all(&self.inner.config.artifact_dir)?;
            let mut out = BufWriter::new(File::create(&path)?);
            let progress: Arc<dyn ProgressSink> = reporter.clone();
            self.perform_export(request, &mut out, Some(progress))?;
            out.flush()?;
            Ok(())
        })();
        written.map_err(TaskFailure::from)?;

        if let Err(err) = reporter.flush(true) {
            warn!(task_id = %task_id, error = %err, "final progress checkpoint failed");
        }
        Ok(path)
    }

    fn perform_export(
        &self,
        request: &ExportRequest,
        out: &mut dyn Write,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> ExportResult<()> {
        let build_started = Instant::now();
        let sheets = self.inner.builder.build(request, progress)?;
        let build_ms = build_started.elapsed().as_millis() as u64;

        let write_started = Instant::now();
        self.inner.writer.write_sheets(out, sheets)?;
        let write_ms = write_started.elapsed().as_millis() as u64;

        debug!(
            phase = "perform_export",
            build_ms,
            write_ms,
            sheet_count = request.sheets.len(),
            "sheets written"
        );
        Ok(())
    }

    fn log_concurrency_checked(&self, owner: &OwnerId) {
        debug!(
            phase = "concurrency_checked",
            owner = %owner,
            running_system = self.inner.admission.running_count(),
            running_owner = self.inner.admission.running_for(owner),
            "admission granted"
        );
    }

    /// Fail a PENDING task before it runs; any other state is left as is.
    pub(crate) fn fail_task(&self, task_id: TaskId, failure: TaskFailure) {
        let now = self.inner.clock.now();
        if let Err(err) = self
            .inner
            .store
            .update(task_id, &mut |t| t.mark_failed(failure.clone(), now))
        {
            warn!(task_id = %task_id, code = %failure.code, error = %err, "could not mark task failed");
        }
    }

    fn artifact_file(&self, task_id: TaskId) -> PathBuf {
        self.inner.config.artifact_dir.join(format!(
            "export-{task_id}.{}",
            self.inner.writer.file_extension()
        ))
    }

    fn download_ref(&self, task_id: TaskId) -> String {
        format!(
            "{}/{task_id}/download",
            self.inner.config.download_prefix.trim_end_matches('/')
        )
    }

    pub fn task(&self, task_id: TaskId) -> Result<Option<ExportTask>, TaskStoreError> {
        self.inner.store.get(task_id)
    }

    pub fn tasks_for_owner(&self, owner: &OwnerId) -> Result<Vec<ExportTask>, TaskStoreError> {
        self.inner.store.list_by_owner(owner)
    }

    pub fn all_tasks(&self) -> Result<Vec<ExportTask>, TaskStoreError> {
        self.inner.store.list_all()
    }

    /// Move a PENDING or RUNNING task to CANCELED.
    ///
    /// A queued task is skipped when its turn comes. A running worker is not interrupted;
    /// its final status write is rejected.
    pub fn cancel(&self, task_id: TaskId) -> Result<ExportTask, TaskStoreError> {
        let now = self.inner.clock.now();
        let task = self.inner.store.update(task_id, &mut |t| t.mark_canceled(now))?;
        info!(task_id = %task_id, owner = %task.owner, "export task canceled");
        Ok(task)
    }

    /// Artifact of a finished task, for its owner or an admin.
    pub fn artifact(
        &self,
        task_id: TaskId,
        requester: &OwnerId,
        is_admin: bool,
    ) -> Result<PathBuf, ArtifactError> {
        let task = self
            .inner
            .store
            .get(task_id)?
            .ok_or(ArtifactError::NotFound(task_id))?;

        if !is_admin && &task.owner != requester {
            return Err(ArtifactError::Forbidden(task_id));
        }
        if task.status != TaskStatus::Success {
            return Err(ArtifactError::NotReady {
                task: task_id,
                status: task.status,
            });
        }

        let path = task
            .artifact_path
            .map(PathBuf::from)
            .ok_or(ArtifactError::Missing(task_id))?;
        if !path.is_file() {
            return Err(ArtifactError::Missing(task_id));
        }
        Ok(path)
    }

    /// Delete expired tasks and their artifact files. Returns how many tasks were removed.
    pub fn cleanup_expired(&self) -> Result<usize, TaskStoreError> {
        let removed = self.inner.store.delete_expired(self.inner.clock.now())?;
        for task in &removed {
            let mut files = vec![self.artifact_file(task.id)];
            if let Some(path) = &task.artifact_path {
                files.push(PathBuf::from(path));
            }
            files.dedup();
            for file in files.iter().filter(|f| f.exists()) {
                if let Err(err) = fs::remove_file(file) {
                    warn!(task_id = %task.id, path = %file.display(), error = %err, "could not remove expired artifact");
                }
            }
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), "expired export tasks removed");
        }
        Ok(removed.len())
    }

    /// Crash recovery; see [`RecoveryCoordinator`].
    pub fn recover(&self) -> Result<RecoveryReport, TaskStoreError> {
        RecoveryCoordinator::new(self).run()
    }

    /// Stop accepting work and wait for queued and running tasks to finish.
    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }
}

impl core::fmt::Debug for ExportService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExportService")
            .field("admission", &self.inner.admission)
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("export panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("export panicked: {s}")
    } else {
        "export panicked".to_string()
    }
}
