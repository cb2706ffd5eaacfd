//! Integration tests for the full export pipeline.
//!
//! Tests: submit -> TaskStore -> WorkerPool -> admission -> builder -> writer -> artifact
//!
//! Verifies:
//! - Async tasks reach SUCCESS with progress, artifact and download reference
//! - Every fail-fast path records its error code without writing anything
//! - Crash recovery resets stale work and resumes pending tasks exactly once
//! - Cancel, artifact access and expiry cleanup

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{Receiver, Sender, channel};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use serde_json::{Value as JsonValue, json};
    use tempfile::TempDir;

    use reportforge_core::{
        ColumnNode, ErrorCode, ExportError, ExportRequest, ExportResult, Filters, OwnerId,
        SheetSpec, TaskId, WorkerId,
    };
    use reportforge_report::{
        AggregatorRegistry, InMemoryProvider, JsonLinesSheetWriter, Provider, ProviderRegistry,
        Record, RowSource, RowStream, StreamingReportBuilder, SumAggregator,
    };

    use crate::config::ExportConfig;
    use crate::export::{ArtifactError, ExportService};
    use crate::jobs::{
        Clock, ExportTask, InMemoryTaskStore, ManualClock, TaskMutator, TaskStatus, TaskStore,
        TaskStoreError,
    };

    const WAIT: Duration = Duration::from_secs(10);

    /// Provider whose `fetch` announces itself and then blocks until released.
    #[derive(Clone)]
    struct Gate {
        started: Sender<()>,
        release: Arc<Mutex<Receiver<()>>>,
    }

    struct GatedProvider(Gate);

    impl Provider for GatedProvider {
        fn with_filters(&self, _filters: &Filters) -> ExportResult<Box<dyn RowSource>> {
            Ok(Box::new(GatedSource(self.0.clone())))
        }
    }

    struct GatedSource(Gate);

    impl RowSource for GatedSource {
        fn fetch(&self, _batch_size: usize) -> ExportResult<RowStream> {
            let _ = self.0.started.send(());
            let _ = self.0.release.lock().unwrap().recv_timeout(WAIT);
            Ok(Box::new(std::iter::once(Record::from_serialize(
                &json!({"id": 1, "name": "gated", "amount": 1}),
            ))))
        }
    }

    struct PanickingProvider;

    impl Provider for PanickingProvider {
        fn with_filters(&self, _filters: &Filters) -> ExportResult<Box<dyn RowSource>> {
            panic!("provider exploded")
        }
    }

    struct FailingProvider;

    impl Provider for FailingProvider {
        fn with_filters(&self, _filters: &Filters) -> ExportResult<Box<dyn RowSource>> {
            Ok(Box::new(FailingSource))
        }
    }

    struct FailingSource;

    impl RowSource for FailingSource {
        fn fetch(&self, _batch_size: usize) -> ExportResult<RowStream> {
            Ok(Box::new(
                vec![
                    Record::from_serialize(&json!({"id": 1, "name": "ok", "amount": 1})),
                    Err(ExportError::source_failure("broken", "connection reset")),
                ]
                .into_iter(),
            ))
        }
    }

    /// Task store that remembers the status each committed update left behind.
    #[derive(Default)]
    struct RecordingStore {
        inner: InMemoryTaskStore,
        updates: Mutex<Vec<(TaskId, TaskStatus)>>,
    }

    impl RecordingStore {
        /// Committed updates that left the task RUNNING, i.e. progress checkpoints.
        fn checkpoints(&self, id: TaskId) -> usize {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .filter(|(task, status)| *task == id && *status == TaskStatus::Running)
                .count()
        }

        fn update_count(&self, id: TaskId) -> usize {
            self.updates.lock().unwrap().iter().filter(|(task, _)| *task == id).count()
        }
    }

    impl TaskStore for RecordingStore {
        fn create(&self, task: ExportTask) -> Result<TaskId, TaskStoreError> {
            self.inner.create(task)
        }

        fn get(&self, id: TaskId) -> Result<Option<ExportTask>, TaskStoreError> {
            self.inner.get(id)
        }

        fn update(&self, id: TaskId, mutate: TaskMutator<'_>) -> Result<ExportTask, TaskStoreError> {
            let task = self.inner.update(id, mutate)?;
            self.updates.lock().unwrap().push((id, task.status));
            Ok(task)
        }

        fn claim_pending(
            &self,
            id: TaskId,
            worker: WorkerId,
            now: chrono::DateTime<chrono::Utc>,
        ) -> Result<Option<ExportTask>, TaskStoreError> {
            self.inner.claim_pending(id, worker, now)
        }

        fn list_by_status(&self, status: TaskStatus) -> Result<Vec<ExportTask>, TaskStoreError> {
            self.inner.list_by_status(status)
        }

        fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<ExportTask>, TaskStoreError> {
            self.inner.list_by_owner(owner)
        }

        fn list_all(&self) -> Result<Vec<ExportTask>, TaskStoreError> {
            self.inner.list_all()
        }

        fn reset_stuck(
            &self,
            threshold: chrono::DateTime<chrono::Utc>,
            now: chrono::DateTime<chrono::Utc>,
        ) -> Result<Vec<ExportTask>, TaskStoreError> {
            self.inner.reset_stuck(threshold, now)
        }

        fn delete_expired(
            &self,
            now: chrono::DateTime<chrono::Utc>,
        ) -> Result<Vec<ExportTask>, TaskStoreError> {
            self.inner.delete_expired(now)
        }
    }

    struct Harness {
        service: ExportService,
        store: Arc<RecordingStore>,
        clock: ManualClock,
        started: Receiver<()>,
        release: Sender<()>,
        _dir: TempDir,
    }

    impl Harness {
        fn new(config: ExportConfig) -> Self {
            let dir = TempDir::new().unwrap();
            let (started_tx, started_rx) = channel();
            let (release_tx, release_rx) = channel();
            let gate = Gate {
                started: started_tx,
                release: Arc::new(Mutex::new(release_rx)),
            };

            let providers = ProviderRegistry::new()
                .with(
                    "users",
                    InMemoryProvider::from_json(
                        "users",
                        vec![
                            json!({"id": 1, "name": "ann", "amount": 10}),
                            json!({"id": 2, "name": "bob", "amount": 15}),
                        ],
                    ),
                )
                .with(
                    "ledger",
                    InMemoryProvider::from_json(
                        "ledger",
                        (1..=25)
                            .map(|id| json!({"id": id, "name": format!("entry-{id}"), "amount": 1}))
                            .collect(),
                    ),
                )
                .with("gated", GatedProvider(gate))
                .with("panics", PanickingProvider)
                .with("broken", FailingProvider);
            let aggregators = AggregatorRegistry::new().with("sum", SumAggregator::over(["amount"]));

            let store = Arc::new(RecordingStore::default());
            let clock = ManualClock::default();
            let service = ExportService::with_clock(
                config.with_artifact_dir(dir.path()),
                StreamingReportBuilder::new(providers, aggregators),
                JsonLinesSheetWriter,
                store.clone(),
                Arc::new(clock.clone()),
            )
            .unwrap();

            Self {
                service,
                store,
                clock,
                started: started_rx,
                release: release_tx,
                _dir: dir,
            }
        }

        fn wait_started(&self) {
            self.started.recv_timeout(WAIT).expect("gated export never started");
        }

        fn release(&self, n: usize) {
            for _ in 0..n {
                self.release.send(()).unwrap();
            }
        }

        fn task(&self, id: TaskId) -> ExportTask {
            self.store.get(id).unwrap().expect("task exists")
        }

        fn wait_terminal(&self, id: TaskId) -> ExportTask {
            let deadline = Instant::now() + WAIT;
            loop {
                let task = self.task(id);
                if task.status.is_terminal() {
                    return task;
                }
                assert!(Instant::now() < deadline, "task {id} stuck in {}", task.status);
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        fn wait_running(&self, id: TaskId) {
            let deadline = Instant::now() + WAIT;
            while self.task(id).status != TaskStatus::Running {
                assert!(Instant::now() < deadline, "task {id} never started");
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        /// Insert a task directly into the store, bypassing submission.
        fn seed(&self, owner: &str, request: &ExportRequest, edit: impl FnOnce(&mut ExportTask)) -> TaskId {
            let now = self.clock.now();
            let mut task = ExportTask::new(
                OwnerId::new(owner),
                request,
                now,
                now + chrono::Duration::days(7),
            )
            .unwrap();
            edit(&mut task);
            self.store.create(task).unwrap()
        }
    }

    fn columns() -> Vec<ColumnNode> {
        vec![
            ColumnNode::leaf("Id", "id"),
            ColumnNode::leaf("Name", "name"),
            ColumnNode::leaf("Amount", "amount"),
        ]
    }

    fn request(provider: &str) -> ExportRequest {
        ExportRequest::new(vec![SheetSpec::new(provider, columns())]).asynchronous()
    }

    fn summed_users() -> ExportRequest {
        ExportRequest::new(vec![SheetSpec::new("users", columns()).with_aggregate("sum")])
    }

    fn lines(bytes: &[u8]) -> Vec<JsonValue> {
        String::from_utf8_lossy(bytes)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn of_type<'a>(lines: &'a [JsonValue], ty: &str) -> Vec<&'a JsonValue> {
        lines.iter().filter(|l| l["type"] == ty).collect()
    }

    fn failure_code(task: &ExportTask) -> ErrorCode {
        task.error.as_ref().expect("task has a failure").code
    }

    fn alice() -> OwnerId {
        OwnerId::new("alice")
    }

    #[test]
    fn async_export_succeeds_with_artifact_and_download_ref() {
        let h = Harness::new(ExportConfig::default());
        let id = h.service.submit_async(&summed_users(), &alice()).unwrap();

        let task = h.wait_terminal(id);
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.progress, Some(100));
        assert_eq!(task.processed_rows, Some(2));
        assert_eq!(task.total_rows, Some(2));
        assert_eq!(task.attempt, 1);
        assert_eq!(task.download_ref.as_deref(), Some(format!("/export/task/{id}/download").as_str()));
        assert!(task.error.is_none());

        let path = h.service.artifact(id, &alice(), false).unwrap();
        assert!(path.ends_with(format!("export-{id}.jsonl")));
        let written = lines(&std::fs::read(&path).unwrap());
        assert_eq!(of_type(&written, "row").len(), 2);
        assert_eq!(of_type(&written, "summary")[0]["cells"], json!(["total", "", 25]));
        assert_eq!(h.service.admission().running_count(), 0);
        h.service.shutdown();
    }

    #[test]
    fn structurally_invalid_request_creates_no_task() {
        let h = Harness::new(ExportConfig::default());
        let err = h
            .service
            .submit_async(&ExportRequest::new(vec![]), &alice())
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::Validation);
        assert!(h.store.list_all().unwrap().is_empty());
    }

    #[test]
    fn unknown_provider_fails_task_before_dispatch() {
        let h = Harness::new(ExportConfig::default());
        let id = h.service.submit_async(&request("nope"), &alice()).unwrap();

        let task = h.task(id);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(failure_code(&task), ErrorCode::UnknownProvider);
        assert_eq!(task.attempt, 0);
    }

    #[test]
    fn system_saturation_fails_the_second_task() {
        let h = Harness::new(
            ExportConfig::default()
                .with_max_system_concurrent(1)
                .with_worker_threads(2),
        );
        let first = h.service.submit_async(&request("gated"), &alice()).unwrap();
        h.wait_started();

        let second = h
            .service
            .submit_async(&request("users"), &OwnerId::new("bob"))
            .unwrap();
        let task = h.wait_terminal(second);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(failure_code(&task), ErrorCode::SystemSaturated);
        assert!(task.artifact_path.is_none());
        assert!(!h.service.config().artifact_dir.join(format!("export-{second}.jsonl")).exists());

        h.release(1);
        assert_eq!(h.wait_terminal(first).status, TaskStatus::Success);
        h.service.shutdown();
    }

    #[test]
    fn owner_saturation_only_blocks_that_owner() {
        let h = Harness::new(
            ExportConfig::default()
                .with_max_owner_concurrent(1)
                .with_worker_threads(3),
        );
        let first = h.service.submit_async(&request("gated"), &alice()).unwrap();
        h.wait_started();

        let same_owner = h.service.submit_async(&request("users"), &alice()).unwrap();
        let task = h.wait_terminal(same_owner);
        assert_eq!(failure_code(&task), ErrorCode::OwnerSaturated);

        let other_owner = h
            .service
            .submit_async(&request("users"), &OwnerId::new("bob"))
            .unwrap();
        assert_eq!(h.wait_terminal(other_owner).status, TaskStatus::Success);

        h.release(1);
        assert_eq!(h.wait_terminal(first).status, TaskStatus::Success);
        h.service.shutdown();
    }

    #[test]
    fn deep_queue_fails_fast_with_queue_saturated() {
        let h = Harness::new(
            ExportConfig::default()
                .with_worker_threads(1)
                .with_queue_capacity(10)
                .with_queue_reject_threshold(0),
        );
        let running = h.service.submit_async(&request("gated"), &alice()).unwrap();
        h.wait_started();
        let queued = h.service.submit_async(&request("gated"), &alice()).unwrap();
        assert_eq!(h.service.queue_depth(), 1);

        let rejected = h.service.submit_async(&request("users"), &alice()).unwrap();
        let task = h.task(rejected);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(failure_code(&task), ErrorCode::QueueSaturated);

        h.release(2);
        assert_eq!(h.wait_terminal(running).status, TaskStatus::Success);
        assert_eq!(h.wait_terminal(queued).status, TaskStatus::Success);
        h.service.shutdown();
    }

    #[test]
    fn full_pool_rejects_the_task() {
        let h = Harness::new(
            ExportConfig::default()
                .with_worker_threads(1)
                .with_queue_capacity(1)
                .with_queue_reject_threshold(100),
        );
        let running = h.service.submit_async(&request("gated"), &alice()).unwrap();
        h.wait_started();
        let queued = h.service.submit_async(&request("gated"), &alice()).unwrap();

        let rejected = h.service.submit_async(&request("users"), &alice()).unwrap();
        let task = h.task(rejected);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(failure_code(&task), ErrorCode::Rejected);

        h.release(2);
        h.wait_terminal(running);
        h.wait_terminal(queued);
        h.service.shutdown();
    }

    #[test]
    fn source_errors_fail_the_task() {
        let h = Harness::new(ExportConfig::default());
        let id = h.service.submit_async(&request("broken"), &alice()).unwrap();

        let task = h.wait_terminal(id);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(failure_code(&task), ErrorCode::SourceFailure);
        assert_eq!(task.processed_rows, Some(1));
        assert!(task.download_ref.is_none());
        h.service.shutdown();
    }

    #[test]
    fn successful_run_checkpoints_once_at_start_and_once_at_end() {
        let h = Harness::new(ExportConfig::default());
        let id = h.service.submit_async(&request("users"), &alice()).unwrap();

        let task = h.wait_terminal(id);
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(h.store.checkpoints(id), 2);
        // start, end, SUCCESS
        assert_eq!(h.store.update_count(id), 3);
        h.service.shutdown();
    }

    #[test]
    fn failed_run_checkpoints_once_at_start_and_once_at_end() {
        let h = Harness::new(ExportConfig::default());
        let id = h.service.submit_async(&request("broken"), &alice()).unwrap();

        let task = h.wait_terminal(id);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(h.store.checkpoints(id), 2);
        assert_eq!(h.store.update_count(id), 3);
        h.service.shutdown();
    }

    #[test]
    fn admission_rejection_still_checkpoints_start_and_end() {
        let h = Harness::new(ExportConfig::default().with_max_system_concurrent(1));
        let running = h.service.submit_async(&request("gated"), &alice()).unwrap();
        h.wait_started();

        let rejected = h.service.submit_async(&request("users"), &OwnerId::new("bob")).unwrap();
        let task = h.wait_terminal(rejected);
        assert_eq!(failure_code(&task), ErrorCode::SystemSaturated);
        assert_eq!(h.store.checkpoints(rejected), 2);
        assert_eq!(h.store.update_count(rejected), 3);

        h.release(1);
        h.wait_terminal(running);
        h.service.shutdown();
    }

    #[test]
    fn row_threshold_adds_checkpoints_between_the_forced_ones() {
        let h = Harness::new(
            ExportConfig::default().with_progress_intervals(10, Duration::from_secs(60 * 60)),
        );
        let id = h.service.submit_async(&request("ledger"), &alice()).unwrap();

        let task = h.wait_terminal(id);
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.processed_rows, Some(25));
        // start, 10 rows, 20 rows, end
        assert_eq!(h.store.checkpoints(id), 4);
        h.service.shutdown();
    }

    #[test]
    fn unrepresentable_retention_falls_back_to_seven_days() {
        let h = Harness::new(ExportConfig::default().with_expire_after(Duration::from_secs(u64::MAX)));
        let id = h.service.submit_async(&request("nope"), &alice()).unwrap();

        let task = h.task(id);
        assert_eq!(task.expire_at - task.created_at, chrono::Duration::days(7));
    }

    #[test]
    fn panicking_export_is_recorded_and_releases_its_slot() {
        let h = Harness::new(ExportConfig::default().with_max_system_concurrent(1));
        let id = h.service.submit_async(&request("panics"), &alice()).unwrap();

        let task = h.wait_terminal(id);
        assert_eq!(failure_code(&task), ErrorCode::Panicked);
        assert!(task.error.unwrap().message.contains("provider exploded"));
        assert_eq!(h.service.admission().running_count(), 0);

        let next = h.service.submit_async(&request("users"), &alice()).unwrap();
        assert_eq!(h.wait_terminal(next).status, TaskStatus::Success);
        h.service.shutdown();
    }

    #[test]
    fn sync_export_writes_rows_and_summary_without_a_task() {
        let h = Harness::new(ExportConfig::default());
        let mut out = Vec::new();
        h.service
            .export_sync(&summed_users(), &mut out, &alice())
            .unwrap();

        let written = lines(&out);
        assert_eq!(of_type(&written, "row").len(), 2);
        assert_eq!(of_type(&written, "summary")[0]["cells"], json!(["total", "", 25]));
        assert!(h.store.list_all().unwrap().is_empty());
        assert_eq!(h.service.admission().running_count(), 0);
    }

    #[test]
    fn sync_export_goes_through_admission() {
        let h = Harness::new(ExportConfig::default().with_max_system_concurrent(1));
        let running = h.service.submit_async(&request("gated"), &alice()).unwrap();
        h.wait_started();

        let err = h
            .service
            .export_sync(&summed_users(), &mut Vec::new(), &OwnerId::new("bob"))
            .unwrap_err();
        assert!(matches!(err, ExportError::Admission(_)));
        assert_eq!(err.code(), ErrorCode::SystemSaturated);

        h.release(1);
        h.wait_terminal(running);
        h.service.shutdown();
    }

    #[test]
    fn recovery_resets_stale_running_task_and_resumes_it() {
        let h = Harness::new(ExportConfig::default());
        let id = h.seed("alice", &request("users"), |_| {});
        let stalled = WorkerId::new();
        h.store.claim_pending(id, stalled, h.clock.now()).unwrap().unwrap();

        h.clock.advance(Duration::from_secs(10 * 60));
        let report = h.service.recover().unwrap();
        assert_eq!(report.reset, vec![id]);
        assert_eq!(report.resumed, vec![id]);

        let task = h.wait_terminal(id);
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.attempt, 2);
        assert!(task.worker_id.is_some());
        assert_ne!(task.worker_id, Some(stalled));
        h.service.shutdown();
    }

    #[test]
    fn recovery_leaves_live_running_tasks_alone() {
        let h = Harness::new(ExportConfig::default());
        let id = h.seed("alice", &request("users"), |_| {});
        h.store
            .claim_pending(id, WorkerId::new(), h.clock.now())
            .unwrap()
            .unwrap();

        h.clock.advance(Duration::from_secs(60));
        let report = h.service.recover().unwrap();
        assert!(report.reset.is_empty());
        assert!(report.resumed.is_empty());
        assert_eq!(h.task(id).status, TaskStatus::Running);
    }

    #[test]
    fn recovery_fails_tasks_it_cannot_resume() {
        let h = Harness::new(ExportConfig::default().with_max_attempts(3));
        let exhausted = h.seed("alice", &request("users"), |t| t.attempt = 3);
        let missing = h.seed("alice", &request("users"), |t| t.request = None);
        let garbled = h.seed("alice", &request("users"), |t| {
            t.request = Some("{not json".to_string())
        });
        let unresolvable = h.seed("alice", &request("gone"), |_| {});

        let report = h.service.recover().unwrap();
        assert_eq!(report.failed.len(), 4);
        assert!(report.resumed.is_empty());

        assert_eq!(failure_code(&h.task(exhausted)), ErrorCode::RetryExceeded);
        assert_eq!(failure_code(&h.task(missing)), ErrorCode::RecoveryMissingRequest);
        assert_eq!(failure_code(&h.task(garbled)), ErrorCode::RecoveryMissingRequest);
        assert_eq!(failure_code(&h.task(unresolvable)), ErrorCode::RecoveryError);
    }

    #[test]
    fn recovery_twice_does_not_enqueue_twice() {
        let h = Harness::new(ExportConfig::default().with_worker_threads(1));
        let running = h.service.submit_async(&request("gated"), &alice()).unwrap();
        h.wait_started();
        let pending = h.seed("alice", &request("users"), |_| {});

        let first = h.service.recover().unwrap();
        assert_eq!(first.resumed, vec![pending]);
        let second = h.service.recover().unwrap();
        assert!(second.resumed.is_empty());
        assert_eq!(second.skipped, vec![pending]);
        assert_eq!(h.service.queue_depth(), 1);

        h.release(1);
        h.wait_terminal(running);
        let task = h.wait_terminal(pending);
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.attempt, 1);
        h.service.shutdown();
    }

    #[test]
    fn canceled_queued_task_never_runs() {
        let h = Harness::new(ExportConfig::default().with_worker_threads(1));
        let running = h.service.submit_async(&request("gated"), &alice()).unwrap();
        h.wait_started();
        let queued = h.service.submit_async(&request("users"), &alice()).unwrap();

        assert_eq!(h.service.cancel(queued).unwrap().status, TaskStatus::Canceled);
        h.release(1);
        h.wait_terminal(running);
        h.service.shutdown();

        let task = h.task(queued);
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.attempt, 0);
        assert!(task.artifact_path.is_none());
    }

    #[test]
    fn canceled_running_task_keeps_canceled_status() {
        let h = Harness::new(ExportConfig::default());
        let id = h.service.submit_async(&request("gated"), &alice()).unwrap();
        h.wait_started();
        h.wait_running(id);

        h.service.cancel(id).unwrap();
        h.release(1);
        h.service.shutdown();

        assert_eq!(h.task(id).status, TaskStatus::Canceled);
        assert!(matches!(
            h.service.cancel(id),
            Err(TaskStoreError::InvalidTransition(_))
        ));
    }

    #[test]
    fn artifact_access_is_limited_to_owner_and_admins() {
        let h = Harness::new(ExportConfig::default());
        let id = h.service.submit_async(&request("users"), &alice()).unwrap();
        h.wait_terminal(id);

        let bob = OwnerId::new("bob");
        assert!(h.service.artifact(id, &alice(), false).is_ok());
        assert!(h.service.artifact(id, &bob, true).is_ok());
        assert!(matches!(
            h.service.artifact(id, &bob, false),
            Err(ArtifactError::Forbidden(_))
        ));
        assert!(matches!(
            h.service.artifact(TaskId::new(), &alice(), true),
            Err(ArtifactError::NotFound(_))
        ));

        let failed = h.service.submit_async(&request("nope"), &alice()).unwrap();
        assert!(matches!(
            h.service.artifact(failed, &alice(), false),
            Err(ArtifactError::NotReady { status: TaskStatus::Failed, .. })
        ));
        h.service.shutdown();
    }

    #[test]
    fn cleanup_removes_expired_tasks_and_their_artifacts() {
        let h = Harness::new(ExportConfig::default());
        let id = h.service.submit_async(&request("users"), &alice()).unwrap();
        h.wait_terminal(id);
        let path = h.service.artifact(id, &alice(), false).unwrap();

        assert_eq!(h.service.cleanup_expired().unwrap(), 0);
        h.clock.advance(Duration::from_secs(8 * 24 * 60 * 60));
        assert_eq!(h.service.cleanup_expired().unwrap(), 1);

        assert!(!path.exists());
        assert!(h.store.get(id).unwrap().is_none());
        h.service.shutdown();
    }

    #[test]
    fn owners_see_their_own_tasks_newest_first() {
        let h = Harness::new(ExportConfig::default());
        let first = h.service.submit_async(&request("nope"), &alice()).unwrap();
        h.clock.advance(Duration::from_secs(1));
        let second = h.service.submit_async(&request("nope"), &alice()).unwrap();
        h.service
            .submit_async(&request("nope"), &OwnerId::new("bob"))
            .unwrap();

        let ids: Vec<_> = h
            .service
            .tasks_for_owner(&alice())
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![second, first]);
        assert_eq!(h.service.all_tasks().unwrap().len(), 3);
    }
}
