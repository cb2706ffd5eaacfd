//! Throttled progress checkpoints.
//!
//! Rows are counted in memory on every increment. The task record is written only when
//! the count has advanced by `row_interval` rows or `time_interval` has passed since the
//! last write, whichever comes first. Forced flushes (job start and end) skip both
//! thresholds. Every write also refreshes the task heartbeat and is accepted only while
//! the reporting worker still owns the task.
//!
//! Checkpoints are driven by rows, so the heartbeat stands still while a provider blocks
//! inside a single page fetch. A fetch that outlasts the heartbeat timeout makes a live
//! task look stale to recovery; once re-claimed elsewhere, this reporter's writes are
//! rejected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use reportforge_core::{TaskId, WorkerId};
use reportforge_report::ProgressSink;

use super::clock::Clock;
use super::store::{TaskStore, TaskStoreError};

#[derive(Debug, Copy, Clone)]
struct FlushMark {
    rows: u64,
    at: DateTime<Utc>,
}

pub struct ProgressReporter {
    store: Arc<dyn TaskStore>,
    task_id: TaskId,
    worker: WorkerId,
    total: Option<u64>,
    processed: AtomicU64,
    last_flush: Mutex<FlushMark>,
    flushes: AtomicU64,
    clock: Arc<dyn Clock>,
    row_interval: u64,
    time_interval: chrono::Duration,
}

impl ProgressReporter {
    /// `total` is the up-front row estimate; `None` leaves the percentage unset.
    pub fn new(
        store: Arc<dyn TaskStore>,
        task_id: TaskId,
        worker: WorkerId,
        total: Option<u64>,
        clock: Arc<dyn Clock>,
        row_interval: u64,
        time_interval: Duration,
    ) -> Self {
        let now = clock.now();
        Self {
            store,
            task_id,
            worker,
            total: total.filter(|t| *t > 0),
            processed: AtomicU64::new(0),
            last_flush: Mutex::new(FlushMark { rows: 0, at: now }),
            flushes: AtomicU64::new(0),
            clock,
            row_interval: row_interval.max(1),
            time_interval: chrono::Duration::from_std(time_interval)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Number of writes made to the task store so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Acquire)
    }

    /// `min(99, processed * 100 / total)`; completion alone sets 100.
    pub fn percent(&self, processed: u64) -> Option<u8> {
        self.total
            .map(|total| (processed.saturating_mul(100) / total).min(99) as u8)
    }

    /// Write a checkpoint if one is due, or unconditionally when `force` is set.
    ///
    /// Returns whether the task record was written.
    pub fn flush(&self, force: bool) -> Result<bool, TaskStoreError> {
        let mut mark = self.last_flush.lock().unwrap_or_else(PoisonError::into_inner);
        let processed = self.processed();
        let now = self.clock.now();

        let due = processed.saturating_sub(mark.rows) >= self.row_interval
            || now - mark.at >= self.time_interval;
        if !force && !due {
            return Ok(false);
        }

        let total = self.total;
        let percent = self.percent(processed);
        let worker = self.worker;
        self.store.update(self.task_id, &mut |task| {
            task.record_progress(worker, processed, total, percent, now)
        })?;

        *mark = FlushMark {
            rows: processed,
            at: now,
        };
        self.flushes.fetch_add(1, Ordering::AcqRel);

        tracing::debug!(
            task_id = %self.task_id,
            processed_rows = processed,
            total_rows = ?total,
            progress = ?percent,
            forced = force,
            "progress checkpoint"
        );
        Ok(true)
    }
}

impl ProgressSink for ProgressReporter {
    fn increment(&self, rows: u64) {
        self.processed.fetch_add(rows, Ordering::AcqRel);
        if let Err(err) = self.flush(false) {
            tracing::warn!(
                task_id = %self.task_id,
                error = %err,
                "progress checkpoint rejected"
            );
        }
    }
}

impl core::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("task_id", &self.task_id)
            .field("worker", &self.worker)
            .field("total", &self.total)
            .field("processed", &self.processed())
            .field("flushes", &self.flush_count())
            .finish_non_exhaustive()
    }
}
