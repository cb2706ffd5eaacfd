//! Export engine configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Upper bound for retention; comfortably inside the `chrono` timestamp range.
pub const MAX_EXPIRE_DAYS: u64 = 100 * 365;

/// Tunables for admission, the worker pool, recovery and progress checkpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportConfig {
    /// Maximum exports running at once across the process.
    pub max_system_concurrent: usize,
    /// Maximum exports running at once for a single owner.
    pub max_owner_concurrent: usize,
    pub worker_threads: usize,
    /// Bounded queue in front of the worker threads.
    pub queue_capacity: usize,
    /// Queue depth above which new async tasks fail fast with `QUEUE_SATURATED`.
    pub queue_reject_threshold: usize,
    /// Batch size used when a request asks for page size `0`.
    pub default_page_size: usize,
    /// Task retention after creation.
    pub expire_after: Duration,
    /// A RUNNING task silent for longer than this is considered dead.
    pub heartbeat_timeout: Duration,
    /// Recovery stops resubmitting a task once it has run this many times.
    pub max_attempts: u32,
    pub progress_row_interval: u64,
    pub progress_time_interval: Duration,
    pub artifact_dir: PathBuf,
    /// Download references are `{download_prefix}/{task_id}/download`.
    pub download_prefix: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_system_concurrent: 10,
            max_owner_concurrent: 3,
            worker_threads: 8,
            queue_capacity: 1000,
            queue_reject_threshold: 900,
            default_page_size: 1000,
            expire_after: Duration::from_secs(7 * 24 * 60 * 60),
            heartbeat_timeout: Duration::from_secs(5 * 60),
            max_attempts: 3,
            progress_row_interval: 1000,
            progress_time_interval: Duration::from_millis(5000),
            artifact_dir: std::env::temp_dir().join("reportforge"),
            download_prefix: "/export/task".to_string(),
        }
    }
}

impl ExportConfig {
    /// Defaults overridden by `REPORTFORGE_*` environment variables.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_parse("REPORTFORGE_MAX_SYSTEM_CONCURRENT") {
            cfg.max_system_concurrent = v;
        }
        if let Some(v) = env_parse("REPORTFORGE_MAX_OWNER_CONCURRENT") {
            cfg.max_owner_concurrent = v;
        }
        if let Some(v) = env_parse("REPORTFORGE_WORKER_THREADS") {
            cfg.worker_threads = v;
        }
        if let Some(v) = env_parse("REPORTFORGE_QUEUE_CAPACITY") {
            cfg.queue_capacity = v;
        }
        if let Some(v) = env_parse("REPORTFORGE_QUEUE_REJECT_THRESHOLD") {
            cfg.queue_reject_threshold = v;
        }
        if let Some(v) = env_parse("REPORTFORGE_DEFAULT_PAGE_SIZE") {
            cfg.default_page_size = v;
        }
        if let Some(days) = env_parse::<u64>("REPORTFORGE_EXPIRE_DAYS") {
            match expire_after_days(days) {
                Some(expire_after) => cfg.expire_after = expire_after,
                None => tracing::warn!(
                    key = "REPORTFORGE_EXPIRE_DAYS",
                    value = days,
                    "ignoring out-of-range configuration value"
                ),
            }
        }
        if let Some(secs) = env_parse("REPORTFORGE_HEARTBEAT_TIMEOUT_SECS") {
            cfg.heartbeat_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = env_parse("REPORTFORGE_MAX_ATTEMPTS") {
            cfg.max_attempts = v;
        }
        if let Some(v) = env_parse("REPORTFORGE_PROGRESS_ROW_INTERVAL") {
            cfg.progress_row_interval = v;
        }
        if let Some(ms) = env_parse("REPORTFORGE_PROGRESS_TIME_INTERVAL_MS") {
            cfg.progress_time_interval = Duration::from_millis(ms);
        }
        if let Ok(dir) = std::env::var("REPORTFORGE_ARTIFACT_DIR") {
            cfg.artifact_dir = PathBuf::from(dir);
        }
        if let Ok(prefix) = std::env::var("REPORTFORGE_DOWNLOAD_PREFIX") {
            cfg.download_prefix = prefix.trim_end_matches('/').to_string();
        }

        cfg
    }

    pub fn with_max_system_concurrent(mut self, max: usize) -> Self {
        self.max_system_concurrent = max;
        self
    }

    pub fn with_max_owner_concurrent(mut self, max: usize) -> Self {
        self.max_owner_concurrent = max;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_queue_reject_threshold(mut self, threshold: usize) -> Self {
        self.queue_reject_threshold = threshold;
        self
    }

    pub fn with_default_page_size(mut self, page_size: usize) -> Self {
        self.default_page_size = page_size;
        self
    }

    pub fn with_expire_after(mut self, expire_after: Duration) -> Self {
        self.expire_after = expire_after;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_progress_intervals(mut self, rows: u64, time: Duration) -> Self {
        self.progress_row_interval = rows;
        self.progress_time_interval = time;
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    pub fn with_download_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.download_prefix = prefix.into();
        self
    }
}

/// Retention of `days`, or `None` past [`MAX_EXPIRE_DAYS`].
fn expire_after_days(days: u64) -> Option<Duration> {
    if days > MAX_EXPIRE_DAYS {
        return None;
    }
    days.checked_mul(SECS_PER_DAY).map(Duration::from_secs)
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}
