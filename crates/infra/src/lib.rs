//! Infrastructure layer: task persistence, admission control, worker pool, config.
//!
//! [`ExportService`] is the entry point. It owns the worker pool and the admission
//! controller, and drives tasks through the [`TaskStore`] it is given.

pub mod config;
pub mod export;
pub mod jobs;

pub use config::ExportConfig;
pub use export::{ArtifactError, DispatchOutcome, ExportService, RecoveryCoordinator, RecoveryReport};
pub use jobs::{
    AdmissionController, AdmissionLimits, Clock, ExportTask, InMemoryTaskStore, ManualClock,
    PostgresTaskStore, SystemClock, TaskFailure, TaskStatus, TaskStore, TaskStoreError,
};

#[cfg(test)]
mod integration_tests;
