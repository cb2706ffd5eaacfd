//! Durable export tasks and the machinery that runs them.
//!
//! ## Components
//!
//! - `ExportTask`: durable task record and its guarded lifecycle transitions
//! - `TaskStore`: persistence for tasks (in-memory or Postgres)
//! - `AdmissionController`: in-memory system-wide and per-owner concurrency caps
//! - `ProgressReporter`: throttled progress and heartbeat checkpoints
//! - `WorkerPool`: bounded thread pool executing job bodies
//! - `Clock`: injectable time source

pub mod admission;
pub mod clock;
pub mod executor;
pub mod postgres;
pub mod progress;
pub mod store;
pub mod types;

pub use admission::{AdmissionController, AdmissionLimits, AdmissionPermit, RuntimeSlot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use executor::{Job, PoolRejected, WorkerPool};
pub use postgres::PostgresTaskStore;
pub use progress::ProgressReporter;
pub use store::{InMemoryTaskStore, TaskMutator, TaskStore, TaskStoreError};
pub use types::{ExportTask, TaskFailure, TaskStatus, TransitionError};
