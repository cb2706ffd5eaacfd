//! Export entry points: synchronous exports, asynchronous tasks and crash recovery.

pub mod recovery;
pub mod service;

pub use recovery::{RecoveryCoordinator, RecoveryReport};
pub use service::{ArtifactError, DispatchOutcome, ExportService};
