//! `reportforge-core`: export engine building blocks.
//!
//! This crate contains **pure** primitives shared by the sheet builder and the job
//! engine: identifiers, the export request model and the error taxonomy. No I/O.

pub mod error;
pub mod id;
pub mod request;

pub use error::{AdmissionRejection, ErrorCode, ExportError, ExportResult};
pub use id::{OwnerId, SlotId, TaskId, WorkerId};
pub use request::{ColumnNode, ExportRequest, Filters, SheetSpec};
