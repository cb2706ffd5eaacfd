//! Process-wide log setup shared by every binary.
//!
//! Export phases are emitted as structured `tracing` events (`phase`, `task_id`,
//! `owner`, durations, error codes); this crate decides how they are rendered.

pub mod tracing;

pub use self::tracing::{LogFormat, init, init_with, init_with_filter};
