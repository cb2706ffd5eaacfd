//! Export error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the export engine.
pub type ExportResult<T> = Result<T, ExportError>;

/// Stable, persisted classification of a failure.
///
/// This is what a FAILED task records as its error code, so the string forms are part
/// of the storage format and must not change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    UnknownProvider,
    UnknownAggregator,
    SystemSaturated,
    OwnerSaturated,
    QueueSaturated,
    Rejected,
    SourceFailure,
    WriterFailure,
    Io,
    Store,
    Serialization,
    RetryExceeded,
    RecoveryMissingRequest,
    RecoveryError,
    Panicked,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::UnknownProvider => "UNKNOWN_PROVIDER",
            ErrorCode::UnknownAggregator => "UNKNOWN_AGGREGATOR",
            ErrorCode::SystemSaturated => "SYSTEM_SATURATED",
            ErrorCode::OwnerSaturated => "OWNER_SATURATED",
            ErrorCode::QueueSaturated => "QUEUE_SATURATED",
            ErrorCode::Rejected => "REJECTED",
            ErrorCode::SourceFailure => "SOURCE_FAILURE",
            ErrorCode::WriterFailure => "WRITER_FAILURE",
            ErrorCode::Io => "IO",
            ErrorCode::Store => "STORE",
            ErrorCode::Serialization => "SERIALIZATION",
            ErrorCode::RetryExceeded => "RETRY_EXCEEDED",
            ErrorCode::RecoveryMissingRequest => "RECOVERY_MISSING_REQUEST",
            ErrorCode::RecoveryError => "RECOVERY_ERROR",
            ErrorCode::Panicked => "PANICKED",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        let code = match s {
            "VALIDATION" => ErrorCode::Validation,
            "UNKNOWN_PROVIDER" => ErrorCode::UnknownProvider,
            "UNKNOWN_AGGREGATOR" => ErrorCode::UnknownAggregator,
            "SYSTEM_SATURATED" => ErrorCode::SystemSaturated,
            "OWNER_SATURATED" => ErrorCode::OwnerSaturated,
            "QUEUE_SATURATED" => ErrorCode::QueueSaturated,
            "REJECTED" => ErrorCode::Rejected,
            "SOURCE_FAILURE" => ErrorCode::SourceFailure,
            "WRITER_FAILURE" => ErrorCode::WriterFailure,
            "IO" => ErrorCode::Io,
            "STORE" => ErrorCode::Store,
            "SERIALIZATION" => ErrorCode::Serialization,
            "RETRY_EXCEEDED" => ErrorCode::RetryExceeded,
            "RECOVERY_MISSING_REQUEST" => ErrorCode::RecoveryMissingRequest,
            "RECOVERY_ERROR" => ErrorCode::RecoveryError,
            "PANICKED" => ErrorCode::Panicked,
            _ => return None,
        };
        Some(code)
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the admission gate refused to start a job.
///
/// Never retried automatically; surfaced to the submitter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionRejection {
    #[error("too many exports running system-wide ({running}/{max}), try again later")]
    SystemSaturated { running: usize, max: usize },

    #[error("owner {owner} already has {running}/{max} exports running, try again later")]
    OwnerSaturated {
        owner: String,
        running: usize,
        max: usize,
    },
}

impl AdmissionRejection {
    pub fn code(&self) -> ErrorCode {
        match self {
            AdmissionRejection::SystemSaturated { .. } => ErrorCode::SystemSaturated,
            AdmissionRejection::OwnerSaturated { .. } => ErrorCode::OwnerSaturated,
        }
    }
}

/// Engine-wide export error.
///
/// Covers validation, admission, execution and infrastructure failures. Use
/// [`ExportError::code`] for the persisted classification.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The request is structurally invalid (no sheets, no columns, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A sheet references a provider key nobody registered.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// A sheet references an aggregator key nobody registered.
    #[error("unknown aggregator: {0}")]
    UnknownAggregator(String),

    #[error(transparent)]
    Admission(#[from] AdmissionRejection),

    /// A row source failed while fetching or iterating.
    #[error("row source `{provider}` failed: {message}")]
    Source { provider: String, message: String },

    #[error("sheet writer failed: {0}")]
    Writer(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ExportError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn source_failure(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Source {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    pub fn writer(msg: impl Into<String>) -> Self {
        Self::Writer(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ExportError::Validation(_) => ErrorCode::Validation,
            ExportError::UnknownProvider(_) => ErrorCode::UnknownProvider,
            ExportError::UnknownAggregator(_) => ErrorCode::UnknownAggregator,
            ExportError::Admission(r) => r.code(),
            ExportError::Source { .. } => ErrorCode::SourceFailure,
            ExportError::Writer(_) => ErrorCode::WriterFailure,
            ExportError::Io(_) => ErrorCode::Io,
            ExportError::Store(_) => ErrorCode::Store,
            ExportError::Serialization(_) => ErrorCode::Serialization,
        }
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_errors_keep_their_rejection_code() {
        let err: ExportError = AdmissionRejection::OwnerSaturated {
            owner: "alice".into(),
            running: 3,
            max: 3,
        }
        .into();
        assert_eq!(err.code(), ErrorCode::OwnerSaturated);
        assert!(err.to_string().contains("alice"));
    }

    #[test]
    fn codes_parse_back_from_their_persisted_form() {
        for code in [
            ErrorCode::QueueSaturated,
            ErrorCode::Rejected,
            ErrorCode::RetryExceeded,
            ErrorCode::RecoveryMissingRequest,
            ErrorCode::Panicked,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("NOPE"), None);
    }

    #[test]
    fn serde_form_matches_as_str() {
        let json = serde_json::to_string(&ErrorCode::SystemSaturated).unwrap();
        assert_eq!(json, "\"SYSTEM_SATURATED\"");
    }
}
