//! Top-of-sheet annotation rows.

use chrono::{DateTime, SecondsFormat, Utc};

use reportforge_core::ExportRequest;

/// Supplies annotation rows written above a sheet's header.
///
/// Implementations must be pure: the builder calls `rows` once per sheet and passes the
/// result through verbatim.
pub trait TopInfoDecorator: Send + Sync {
    fn rows(&self, request: &ExportRequest, provider_key: &str) -> Vec<Vec<String>>;
}

/// No annotation rows.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoTopInfo;

impl TopInfoDecorator for NoTopInfo {
    fn rows(&self, _request: &ExportRequest, _provider_key: &str) -> Vec<Vec<String>> {
        Vec::new()
    }
}

/// Exporter identity plus a fixed generation timestamp.
#[derive(Debug, Clone)]
pub struct ExporterInfo {
    exporter: String,
    generated_at: DateTime<Utc>,
}

impl ExporterInfo {
    pub fn new(exporter: impl Into<String>, generated_at: DateTime<Utc>) -> Self {
        Self {
            exporter: exporter.into(),
            generated_at,
        }
    }

    /// Stamped with the current time.
    pub fn now(exporter: impl Into<String>) -> Self {
        Self::new(exporter, Utc::now())
    }
}

impl TopInfoDecorator for ExporterInfo {
    fn rows(&self, request: &ExportRequest, provider_key: &str) -> Vec<Vec<String>> {
        let mut rows = vec![
            vec!["Exported by".to_string(), self.exporter.clone()],
            vec![
                "Generated at".to_string(),
                self.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ],
        ];
        if let Some(name) = &request.file_name {
            rows.push(vec!["Report".to_string(), name.clone()]);
        }
        rows.push(vec!["Source".to_string(), provider_key.to_string()]);
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn exporter_info_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let info = ExporterInfo::new("alice", at);
        let request = ExportRequest::new(vec![]).with_file_name("users");

        let rows = info.rows(&request, "users");
        assert_eq!(rows, info.rows(&request, "users"));
        assert_eq!(rows[0], vec!["Exported by", "alice"]);
        assert_eq!(rows[1], vec!["Generated at", "2024-03-01T12:00:00Z"]);
        assert_eq!(rows.last().unwrap(), &vec!["Source".to_string(), "users".to_string()]);
    }

    #[test]
    fn no_top_info_is_empty() {
        assert!(NoTopInfo.rows(&ExportRequest::new(vec![]), "x").is_empty());
    }
}
