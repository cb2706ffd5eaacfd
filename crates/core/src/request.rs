//! Export request model.
//!
//! A request is immutable once submitted; asynchronous tasks persist it as JSON and
//! crash recovery deserializes an equivalent copy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ExportError, ExportResult};

/// Opaque business filters handed to a provider.
pub type Filters = BTreeMap<String, JsonValue>;

fn default_page_size() -> usize {
    5000
}

/// A multi-sheet export request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    /// Output file name without extension.
    #[serde(default)]
    pub file_name: Option<String>,

    #[serde(rename = "async", default)]
    pub is_async: bool,

    /// Batch size handed to row sources. `0` means "use the engine default".
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    pub sheets: Vec<SheetSpec>,
}

impl ExportRequest {
    pub fn new(sheets: Vec<SheetSpec>) -> Self {
        Self {
            file_name: None,
            is_async: false,
            page_size: default_page_size(),
            sheets,
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// Structural checks that do not need any registry: at least one sheet, every
    /// sheet names a provider and declares at least one column.
    pub fn validate(&self) -> ExportResult<()> {
        if self.sheets.is_empty() {
            return Err(ExportError::validation(
                "sheets must not be empty, at least one sheet is required",
            ));
        }
        for (index, sheet) in self.sheets.iter().enumerate() {
            if sheet.provider.trim().is_empty() {
                return Err(ExportError::validation(format!(
                    "sheet #{index} has no provider key"
                )));
            }
            if sheet.columns.is_empty() {
                return Err(ExportError::validation(format!(
                    "sheet {} has no columns",
                    sheet.display_name()
                )));
            }
        }
        Ok(())
    }
}

/// Configuration of one output sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetSpec {
    #[serde(default)]
    pub sheet_name: Option<String>,

    /// Key of the registered provider that produces this sheet's rows.
    pub provider: String,

    #[serde(default)]
    pub filters: Filters,

    #[serde(default)]
    pub columns: Vec<ColumnNode>,

    #[serde(default)]
    pub aggregate_key: Option<String>,

    #[serde(default)]
    pub options: BTreeMap<String, JsonValue>,
}

impl SheetSpec {
    pub fn new(provider: impl Into<String>, columns: Vec<ColumnNode>) -> Self {
        Self {
            sheet_name: None,
            provider: provider.into(),
            filters: Filters::new(),
            columns,
            aggregate_key: None,
            options: BTreeMap::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.sheet_name = Some(name.into());
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.filters.insert(key.into(), value);
        self
    }

    pub fn with_aggregate(mut self, key: impl Into<String>) -> Self {
        self.aggregate_key = Some(key.into());
        self
    }

    /// Sheet name, falling back to the provider key.
    pub fn display_name(&self) -> &str {
        self.sheet_name.as_deref().unwrap_or(&self.provider)
    }
}

/// A node of the (possibly multi-level) column header tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnNode {
    #[serde(default)]
    pub title: String,

    /// Record field rendered in this column. Only meaningful on leaves.
    #[serde(default)]
    pub field: Option<String>,

    #[serde(default)]
    pub children: Vec<ColumnNode>,

    /// Free-form hints for writers (number format, width, ...).
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl ColumnNode {
    pub fn leaf(title: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            field: Some(field.into()),
            children: Vec::new(),
            meta: BTreeMap::new(),
        }
    }

    pub fn group(title: impl Into<String>, children: Vec<ColumnNode>) -> Self {
        Self {
            title: title.into(),
            field: None,
            children,
            meta: BTreeMap::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty() && self.field.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn one_sheet() -> ExportRequest {
        ExportRequest::new(vec![SheetSpec::new(
            "users",
            vec![ColumnNode::leaf("Name", "name")],
        )])
    }

    #[test]
    fn empty_sheet_list_is_rejected() {
        let err = ExportRequest::new(vec![]).validate().unwrap_err();
        assert!(matches!(err, ExportError::Validation(_)));
    }

    #[test]
    fn sheet_without_columns_is_rejected() {
        let req = ExportRequest::new(vec![SheetSpec::new("users", vec![])]);
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("users"));
    }

    #[test]
    fn valid_request_passes() {
        assert!(one_sheet().validate().is_ok());
    }

    #[test]
    fn json_defaults_fill_optional_fields() {
        let req: ExportRequest = serde_json::from_value(json!({
            "sheets": [{ "provider": "users", "columns": [{ "title": "Id", "field": "id" }] }]
        }))
        .unwrap();

        assert_eq!(req.page_size, 5000);
        assert!(!req.is_async);
        assert!(req.sheets[0].filters.is_empty());
        assert!(req.sheets[0].columns[0].is_leaf());
    }

    #[test]
    fn display_name_falls_back_to_provider() {
        let sheet = SheetSpec::new("orders", vec![]);
        assert_eq!(sheet.display_name(), "orders");
        assert_eq!(sheet.named("Q1 orders").display_name(), "Q1 orders");
    }

    #[test]
    fn persisted_form_is_an_equivalent_copy() {
        let req = one_sheet()
            .with_file_name("users")
            .asynchronous();
        let text = serde_json::to_string(&req).unwrap();
        let back: ExportRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back, req);
    }
}
