//! Row sources and the providers that scope them.
//!
//! A [`Provider`] is registered once under a key and shared by every export. Per export
//! it hands out a [`RowSource`] already bound to that sheet's filters, so no filter state
//! ever lives on the shared provider or on the worker thread.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use reportforge_core::{ExportError, ExportResult, Filters};

use crate::record::Record;

/// Forward-only, lazily produced sequence of records.
pub type RowStream = Box<dyn Iterator<Item = ExportResult<Record>> + Send>;

/// Rows for one sheet, already scoped to that sheet's filters.
pub trait RowSource: Send {
    /// Start streaming records, fetching upstream in batches of `batch_size`.
    ///
    /// Every call starts a fresh sequence.
    fn fetch(&self, batch_size: usize) -> ExportResult<RowStream>;

    /// Estimated number of records; negative means unknown.
    fn estimate_total(&self) -> i64 {
        -1
    }
}

/// Pluggable supplier of rows, registered by key.
pub trait Provider: Send + Sync {
    /// Produce a row source bound to `filters`.
    fn with_filters(&self, filters: &Filters) -> ExportResult<Box<dyn RowSource>>;
}

/// Provider lookup by key.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, provider: impl Provider + 'static) {
        self.providers.insert(key.into(), Arc::new(provider));
    }

    pub fn with(mut self, key: impl Into<String>, provider: impl Provider + 'static) -> Self {
        self.register(key, provider);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.providers.contains_key(key)
    }

    pub fn resolve(&self, key: &str) -> ExportResult<Arc<dyn Provider>> {
        self.providers
            .get(key)
            .cloned()
            .ok_or_else(|| ExportError::UnknownProvider(key.to_string()))
    }
}

impl core::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut keys: Vec<_> = self.providers.keys().collect();
        keys.sort();
        f.debug_struct("ProviderRegistry").field("keys", &keys).finish()
    }
}

/// Row source pulling `(offset, limit)` pages from a fetch function.
///
/// Holds at most one page in memory. A page shorter than the limit (or empty) ends the
/// stream; a failing page ends it after yielding the error.
pub struct PagedRowSource<F> {
    fetch_page: Arc<F>,
    total: i64,
}

impl<F> PagedRowSource<F>
where
    F: Fn(usize, usize) -> ExportResult<Vec<Record>> + Send + Sync + 'static,
{
    pub fn new(fetch_page: F) -> Self {
        Self {
            fetch_page: Arc::new(fetch_page),
            total: -1,
        }
    }

    pub fn with_total(mut self, total: i64) -> Self {
        self.total = total;
        self
    }
}

impl<F> RowSource for PagedRowSource<F>
where
    F: Fn(usize, usize) -> ExportResult<Vec<Record>> + Send + Sync + 'static,
{
    fn fetch(&self, batch_size: usize) -> ExportResult<RowStream> {
        Ok(Box::new(Pages {
            fetch_page: self.fetch_page.clone(),
            offset: 0,
            limit: batch_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }

    fn estimate_total(&self) -> i64 {
        self.total
    }
}

struct Pages<F> {
    fetch_page: Arc<F>,
    offset: usize,
    limit: usize,
    buffer: VecDeque<Record>,
    exhausted: bool,
}

impl<F> Iterator for Pages<F>
where
    F: Fn(usize, usize) -> ExportResult<Vec<Record>>,
{
    type Item = ExportResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match (self.fetch_page)(self.offset, self.limit) {
                Ok(page) => {
                    if page.len() < self.limit {
                        self.exhausted = true;
                    }
                    self.offset += page.len();
                    self.buffer.extend(page);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Provider over a fixed set of key/value rows.
///
/// Filters match by equality on the named field (string filters are trimmed; `null` and
/// empty-string filters are ignored). Keys starting with `__` are control keys:
/// `__mode = "page"` together with `__page` (1-based) and `__pageSize` exports a single
/// page instead of every matching row.
#[derive(Debug, Clone)]
pub struct InMemoryProvider {
    name: String,
    rows: Arc<Vec<Map<String, JsonValue>>>,
}

impl InMemoryProvider {
    pub fn new(name: impl Into<String>, rows: Vec<Map<String, JsonValue>>) -> Self {
        Self {
            name: name.into(),
            rows: Arc::new(rows),
        }
    }

    /// Build from JSON objects; non-object values are skipped.
    pub fn from_json(name: impl Into<String>, rows: Vec<JsonValue>) -> Self {
        let rows = rows
            .into_iter()
            .filter_map(|v| match v {
                JsonValue::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        Self::new(name, rows)
    }
}

impl Provider for InMemoryProvider {
    fn with_filters(&self, filters: &Filters) -> ExportResult<Box<dyn RowSource>> {
        let matching: Vec<_> = self
            .rows
            .iter()
            .filter(|row| {
                filters
                    .iter()
                    .filter(|(key, _)| !key.starts_with("__"))
                    .all(|(key, expected)| field_matches(row.get(key), expected))
            })
            .cloned()
            .collect();

        let page = match filters.get("__mode").and_then(JsonValue::as_str) {
            Some("page") => Some(PageSelector {
                page: parse_usize(filters.get("__page")).filter(|p| *p > 0).unwrap_or(1),
                page_size: parse_usize(filters.get("__pageSize")).filter(|s| *s > 0),
            }),
            _ => None,
        };

        tracing::debug!(
            provider = %self.name,
            matching = matching.len(),
            page_mode = page.is_some(),
            "in-memory row source scoped"
        );

        Ok(Box::new(InMemorySource {
            rows: Arc::new(matching),
            page,
        }))
    }
}

#[derive(Debug, Copy, Clone)]
struct PageSelector {
    page: usize,
    page_size: Option<usize>,
}

struct InMemorySource {
    rows: Arc<Vec<Map<String, JsonValue>>>,
    page: Option<PageSelector>,
}

impl InMemorySource {
    fn window(&self, batch_size: usize) -> (usize, usize) {
        match self.page {
            Some(sel) => {
                let size = sel.page_size.unwrap_or(batch_size).max(1);
                let start = (sel.page - 1).saturating_mul(size).min(self.rows.len());
                let end = start.saturating_add(size).min(self.rows.len());
                (start, end)
            }
            None => (0, self.rows.len()),
        }
    }
}

impl RowSource for InMemorySource {
    fn fetch(&self, batch_size: usize) -> ExportResult<RowStream> {
        let (start, end) = self.window(batch_size);
        let rows = self.rows.clone();
        PagedRowSource::new(move |offset, limit| {
            let from = (start + offset).min(end);
            let to = from.saturating_add(limit).min(end);
            Ok(rows[from..to].iter().cloned().map(Record::Map).collect())
        })
        .fetch(batch_size)
    }

    fn estimate_total(&self) -> i64 {
        match self.page {
            // Page size may depend on the batch size, which is unknown here.
            Some(PageSelector { page_size: None, .. }) => -1,
            _ => {
                let (start, end) = self.window(1);
                (end - start) as i64
            }
        }
    }
}

fn field_matches(actual: Option<&JsonValue>, expected: &JsonValue) -> bool {
    match expected {
        JsonValue::Null => true,
        JsonValue::String(s) if s.trim().is_empty() => true,
        JsonValue::String(s) => match actual {
            Some(JsonValue::String(a)) => a == s.trim(),
            Some(other) => other.to_string() == s.trim(),
            None => false,
        },
        other => actual == Some(other),
    }
}

fn parse_usize(value: Option<&JsonValue>) -> Option<usize> {
    match value? {
        JsonValue::Number(n) => n.as_u64().map(|n| n as usize),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
