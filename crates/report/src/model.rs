//! Per-sheet write models.
//!
//! A [`SheetWriteModel`] is everything a writer needs for one sheet. Its rows are lazy:
//! each call to [`SheetRows::next`] pulls one upstream record, projects it onto the leaf
//! fields, folds aggregable cells and reports one processed row. Nothing is buffered.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use reportforge_core::ExportResult;

use crate::aggregate::Aggregator;
use crate::column::HeaderMatrix;
use crate::source::RowStream;

/// Label written in the first cell of a summary row when that column is not aggregated.
pub const TOTAL_LABEL: &str = "total";

/// Receives processed-row increments as rows flow to the writer.
pub trait ProgressSink: Send + Sync {
    fn increment(&self, rows: u64);
}

/// Discards progress.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn increment(&self, _rows: u64) {}
}

/// Lazy data rows of one sheet plus its running aggregates.
pub struct SheetRows {
    stream: RowStream,
    leaf_fields: Vec<String>,
    aggregator: Option<Arc<dyn Aggregator>>,
    /// One slot per leaf field; `Some` only for aggregable fields.
    accumulators: Vec<Option<JsonValue>>,
    progress: Arc<dyn ProgressSink>,
    emitted: u64,
    finished: bool,
    summarized: bool,
}

impl SheetRows {
    pub fn new(
        stream: RowStream,
        leaf_fields: Vec<String>,
        aggregator: Option<Arc<dyn Aggregator>>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        let accumulators = leaf_fields
            .iter()
            .map(|field| {
                aggregator
                    .as_ref()
                    .filter(|agg| agg.is_aggregable(field))
                    .map(|agg| agg.seed(field))
            })
            .collect();

        Self {
            stream,
            leaf_fields,
            aggregator,
            accumulators,
            progress,
            emitted: 0,
            finished: false,
            summarized: false,
        }
    }

    /// Data rows emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn has_aggregator(&self) -> bool {
        self.aggregator.is_some()
    }

    /// The summary row, once every data row has been consumed.
    ///
    /// `None` without an aggregator, before the rows are exhausted, after a row error, or
    /// when the summary was already taken. Aggregable fields hold the finalized value;
    /// an unaggregated first column holds [`TOTAL_LABEL`]; other cells are blank.
    pub fn summary_row(&mut self) -> Option<Vec<JsonValue>> {
        let aggregator = self.aggregator.as_ref()?;
        if !self.finished || self.summarized {
            return None;
        }
        self.summarized = true;

        let row = self
            .leaf_fields
            .iter()
            .zip(self.accumulators.iter_mut())
            .enumerate()
            .map(|(index, (field, slot))| match slot.take() {
                Some(acc) => aggregator.finalize(field, acc),
                None if index == 0 => JsonValue::from(TOTAL_LABEL),
                None => JsonValue::from(""),
            })
            .collect();
        Some(row)
    }
}

impl Iterator for SheetRows {
    type Item = ExportResult<Vec<JsonValue>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.stream.next() {
            Some(Ok(record)) => {
                let row = record.project(&self.leaf_fields);
                if let Some(aggregator) = &self.aggregator {
                    for ((field, slot), value) in self
                        .leaf_fields
                        .iter()
                        .zip(self.accumulators.iter_mut())
                        .zip(&row)
                    {
                        if let Some(acc) = slot {
                            *acc = aggregator.fold(field, value, std::mem::take(acc));
                        }
                    }
                }
                self.emitted += 1;
                self.progress.increment(1);
                Some(Ok(row))
            }
            Some(Err(err)) => {
                // A failed sheet never gets a summary row.
                self.finished = true;
                self.summarized = true;
                Some(Err(err))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

/// One sheet, ready to be written.
pub struct SheetWriteModel {
    pub name: String,
    pub header: HeaderMatrix,
    pub top_rows: Vec<Vec<String>>,
    pub leaf_fields: Vec<String>,
    pub rows: SheetRows,
}

impl core::fmt::Debug for SheetWriteModel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SheetWriteModel")
            .field("name", &self.name)
            .field("header", &self.header)
            .field("top_rows", &self.top_rows)
            .field("leaf_fields", &self.leaf_fields)
            .field("aggregated", &self.rows.has_aggregator())
            .finish_non_exhaustive()
    }
}
