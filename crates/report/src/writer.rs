//! Sheet writers.

use std::io::Write;

use serde::Serialize;
use serde_json::Value as JsonValue;

use reportforge_core::{ExportError, ExportResult};

use crate::model::SheetWriteModel;

/// Serializes sheet models into an output stream.
///
/// Called exactly once per export with every model up front. Implementations iterate
/// each model's rows lazily and must not collect them.
pub trait SheetWriter: Send + Sync {
    /// Extension (without dot) of the files this writer produces.
    fn file_extension(&self) -> &str;

    fn write_sheets(&self, out: &mut dyn Write, sheets: Vec<SheetWriteModel>) -> ExportResult<()>;
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line<'a> {
    SheetStart {
        sheet: &'a str,
        index: usize,
        columns: usize,
    },
    Top {
        cells: &'a [String],
    },
    Header {
        level: usize,
        cells: Vec<&'a str>,
        merges: Vec<[usize; 2]>,
    },
    Row {
        cells: &'a [JsonValue],
    },
    Summary {
        cells: &'a [JsonValue],
    },
    SheetEnd {
        sheet: &'a str,
        rows: u64,
    },
}

/// One JSON object per line, per sheet:
///
/// `sheet_start`, `top`*, `header`+ (with merge spans), `row`*, `summary`?, `sheet_end`.
#[derive(Debug, Default, Copy, Clone)]
pub struct JsonLinesSheetWriter;

impl JsonLinesSheetWriter {
    fn emit(out: &mut dyn Write, line: &Line<'_>) -> ExportResult<()> {
        serde_json::to_writer(&mut *out, line).map_err(|e| ExportError::writer(e.to_string()))?;
        out.write_all(b"\n")?;
        Ok(())
    }
}

impl SheetWriter for JsonLinesSheetWriter {
    fn file_extension(&self) -> &str {
        "jsonl"
    }

    fn write_sheets(&self, out: &mut dyn Write, sheets: Vec<SheetWriteModel>) -> ExportResult<()> {
        for (index, mut sheet) in sheets.into_iter().enumerate() {
            Self::emit(
                out,
                &Line::SheetStart {
                    sheet: &sheet.name,
                    index,
                    columns: sheet.header.width(),
                },
            )?;
            for cells in &sheet.top_rows {
                Self::emit(out, &Line::Top { cells })?;
            }
            for level in 0..sheet.header.depth() {
                let merges = sheet
                    .header
                    .merged_spans(level)
                    .into_iter()
                    .map(|span| [span.first_column, span.last_column])
                    .collect();
                Self::emit(
                    out,
                    &Line::Header {
                        level,
                        cells: sheet.header.row(level),
                        merges,
                    },
                )?;
            }

            for row in sheet.rows.by_ref() {
                let row = row?;
                Self::emit(out, &Line::Row { cells: &row })?;
            }
            if let Some(summary) = sheet.rows.summary_row() {
                Self::emit(out, &Line::Summary { cells: &summary })?;
            }

            Self::emit(
                out,
                &Line::SheetEnd {
                    sheet: &sheet.name,
                    rows: sheet.rows.emitted(),
                },
            )?;
            // Earlier sheets stay in the output even if a later one fails.
            out.flush()?;
        }
        Ok(())
    }
}
