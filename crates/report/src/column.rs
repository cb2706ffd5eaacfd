//! Column tree flattening.
//!
//! A sheet declares its columns as a tree (group titles above leaf titles). Writers need
//! two flat views of that tree:
//!
//! - a **header matrix**: one entry per leaf column, holding the titles on the path from
//!   the root to that leaf, padded with empty strings to the full tree depth
//! - the **leaf fields**: the record field of every leaf, depth-first, left to right;
//!   this order is the column order of every data row

use std::collections::HashSet;

use reportforge_core::{ColumnNode, ExportError, ExportResult};

/// Column-major header titles: `columns()[c][level]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderMatrix {
    columns: Vec<Vec<String>>,
}

/// A run of adjacent header cells on one level sharing the same non-empty title.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MergeSpan {
    pub level: usize,
    pub first_column: usize,
    pub last_column: usize,
}

impl HeaderMatrix {
    /// Number of leaf columns.
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Number of header rows (depth of the column tree).
    pub fn depth(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub fn columns(&self) -> &[Vec<String>] {
        &self.columns
    }

    /// Titles of one header row, left to right.
    pub fn row(&self, level: usize) -> Vec<&str> {
        self.columns
            .iter()
            .map(|col| col.get(level).map_or("", String::as_str))
            .collect()
    }

    /// Row-major view, top header row first.
    pub fn rows(&self) -> Vec<Vec<String>> {
        (0..self.depth())
            .map(|level| self.row(level).into_iter().map(str::to_string).collect())
            .collect()
    }

    /// Parent titles that span several leaves, for writers that merge header cells.
    ///
    /// Only runs of two or more cells are reported; empty padding cells never merge.
    pub fn merged_spans(&self, level: usize) -> Vec<MergeSpan> {
        let row = self.row(level);
        let mut spans = Vec::new();
        let mut col = 0;
        while col < row.len() {
            let title = row[col];
            let first = col;
            col += 1;
            if title.is_empty() {
                continue;
            }
            while col < row.len() && row[col] == title {
                col += 1;
            }
            if col - 1 > first {
                spans.push(MergeSpan {
                    level,
                    first_column: first,
                    last_column: col - 1,
                });
            }
        }
        spans
    }
}

/// Flattened view of a sheet's column tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPlan {
    pub header: HeaderMatrix,
    pub leaf_fields: Vec<String>,
}

impl ColumnPlan {
    /// Flatten a column tree.
    ///
    /// Fails when the tree has no leaves, when a childless node has no field, or when two
    /// leaves bind the same field.
    pub fn flatten(columns: &[ColumnNode]) -> ExportResult<Self> {
        let mut paths = Vec::new();
        let mut leaf_fields = Vec::new();
        collect_paths(columns, &mut Vec::new(), &mut paths, &mut leaf_fields)?;

        if leaf_fields.is_empty() {
            return Err(ExportError::validation("column tree declares no leaf columns"));
        }

        let mut seen = HashSet::with_capacity(leaf_fields.len());
        for field in &leaf_fields {
            if !seen.insert(field.as_str()) {
                return Err(ExportError::validation(format!(
                    "field `{field}` is bound to more than one column"
                )));
            }
        }

        let depth = paths.iter().map(Vec::len).max().unwrap_or(0);
        let columns = paths
            .into_iter()
            .map(|mut path| {
                path.resize(depth, String::new());
                path
            })
            .collect();

        Ok(Self {
            header: HeaderMatrix { columns },
            leaf_fields,
        })
    }

    pub fn width(&self) -> usize {
        self.leaf_fields.len()
    }
}

fn collect_paths(
    nodes: &[ColumnNode],
    prefix: &mut Vec<String>,
    paths: &mut Vec<Vec<String>>,
    leaf_fields: &mut Vec<String>,
) -> ExportResult<()> {
    for node in nodes {
        prefix.push(node.title.clone());
        if node.children.is_empty() {
            let field = node
                .field
                .as_deref()
                .filter(|f| !f.trim().is_empty())
                .ok_or_else(|| {
                    ExportError::validation(format!(
                        "column `{}` has neither children nor a field",
                        node.title
                    ))
                })?;
            paths.push(prefix.clone());
            leaf_fields.push(field.to_string());
        } else {
            collect_paths(&node.children, prefix, paths, leaf_fields)?;
        }
        prefix.pop();
    }
    Ok(())
}
