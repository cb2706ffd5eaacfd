//! `reportforge-report`
//!
//! **Responsibility:** turning an [`ExportRequest`](reportforge_core::ExportRequest)
//! into streamed sheet models.
//!
//! - Column trees are flattened into header matrices and leaf field lists (`column`)
//! - Providers hand out filter-scoped row sources producing lazy record streams (`source`)
//! - Optional aggregators fold rows into a per-sheet summary row (`aggregate`)
//! - The builder wires those together without materializing rows (`builder`)
//! - Writers consume the models exactly once (`writer`)
//!
//! Nothing here knows about tasks, admission or persistence.

pub mod aggregate;
pub mod builder;
pub mod column;
pub mod decorator;
pub mod model;
pub mod record;
pub mod source;
pub mod writer;

pub use aggregate::{
    Aggregator, AggregatorRegistry, AverageAggregator, CountAggregator, SumAggregator,
};
pub use builder::{DEFAULT_BATCH_SIZE, StreamingReportBuilder};
pub use column::{ColumnPlan, HeaderMatrix, MergeSpan};
pub use decorator::{ExporterInfo, NoTopInfo, TopInfoDecorator};
pub use model::{NoProgress, ProgressSink, SheetRows, SheetWriteModel, TOTAL_LABEL};
pub use record::{FieldAccess, Record};
pub use source::{
    InMemoryProvider, PagedRowSource, Provider, ProviderRegistry, RowSource, RowStream,
};
pub use writer::{JsonLinesSheetWriter, SheetWriter};
