//! Streaming report builder.
//!
//! Turns a request into one [`SheetWriteModel`] per sheet, in request order. Building is
//! cheap: providers are scoped and streams opened, but no row is fetched until a writer
//! iterates the model.

use std::sync::Arc;

use reportforge_core::{ExportRequest, ExportResult};

use crate::aggregate::AggregatorRegistry;
use crate::column::ColumnPlan;
use crate::decorator::{NoTopInfo, TopInfoDecorator};
use crate::model::{NoProgress, ProgressSink, SheetRows, SheetWriteModel};
use crate::source::ProviderRegistry;

/// Batch size used when a request asks for `0`.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Clone)]
pub struct StreamingReportBuilder {
    providers: ProviderRegistry,
    aggregators: AggregatorRegistry,
    decorator: Arc<dyn TopInfoDecorator>,
    default_batch_size: usize,
}

impl StreamingReportBuilder {
    pub fn new(providers: ProviderRegistry, aggregators: AggregatorRegistry) -> Self {
        Self {
            providers,
            aggregators,
            decorator: Arc::new(NoTopInfo),
            default_batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_decorator(mut self, decorator: impl TopInfoDecorator + 'static) -> Self {
        self.decorator = Arc::new(decorator);
        self
    }

    pub fn with_default_batch_size(mut self, batch_size: usize) -> Self {
        self.default_batch_size = batch_size.max(1);
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn aggregators(&self) -> &AggregatorRegistry {
        &self.aggregators
    }

    /// Structural validation: sheets present, and every column tree flattens.
    pub fn validate(&self, request: &ExportRequest) -> ExportResult<()> {
        request.validate()?;
        for sheet in &request.sheets {
            ColumnPlan::flatten(&sheet.columns)?;
        }
        Ok(())
    }

    /// Every provider and aggregator key the request names is registered.
    pub fn check_keys(&self, request: &ExportRequest) -> ExportResult<()> {
        for sheet in &request.sheets {
            self.providers.resolve(&sheet.provider)?;
            if let Some(key) = &sheet.aggregate_key {
                self.aggregators.resolve(key)?;
            }
        }
        Ok(())
    }

    pub fn batch_size(&self, request: &ExportRequest) -> usize {
        if request.page_size == 0 {
            self.default_batch_size
        } else {
            request.page_size
        }
    }

    /// Sum of the positive row estimates across sheets; `None` when nothing is known.
    ///
    /// Sheets whose provider cannot be scoped contribute nothing; `build` reports those.
    pub fn estimate_total(&self, request: &ExportRequest) -> Option<u64> {
        let total: u64 = request
            .sheets
            .iter()
            .filter_map(|sheet| {
                let provider = self.providers.resolve(&sheet.provider).ok()?;
                let estimate = provider.with_filters(&sheet.filters).ok()?.estimate_total();
                u64::try_from(estimate).ok().filter(|n| *n > 0)
            })
            .sum();
        (total > 0).then_some(total)
    }

    /// Build the sheet models.
    ///
    /// Fails on the first sheet whose provider or aggregator key is unknown, or whose
    /// column tree does not flatten.
    pub fn build(
        &self,
        request: &ExportRequest,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> ExportResult<Vec<SheetWriteModel>> {
        request.validate()?;
        let progress: Arc<dyn ProgressSink> = progress.unwrap_or_else(|| Arc::new(NoProgress));
        let batch_size = self.batch_size(request);

        let mut sheets = Vec::with_capacity(request.sheets.len());
        for sheet in &request.sheets {
            let provider = self.providers.resolve(&sheet.provider)?;
            let plan = ColumnPlan::flatten(&sheet.columns)?;
            let aggregator = sheet
                .aggregate_key
                .as_deref()
                .map(|key| self.aggregators.resolve(key))
                .transpose()?;

            let source = provider.with_filters(&sheet.filters)?;
            let stream = source.fetch(batch_size)?;
            let top_rows = self.decorator.rows(request, &sheet.provider);

            tracing::debug!(
                sheet = %sheet.display_name(),
                provider = %sheet.provider,
                columns = plan.width(),
                header_depth = plan.header.depth(),
                batch_size,
                aggregated = aggregator.is_some(),
                "sheet model built"
            );

            let ColumnPlan { header, leaf_fields } = plan;
            sheets.push(SheetWriteModel {
                name: sheet.display_name().to_string(),
                header,
                top_rows,
                rows: SheetRows::new(stream, leaf_fields.clone(), aggregator, progress.clone()),
                leaf_fields,
            });
        }
        Ok(sheets)
    }
}

impl core::fmt::Debug for StreamingReportBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamingReportBuilder")
            .field("providers", &self.providers)
            .field("aggregators", &self.aggregators)
            .field("default_batch_size", &self.default_batch_size)
            .finish_non_exhaustive()
    }
}
