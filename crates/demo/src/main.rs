use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use serde_json::json;
use sqlx::PgPool;

use reportforge_core::{ColumnNode, ExportRequest, OwnerId, SheetSpec, TaskId};
use reportforge_infra::{
    ExportConfig, ExportService, ExportTask, InMemoryTaskStore, PostgresTaskStore, TaskStore,
};
use reportforge_report::{
    AggregatorRegistry, ExporterInfo, InMemoryProvider, JsonLinesSheetWriter, ProviderRegistry,
    StreamingReportBuilder, SumAggregator,
};

fn main() -> anyhow::Result<()> {
    reportforge_observability::init();

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let store: Arc<dyn TaskStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = runtime
                .block_on(PgPool::connect(&url))
                .context("failed to connect to Postgres")?;
            let store = PostgresTaskStore::new(pool, runtime.handle().clone());
            store.migrate()?;
            Arc::new(store)
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; using in-memory task store");
            InMemoryTaskStore::arc()
        }
    };

    let service = ExportService::new(
        ExportConfig::from_env(),
        builder(),
        JsonLinesSheetWriter,
        store,
    )?;

    let recovered = service.recover()?;
    tracing::info!(
        reset = recovered.reset.len(),
        resumed = recovered.resumed.len(),
        failed = recovered.failed.len(),
        "startup recovery done"
    );

    let owner = OwnerId::new("demo");
    let request = orders_request();

    let task_id = service.submit_async(&request, &owner)?;
    let task = wait_for(&service, task_id, Duration::from_secs(30))?;
    tracing::info!(
        task_id = %task.id,
        status = %task.status,
        processed_rows = ?task.processed_rows,
        download_ref = ?task.download_ref,
        error = ?task.error,
        "async export finished"
    );

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    service.export_sync(&request, &mut out, &owner)?;
    out.flush()?;

    let removed = service.cleanup_expired()?;
    tracing::info!(removed, "expired tasks cleaned up");

    service.shutdown();
    Ok(())
}

fn builder() -> StreamingReportBuilder {
    let orders = (1..=2500)
        .map(|n| {
            let region = ["north", "south", "east", "west"][n % 4];
            json!({
                "id": n,
                "region": region,
                "customer": format!("customer-{}", n % 37),
                "net": (n % 90) + 10,
                "tax": ((n % 90) + 10) / 5,
            })
        })
        .collect();

    StreamingReportBuilder::new(
        ProviderRegistry::new().with("orders", InMemoryProvider::from_json("orders", orders)),
        AggregatorRegistry::new().with("sum", SumAggregator::over(["net", "tax"])),
    )
    .with_decorator(ExporterInfo::now("reportforge-demo"))
}

fn orders_request() -> ExportRequest {
    let columns = vec![
        ColumnNode::leaf("Order", "id"),
        ColumnNode::leaf("Customer", "customer"),
        ColumnNode::group(
            "Amount",
            vec![ColumnNode::leaf("Net", "net"), ColumnNode::leaf("Tax", "tax")],
        ),
    ];

    ExportRequest::new(vec![
        SheetSpec::new("orders", columns.clone())
            .named("All orders")
            .with_aggregate("sum"),
        SheetSpec::new("orders", columns)
            .named("North")
            .with_filter("region", json!("north"))
            .with_aggregate("sum"),
    ])
    .with_file_name("orders")
    .with_page_size(500)
    .asynchronous()
}

fn wait_for(service: &ExportService, id: TaskId, timeout: Duration) -> anyhow::Result<ExportTask> {
    let deadline = Instant::now() + timeout;
    loop {
        let task = service
            .task(id)?
            .with_context(|| format!("task {id} disappeared"))?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        if Instant::now() >= deadline {
            bail!("task {id} still {} after {timeout:?}", task.status);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
