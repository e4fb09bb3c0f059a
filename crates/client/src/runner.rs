use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use tracing::{info, warn};
use tundra_common::{
    EngineConfig, MemoryBudget, MetricsRegistry, PlanNodeId, QueryId, Result, TundraError,
};
use tundra_execution::aggregate::{AggregateMode, AggregationNode};
use tundra_execution::scan::{ScanNode, ScanRange};
use tundra_execution::{CancellationToken, ExecNode, RuntimeState};
use tundra_storage::{parquet_schema, Catalog, StorageScannerFactory, DEFAULT_RANGE_BYTES};

use crate::job::JobSpec;

const SCAN_NODE_ID: PlanNodeId = PlanNodeId(0);
const AGG_NODE_ID: PlanNodeId = PlanNodeId(1);

/// Result of one job.
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub query_id: QueryId,
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl JobOutput {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }
}

/// Builds and drives `ScanNode -> AggregationNode` pipelines.
///
/// Jobs share one scanner factory, metrics registry and memory budget.
pub struct JobRunner {
    config: EngineConfig,
    catalog: Catalog,
    factory: Arc<StorageScannerFactory>,
    metrics: MetricsRegistry,
    memory: Arc<MemoryBudget>,
    next_query_id: AtomicU64,
}

impl JobRunner {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            factory: Arc::new(StorageScannerFactory::new(config.batch_size_rows)),
            memory: MemoryBudget::new(config.mem_budget_bytes),
            config,
            catalog: Catalog::new(),
            metrics: MetricsRegistry::new(),
            next_query_id: AtomicU64::new(1),
        })
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Factory shared by every job; register memory tables through it.
    pub fn factory(&self) -> &Arc<StorageScannerFactory> {
        &self.factory
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn run(&self, job: &JobSpec) -> Result<JobOutput> {
        self.run_with_cancellation(job, CancellationToken::new())
    }

    /// Run `job`; cancelling `token` stops the scan and fails the job with `Cancelled`.
    pub fn run_with_cancellation(
        &self,
        job: &JobSpec,
        token: CancellationToken,
    ) -> Result<JobOutput> {
        job.validate()?;
        let query_id = if job.query_id == 0 {
            QueryId(self.next_query_id.fetch_add(1, Ordering::Relaxed))
        } else {
            QueryId(job.query_id)
        };
        let config = job.config.clone().unwrap_or_else(|| self.config.clone());
        let state = RuntimeState::new(query_id, config)
            .with_metrics(self.metrics.clone())
            .with_memory_budget(Arc::clone(&self.memory))
            .with_cancellation(token);

        let (schema, ranges) = self.resolve_input(job)?;
        info!(query_id = %query_id, ranges = ranges.len(), "starting job");
        let scan = ScanNode::new(SCAN_NODE_ID, schema, self.factory.clone(), ranges)
            .with_conjuncts(job.conjuncts.clone())
            .with_partitions(job.partition_exprs.clone(), job.partitions.clone());

        let mut root: Box<dyn ExecNode> = if job.is_aggregation() {
            Box::new(AggregationNode::try_new(
                AGG_NODE_ID,
                Box::new(scan),
                job.group_by.clone(),
                job.aggregates
                    .iter()
                    .map(|a| (a.expr.clone(), a.name.clone()))
                    .collect(),
                AggregateMode::Update,
                true,
            )?)
        } else {
            Box::new(scan)
        };

        let started = Instant::now();
        let result = drive(root.as_mut(), &state);
        let closed = root.close(&state);
        let batches = match (result, closed) {
            (Ok(batches), Ok(())) => batches,
            (Err(e), _) | (Ok(_), Err(e)) => {
                warn!(query_id = %query_id, error = %e, "job failed");
                return Err(e);
            }
        };
        let output = JobOutput {
            query_id,
            schema: root.schema(),
            batches,
        };
        info!(
            query_id = %query_id,
            rows = output.num_rows(),
            batches = output.batches.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job finished"
        );
        Ok(output)
    }

    fn resolve_input(&self, job: &JobSpec) -> Result<(SchemaRef, Vec<ScanRange>)> {
        if let Some(name) = &job.table {
            let table = self.catalog.get(name)?;
            let ranges =
                table.scan_ranges(job.range_bytes.unwrap_or(DEFAULT_RANGE_BYTES), 0)?;
            let schema = match &table.schema {
                Some(s) => Arc::new(s.clone()),
                None => match self.factory.memory().schema(name) {
                    Some(s) => s,
                    None => {
                        let first = table.data_paths()?.into_iter().next().ok_or_else(|| {
                            TundraError::Construction(format!("table '{name}' has no data"))
                        })?;
                        parquet_schema(first)?
                    }
                },
            };
            return Ok((schema, ranges));
        }
        let schema = match &job.schema {
            Some(s) => Arc::new(s.clone()),
            None => {
                let first = job.ranges.first().ok_or_else(|| {
                    TundraError::Construction("job has no ranges".to_string())
                })?;
                match self.factory.memory().schema(
                    first
                        .uri
                        .strip_prefix(tundra_storage::MEMORY_SCHEME)
                        .unwrap_or_default(),
                ) {
                    Some(s) => s,
                    None => parquet_schema(&first.uri)?,
                }
            }
        };
        Ok((schema, job.ranges.clone()))
    }
}

fn drive(root: &mut dyn ExecNode, state: &RuntimeState) -> Result<Vec<RecordBatch>> {
    root.open(state)?;
    let mut batches = Vec::new();
    while let Some(batch) = root.get_next(state)? {
        batches.push(batch.into_record_batch());
    }
    Ok(batches)
}
