use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use tracing::{info, warn};
use tundra_common::{PlanNodeId, Result, ScanTotals, TundraError};

use crate::batch::RowBatch;
use crate::context::RuntimeState;
use crate::exec_node::ExecNode;
use crate::expressions::{compile_expr, evaluate_all, Expr, PhysicalExpr};
use crate::partition::{PartitionIndex, PartitionInfo};
use crate::scalar::row_key;
use crate::scan::queue::{BatchQueue, QueueStats};
use crate::scan::scanner::{
    ScanRange, ScanRangeTask, ScannerCounter, ScannerCounts, ScannerFactory,
};
use crate::scan::worker::ScanWorker;

/// Combined queue and row counters of a scan node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub queue: QueueStats,
    pub rows: ScannerCounts,
}

struct Prepared {
    tasks: Vec<ScanRangeTask>,
    partition_exprs: Vec<Arc<dyn PhysicalExpr>>,
    partitions: Arc<PartitionIndex>,
    queue: Arc<BatchQueue>,
    threads: usize,
}

/// Multi-threaded scan over a set of scan ranges.
///
/// `open` splits the ranges into contiguous, near-even shares and starts one
/// thread per share. Threads push filtered batches into a bounded queue that
/// `get_next` drains. The first failure recorded by any thread is returned
/// by every later `get_next`; batches still buffered at that point are
/// discarded.
pub struct ScanNode {
    id: PlanNodeId,
    schema: SchemaRef,
    factory: Arc<dyn ScannerFactory>,
    ranges: Vec<ScanRange>,
    conjuncts: Vec<Expr>,
    partition_exprs: Vec<Expr>,
    partition_infos: Vec<PartitionInfo>,
    scanner_threads: Option<usize>,
    max_buffered_batches: Option<usize>,
    counter: Arc<ScannerCounter>,
    prepared: Option<Prepared>,
    handles: Vec<JoinHandle<()>>,
    opened: bool,
    closed: bool,
}

impl ScanNode {
    pub fn new(
        id: PlanNodeId,
        schema: SchemaRef,
        factory: Arc<dyn ScannerFactory>,
        ranges: Vec<ScanRange>,
    ) -> Self {
        Self {
            id,
            schema,
            factory,
            ranges,
            conjuncts: Vec::new(),
            partition_exprs: Vec::new(),
            partition_infos: Vec::new(),
            scanner_threads: None,
            max_buffered_batches: None,
            counter: Arc::new(ScannerCounter::default()),
            prepared: None,
            handles: Vec::new(),
            opened: false,
            closed: false,
        }
    }

    /// Predicates every row must satisfy. NULL counts as false.
    pub fn with_conjuncts(mut self, conjuncts: Vec<Expr>) -> Self {
        self.conjuncts = conjuncts;
        self
    }

    /// Key expressions and the ranges they are looked up in.
    pub fn with_partitions(mut self, exprs: Vec<Expr>, infos: Vec<PartitionInfo>) -> Self {
        self.partition_exprs = exprs;
        self.partition_infos = infos;
        self
    }

    /// Override `EngineConfig::scanner_threads`.
    pub fn with_scanner_threads(mut self, n: usize) -> Self {
        self.scanner_threads = Some(n);
        self
    }

    /// Override `EngineConfig::max_buffered_batches`.
    pub fn with_max_buffered_batches(mut self, n: usize) -> Self {
        self.max_buffered_batches = Some(n);
        self
    }

    /// Validate settings, compile expressions, build the partition index and
    /// allocate the queue. Called by `open` when not called explicitly.
    pub fn prepare(&mut self, state: &RuntimeState) -> Result<()> {
        if self.prepared.is_some() {
            return Ok(());
        }
        let threads = self
            .scanner_threads
            .unwrap_or(state.config().scanner_threads);
        if threads == 0 {
            return Err(TundraError::Construction(
                "scan node needs at least one scanner thread".to_string(),
            ));
        }
        let capacity = self
            .max_buffered_batches
            .unwrap_or(state.config().max_buffered_batches);
        if self.partition_exprs.is_empty() && !self.partition_infos.is_empty() {
            return Err(TundraError::Construction(
                "partition ranges configured without partition expressions".to_string(),
            ));
        }

        let conjuncts = self
            .conjuncts
            .iter()
            .map(|e| compile_expr(e, &self.schema))
            .collect::<Result<Vec<_>>>()?;
        let partition_exprs = self
            .partition_exprs
            .iter()
            .map(|e| compile_expr(e, &self.schema))
            .collect::<Result<Vec<_>>>()?;
        let partitions = Arc::new(PartitionIndex::try_new(self.partition_infos.clone())?);
        let queue = Arc::new(BatchQueue::new(capacity)?);

        let tasks = self
            .ranges
            .iter()
            .map(|range| ScanRangeTask {
                range: range.clone(),
                conjuncts: conjuncts.clone(),
                partition_exprs: partition_exprs.clone(),
            })
            .collect();

        self.prepared = Some(Prepared {
            tasks,
            partition_exprs,
            partitions,
            queue,
            threads,
        });
        Ok(())
    }

    /// Partition id of `row`, or `None` when no range covers its key or no
    /// partitions are configured. Does not touch the scan stream.
    pub fn get_partition_id(
        &self,
        exprs: &[Arc<dyn PhysicalExpr>],
        batch: &RecordBatch,
        row: usize,
    ) -> Result<Option<i64>> {
        let prepared = self.prepared.as_ref().ok_or_else(|| {
            TundraError::Internal("get_partition_id called before prepare".to_string())
        })?;
        if prepared.partitions.is_empty() {
            return Ok(None);
        }
        if row >= batch.num_rows() {
            return Err(TundraError::Internal(format!(
                "row {row} out of range for batch of {} rows",
                batch.num_rows()
            )));
        }
        let single = batch.slice(row, 1);
        let columns = evaluate_all(exprs, &single)?;
        prepared.partitions.find(&row_key(&columns, 0)?)
    }

    /// Compiled partition expressions, available after `prepare`.
    pub fn partition_exprs(&self) -> &[Arc<dyn PhysicalExpr>] {
        self.prepared
            .as_ref()
            .map_or(&[][..], |p| p.partition_exprs.as_slice())
    }

    pub fn stats(&self) -> ScanStats {
        ScanStats {
            queue: self
                .prepared
                .as_ref()
                .map(|p| p.queue.stats())
                .unwrap_or_default(),
            rows: self.counter.snapshot(),
        }
    }

    fn spawn_workers(&mut self, state: &RuntimeState) {
        let Some(prepared) = self.prepared.as_mut() else {
            return;
        };
        let queue = Arc::clone(&prepared.queue);
        let mut tasks = std::mem::take(&mut prepared.tasks);
        let workers = prepared.threads.min(tasks.len());
        queue.register_workers(workers);
        if workers == 0 {
            return;
        }

        let base = tasks.len() / workers;
        let extra = tasks.len() % workers;
        let mut shares = Vec::with_capacity(workers);
        for i in (0..workers).rev() {
            let take = base + usize::from(i < extra);
            shares.push(tasks.split_off(tasks.len() - take));
        }
        shares.reverse();

        for (index, share) in shares.into_iter().enumerate() {
            let worker = ScanWorker {
                index,
                node_id: self.id,
                tasks: share,
                factory: Arc::clone(&self.factory),
                queue: Arc::clone(&queue),
                counter: Arc::clone(&self.counter),
                partitions: Arc::clone(&prepared.partitions),
            };
            let spawned = thread::Builder::new()
                .name(format!("tundra-scan-{}-{index}", self.id))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => self.handles.push(handle),
                Err(e) => {
                    warn!(
                        node_id = %self.id,
                        worker = index,
                        error = %e,
                        "failed to start scan worker"
                    );
                    queue.record_failure(TundraError::Construction(format!(
                        "failed to start scan worker {index}: {e}"
                    )));
                    for _ in index..workers {
                        queue.worker_finished();
                    }
                    break;
                }
            }
        }
        state
            .metrics()
            .set_running_scanners(&state.query_id().to_string(), self.id.0, self.handles.len());
    }

    fn shutdown(&mut self) -> Option<QueueStats> {
        let prepared = self.prepared.as_ref()?;
        prepared.queue.cancel();
        for handle in self.handles.drain(..) {
            // A panicking worker already recorded itself through its finish guard.
            let _ = handle.join();
        }
        prepared.queue.drain();
        Some(prepared.queue.stats())
    }
}

impl ExecNode for ScanNode {
    fn name(&self) -> &'static str {
        "ScanNode"
    }

    fn id(&self) -> PlanNodeId {
        self.id
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn open(&mut self, state: &RuntimeState) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        self.prepare(state)?;
        self.opened = true;
        if let Some(prepared) = &self.prepared {
            let weak = Arc::downgrade(&prepared.queue);
            state.cancellation().on_cancel(move || {
                if let Some(queue) = weak.upgrade() {
                    queue.cancel();
                }
            });
        }
        self.spawn_workers(state);
        info!(
            node_id = %self.id,
            ranges = self.ranges.len(),
            workers = self.handles.len(),
            "scan node opened"
        );
        Ok(())
    }

    fn get_next(&mut self, state: &RuntimeState) -> Result<Option<RowBatch>> {
        if !self.opened {
            return Err(TundraError::Internal(
                "scan node get_next called before open".to_string(),
            ));
        }
        let prepared = self.prepared.as_ref().ok_or_else(|| {
            TundraError::Internal("scan node opened without preparation".to_string())
        })?;
        let query_id = state.query_id().to_string();
        let started = Instant::now();
        let out = prepared.queue.pop();
        let metrics = state.metrics();
        metrics.observe_consumer_wait(&query_id, self.id.0, started.elapsed().as_secs_f64());
        metrics.set_scan_queue_depth(&query_id, self.id.0, prepared.queue.len());
        out
    }

    fn close(&mut self, state: &RuntimeState) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let Some(queue_stats) = self.shutdown() else {
            return Ok(());
        };
        let rows = self.counter.snapshot();
        let query_id = state.query_id().to_string();
        let metrics = state.metrics();
        metrics.record_scan_totals(
            &query_id,
            self.id.0,
            ScanTotals {
                produced: queue_stats.produced,
                delivered: queue_stats.delivered,
                discarded: queue_stats.discarded,
                rows_read: rows.rows_read,
                rows_filtered: rows.rows_filtered + rows.rows_without_partition,
            },
        );
        metrics.set_running_scanners(&query_id, self.id.0, 0);
        metrics.set_scan_queue_depth(&query_id, self.id.0, 0);
        info!(
            node_id = %self.id,
            batches = queue_stats.delivered,
            discarded = queue_stats.discarded,
            rows = rows.rows_returned,
            filtered = rows.rows_filtered,
            without_partition = rows.rows_without_partition,
            "scan node closed"
        );
        Ok(())
    }
}

impl Drop for ScanNode {
    fn drop(&mut self) {
        if !self.closed {
            self.shutdown();
        }
    }
}
