use std::sync::Arc;
use std::thread;

use arrow::array::BooleanArray;
use arrow::compute::kernels::boolean::and_kleene;
use arrow::record_batch::RecordBatch;
use tracing::{debug, error, warn};
use tundra_common::{PlanNodeId, Result, TundraError};

use crate::batch::RowBatch;
use crate::expressions::{evaluate_all, evaluate_predicate, PhysicalExpr};
use crate::partition::PartitionIndex;
use crate::scalar::row_key;
use crate::scan::queue::{BatchQueue, PushOutcome};
use crate::scan::scanner::{ScanRangeTask, ScannerCounter, ScannerFactory};

/// One scanner thread's share of a scan node's ranges.
pub(crate) struct ScanWorker {
    pub index: usize,
    pub node_id: PlanNodeId,
    pub tasks: Vec<ScanRangeTask>,
    pub factory: Arc<dyn ScannerFactory>,
    pub queue: Arc<BatchQueue>,
    pub counter: Arc<ScannerCounter>,
    pub partitions: Arc<PartitionIndex>,
}

enum RangeOutcome {
    Completed { batches: usize, rows: usize },
    Stopped,
}

/// Marks the worker finished however `run` exits, recording a panic as a failure.
struct FinishGuard<'a> {
    queue: &'a BatchQueue,
    node_id: PlanNodeId,
    worker: usize,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(node_id = %self.node_id, worker = self.worker, "scan worker panicked");
            self.queue.record_failure(TundraError::Internal(format!(
                "scan worker {} of node {} panicked",
                self.worker, self.node_id
            )));
        }
        self.queue.worker_finished();
    }
}

impl ScanWorker {
    pub fn run(self) {
        let _guard = FinishGuard {
            queue: &self.queue,
            node_id: self.node_id,
            worker: self.index,
        };
        for task in &self.tasks {
            if self.queue.should_stop() {
                debug!(node_id = %self.node_id, worker = self.index, "scan worker stopping early");
                break;
            }
            match self.scan_range(task) {
                Ok(RangeOutcome::Completed { batches, rows }) => {
                    debug!(
                        node_id = %self.node_id,
                        worker = self.index,
                        range = task.range.id,
                        batches,
                        rows,
                        "scan range complete"
                    );
                }
                Ok(RangeOutcome::Stopped) => break,
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    let first = self.queue.record_failure(err.clone());
                    warn!(
                        node_id = %self.node_id,
                        worker = self.index,
                        range = task.range.id,
                        first,
                        error = %err,
                        "scan range failed"
                    );
                    break;
                }
            }
        }
    }

    fn scan_range(&self, task: &ScanRangeTask) -> Result<RangeOutcome> {
        let mut scanner = self.factory.create_scanner(&task.range, &self.counter)?;
        let (mut batches, mut rows) = (0, 0);
        loop {
            if self.queue.should_stop() {
                return Ok(RangeOutcome::Stopped);
            }
            let Some(raw) = scanner.next_batch()? else {
                break;
            };
            self.counter.add_read(raw.num_rows());
            let batch = prepare_batch(
                raw,
                &task.conjuncts,
                &task.partition_exprs,
                &self.partitions,
                &self.counter,
            )?;
            if batch.is_empty() {
                continue;
            }
            rows += batch.num_rows();
            match self.queue.push(batch) {
                PushOutcome::Pushed => batches += 1,
                PushOutcome::Stopped => return Ok(RangeOutcome::Stopped),
            }
        }
        Ok(RangeOutcome::Completed { batches, rows })
    }
}

/// Apply conjuncts, then attach partition ids and drop rows that match no partition.
pub(crate) fn prepare_batch(
    raw: RecordBatch,
    conjuncts: &[Arc<dyn PhysicalExpr>],
    partition_exprs: &[Arc<dyn PhysicalExpr>],
    partitions: &PartitionIndex,
    counter: &ScannerCounter,
) -> Result<RowBatch> {
    let mut batch = RowBatch::new(raw);

    if let Some(mask) = conjunct_mask(conjuncts, batch.record_batch())? {
        let before = batch.num_rows();
        batch = batch.filter(&mask)?;
        counter.add_filtered(before - batch.num_rows());
    }

    if !partition_exprs.is_empty() && !batch.is_empty() {
        let key_columns = evaluate_all(partition_exprs, batch.record_batch())?;
        let mut ids = Vec::with_capacity(batch.num_rows());
        let mut keep = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let key = row_key(&key_columns, row)?;
            match partitions.find(&key)? {
                Some(id) => {
                    ids.push(id);
                    keep.push(true);
                }
                None => keep.push(false),
            }
        }
        let dropped = batch.num_rows() - ids.len();
        if dropped > 0 {
            batch = batch.filter(&BooleanArray::from(keep))?;
            counter.add_without_partition(dropped);
        }
        batch = batch.with_partition_ids(ids)?;
    }

    counter.add_returned(batch.num_rows());
    Ok(batch)
}

fn conjunct_mask(
    conjuncts: &[Arc<dyn PhysicalExpr>],
    batch: &RecordBatch,
) -> Result<Option<BooleanArray>> {
    let mut mask: Option<BooleanArray> = None;
    for conjunct in conjuncts {
        let next = evaluate_predicate(conjunct.as_ref(), batch)?;
        mask = Some(match mask {
            None => next,
            Some(acc) => and_kleene(&acc, &next)
                .map_err(|e| TundraError::Evaluation(format!("conjunct combine failed: {e}")))?,
        });
    }
    Ok(mask)
}
