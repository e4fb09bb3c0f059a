use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use tundra_common::Result;

use crate::expressions::PhysicalExpr;

/// Descriptor of one contiguous unit of external data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRange {
    pub id: u64,
    /// Location understood by the configured [`ScannerFactory`].
    pub uri: String,
    /// Byte offset of the range inside the source.
    #[serde(default)]
    pub offset: u64,
    /// Byte length; `0` means "to the end of the source".
    #[serde(default)]
    pub length: u64,
    /// Factory-specific options.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// A scan range plus the compiled expressions every worker applies to it.
#[derive(Clone)]
pub struct ScanRangeTask {
    pub range: ScanRange,
    pub conjuncts: Vec<Arc<dyn PhysicalExpr>>,
    pub partition_exprs: Vec<Arc<dyn PhysicalExpr>>,
}

impl fmt::Debug for ScanRangeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanRangeTask")
            .field("range", &self.range)
            .field("conjuncts", &self.conjuncts.len())
            .field("partition_exprs", &self.partition_exprs.len())
            .finish()
    }
}

/// Reader bound to a single scan range.
///
/// Dropping a scanner mid-stream must be safe; workers drop theirs when
/// cancellation is observed.
pub trait Scanner: Send {
    /// Next batch from the range, or `None` once it is exhausted.
    fn next_batch(&mut self) -> Result<Option<RecordBatch>>;
}

/// Builds scanners for scan ranges. Shared by every worker of a scan node.
pub trait ScannerFactory: Send + Sync {
    fn create_scanner(
        &self,
        range: &ScanRange,
        counter: &Arc<ScannerCounter>,
    ) -> Result<Box<dyn Scanner>>;
}

/// Row counters shared by all workers of one scan node.
#[derive(Debug, Default)]
pub struct ScannerCounter {
    rows_read: AtomicU64,
    rows_returned: AtomicU64,
    rows_filtered: AtomicU64,
    rows_without_partition: AtomicU64,
}

/// Point-in-time copy of a [`ScannerCounter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScannerCounts {
    pub rows_read: u64,
    pub rows_returned: u64,
    pub rows_filtered: u64,
    pub rows_without_partition: u64,
}

impl ScannerCounter {
    pub fn add_read(&self, rows: usize) {
        self.rows_read.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn add_returned(&self, rows: usize) {
        self.rows_returned.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn add_filtered(&self, rows: usize) {
        self.rows_filtered.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn add_without_partition(&self, rows: usize) {
        self.rows_without_partition
            .fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ScannerCounts {
        ScannerCounts {
            rows_read: self.rows_read.load(Ordering::Relaxed),
            rows_returned: self.rows_returned.load(Ordering::Relaxed),
            rows_filtered: self.rows_filtered.load(Ordering::Relaxed),
            rows_without_partition: self.rows_without_partition.load(Ordering::Relaxed),
        }
    }
}
