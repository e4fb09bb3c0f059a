use std::sync::Arc;

use tundra_common::Result;
use tundra_execution::scan::{ScanRange, Scanner, ScannerCounter, ScannerFactory};

use crate::memory::{MemoryScannerFactory, MEMORY_SCHEME};
use crate::parquet_scan::ParquetScannerFactory;

/// Routes each range to a backend by URI: `mem://` to memory tables,
/// anything else to local parquet files.
#[derive(Debug, Clone)]
pub struct StorageScannerFactory {
    memory: Arc<MemoryScannerFactory>,
    parquet: ParquetScannerFactory,
}

impl StorageScannerFactory {
    pub fn new(batch_size: usize) -> Self {
        Self {
            memory: Arc::new(MemoryScannerFactory::new()),
            parquet: ParquetScannerFactory::new(batch_size),
        }
    }

    /// Memory table registry used for `mem://` ranges.
    pub fn memory(&self) -> &Arc<MemoryScannerFactory> {
        &self.memory
    }
}

impl ScannerFactory for StorageScannerFactory {
    fn create_scanner(
        &self,
        range: &ScanRange,
        counter: &Arc<ScannerCounter>,
    ) -> Result<Box<dyn Scanner>> {
        if range.uri.starts_with(MEMORY_SCHEME) {
            self.memory.create_scanner(range, counter)
        } else {
            self.parquet.create_scanner(range, counter)
        }
    }
}
