//! Scanner backends for the scan node: in-memory tables and local parquet
//! files read by byte range, plus a JSON table catalog that turns tables
//! into scan ranges.

pub mod catalog;
pub mod memory;
pub mod parquet_scan;
pub mod provider;
pub mod stats;

pub use catalog::{Catalog, TableDef, TableFormat, DEFAULT_RANGE_BYTES};
pub use memory::{MemoryScannerFactory, MEMORY_SCHEME};
pub use parquet_scan::{parquet_schema, parquet_stats, select_row_groups, ParquetScannerFactory};
pub use provider::StorageScannerFactory;
pub use stats::TableStats;
