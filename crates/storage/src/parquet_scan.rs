//! Local parquet files scanned by byte range.
//!
//! A range reads the row groups whose byte midpoint falls in
//! `[offset, offset + length)`, so consecutive ranges that tile a file read
//! every row group exactly once.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::file::metadata::ParquetMetaData;
use tracing::debug;
use tundra_common::{Result, TundraError};
use tundra_execution::scan::{ScanRange, Scanner, ScannerCounter, ScannerFactory};

use crate::stats::TableStats;

fn local_path(uri: &str) -> &str {
    uri.strip_prefix("file://").unwrap_or(uri)
}

fn invalid_data(path: &str, e: impl std::fmt::Display) -> TundraError {
    TundraError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{path}: {e}"),
    ))
}

fn open_builder(path: &str) -> Result<ParquetRecordBatchReaderBuilder<File>> {
    let file = File::open(path)?;
    ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| invalid_data(path, e))
}

/// Arrow schema of a parquet file.
pub fn parquet_schema(path: impl AsRef<Path>) -> Result<SchemaRef> {
    let path = path.as_ref().to_string_lossy();
    Ok(Arc::clone(open_builder(local_path(&path))?.schema()))
}

/// Row, byte and row-group counts from a parquet footer.
pub fn parquet_stats(path: impl AsRef<Path>) -> Result<TableStats> {
    let path = path.as_ref().to_string_lossy();
    let builder = open_builder(local_path(&path))?;
    let meta = builder.metadata();
    Ok(TableStats {
        rows: u64::try_from(meta.file_metadata().num_rows()).ok(),
        bytes: Some(
            meta.row_groups()
                .iter()
                .map(|rg| rg.compressed_size().max(0) as u64)
                .sum(),
        ),
        row_groups: Some(meta.num_row_groups() as u64),
    })
}

/// Indexes of the row groups owned by `[offset, offset + length)`; `length == 0` selects all.
pub fn select_row_groups(meta: &ParquetMetaData, offset: u64, length: u64) -> Vec<usize> {
    meta.row_groups()
        .iter()
        .enumerate()
        .filter(|(_, rg)| {
            if length == 0 {
                return true;
            }
            let start = rg
                .columns()
                .iter()
                .map(|c| c.byte_range().0)
                .min()
                .unwrap_or(0);
            let size: u64 = rg.columns().iter().map(|c| c.byte_range().1).sum();
            let mid = start + size / 2;
            mid >= offset && mid < offset.saturating_add(length)
        })
        .map(|(i, _)| i)
        .collect()
}

#[derive(Debug, Clone)]
pub struct ParquetScannerFactory {
    batch_size: usize,
}

impl ParquetScannerFactory {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

struct ParquetRangeScanner {
    path: String,
    reader: Option<ParquetRecordBatchReader>,
}

impl Scanner for ParquetRangeScanner {
    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        reader
            .next()
            .transpose()
            .map_err(|e| invalid_data(&self.path, e))
    }
}

impl ScannerFactory for ParquetScannerFactory {
    fn create_scanner(
        &self,
        range: &ScanRange,
        _counter: &Arc<ScannerCounter>,
    ) -> Result<Box<dyn Scanner>> {
        let path = local_path(&range.uri).to_string();
        let builder = open_builder(&path)?;
        let groups = select_row_groups(builder.metadata(), range.offset, range.length);
        debug!(
            range = range.id,
            path = %path,
            offset = range.offset,
            length = range.length,
            row_groups = groups.len(),
            "opening parquet range"
        );
        let reader = if groups.is_empty() {
            None
        } else {
            Some(
                builder
                    .with_row_groups(groups)
                    .with_batch_size(self.batch_size)
                    .build()
                    .map_err(|e| invalid_data(&path, e))?,
            )
        };
        Ok(Box::new(ParquetRangeScanner { path, reader }))
    }
}
