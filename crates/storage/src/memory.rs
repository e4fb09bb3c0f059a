//! In-memory tables scanned through `mem://<name>` ranges.
//!
//! A range's `offset` is the index of its first batch and `length` the
//! number of batches (`0` = through the last one).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use tundra_common::{Result, TundraError};
use tundra_execution::scan::{ScanRange, Scanner, ScannerCounter, ScannerFactory};

pub const MEMORY_SCHEME: &str = "mem://";

#[derive(Debug)]
struct MemTable {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

#[derive(Debug, Default)]
pub struct MemoryScannerFactory {
    tables: RwLock<HashMap<String, Arc<MemTable>>>,
}

impl MemoryScannerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace `name`. Every batch must carry `schema`.
    pub fn register(&self, name: &str, schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<()> {
        if let Some(bad) = batches.iter().position(|b| b.schema() != schema) {
            return Err(TundraError::Construction(format!(
                "batch {bad} of table '{name}' does not match the table schema"
            )));
        }
        self.tables
            .write()
            .expect("memory table registry lock poisoned")
            .insert(name.to_string(), Arc::new(MemTable { schema, batches }));
        Ok(())
    }

    pub fn schema(&self, name: &str) -> Option<SchemaRef> {
        self.table(name).map(|t| Arc::clone(&t.schema))
    }

    /// Ranges of at most `batches_per_range` batches covering the whole table.
    pub fn ranges(
        &self,
        name: &str,
        batches_per_range: usize,
        first_id: u64,
    ) -> Result<Vec<ScanRange>> {
        let table = self
            .table(name)
            .ok_or_else(|| TundraError::Construction(format!("unknown memory table '{name}'")))?;
        let per = batches_per_range.max(1);
        Ok((0..table.batches.len())
            .step_by(per)
            .zip(first_id..)
            .map(|(start, id)| ScanRange {
                id,
                uri: format!("{MEMORY_SCHEME}{name}"),
                offset: start as u64,
                length: per.min(table.batches.len() - start) as u64,
                options: HashMap::new(),
            })
            .collect())
    }

    fn table(&self, name: &str) -> Option<Arc<MemTable>> {
        self.tables
            .read()
            .expect("memory table registry lock poisoned")
            .get(name)
            .cloned()
    }
}

struct MemoryScanner {
    batches: VecDeque<RecordBatch>,
}

impl Scanner for MemoryScanner {
    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        Ok(self.batches.pop_front())
    }
}

impl ScannerFactory for MemoryScannerFactory {
    fn create_scanner(
        &self,
        range: &ScanRange,
        _counter: &Arc<ScannerCounter>,
    ) -> Result<Box<dyn Scanner>> {
        let name = range.uri.strip_prefix(MEMORY_SCHEME).ok_or_else(|| {
            TundraError::Construction(format!("not a memory range: {}", range.uri))
        })?;
        let table = self
            .table(name)
            .ok_or_else(|| TundraError::Construction(format!("unknown memory table '{name}'")))?;
        let total = table.batches.len();
        let start = usize::try_from(range.offset).unwrap_or(usize::MAX).min(total);
        let end = if range.length == 0 {
            total
        } else {
            start
                .saturating_add(usize::try_from(range.length).unwrap_or(usize::MAX))
                .min(total)
        };
        Ok(Box::new(MemoryScanner {
            batches: table.batches[start..end].iter().cloned().collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    fn table(n: usize) -> (SchemaRef, Vec<RecordBatch>) {
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        let batches = (0..n)
            .map(|i| {
                RecordBatch::try_new(
                    Arc::clone(&schema),
                    vec![Arc::new(Int64Array::from(vec![i as i64]))],
                )
                .expect("batch")
            })
            .collect();
        (schema, batches)
    }

    #[test]
    fn ranges_cover_every_batch_once() {
        let factory = MemoryScannerFactory::new();
        let (schema, batches) = table(7);
        factory.register("t", schema, batches).expect("register");
        let ranges = factory.ranges("t", 3, 100).expect("ranges");
        assert_eq!(
            ranges.iter().map(|r| (r.id, r.offset, r.length)).collect::<Vec<_>>(),
            vec![(100, 0, 3), (101, 3, 3), (102, 6, 1)]
        );
        let counter = Arc::new(ScannerCounter::default());
        let mut seen = 0;
        for r in &ranges {
            let mut scanner = factory.create_scanner(r, &counter).expect("scanner");
            while scanner.next_batch().expect("batch").is_some() {
                seen += 1;
            }
        }
        assert_eq!(seen, 7);
    }

    #[test]
    fn unknown_table_is_a_construction_error() {
        let factory = MemoryScannerFactory::new();
        let range = ScanRange {
            id: 0,
            uri: "mem://nope".to_string(),
            offset: 0,
            length: 0,
            options: HashMap::new(),
        };
        let err = factory
            .create_scanner(&range, &Arc::new(ScannerCounter::default()))
            .err()
            .expect("missing table");
        assert_eq!(err.kind(), tundra_common::ErrorKind::Construction);
    }
}
