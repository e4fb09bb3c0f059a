use arrow::array::{Array, BooleanArray};
use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use tundra_common::{Result, TundraError};

/// Unit of data handed from scanner threads to the consumer.
///
/// The batch owns its column buffers outright. Moving it into the scan
/// queue hands those buffers to the consumer, and dropping it releases
/// them together.
#[derive(Debug, Clone)]
pub struct RowBatch {
    batch: RecordBatch,
    partition_ids: Option<Vec<i64>>,
}

impl RowBatch {
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            batch,
            partition_ids: None,
        }
    }

    /// Attach one partition id per row.
    pub fn with_partition_ids(mut self, ids: Vec<i64>) -> Result<Self> {
        if ids.len() != self.batch.num_rows() {
            return Err(TundraError::Internal(format!(
                "partition id count {} does not match row count {}",
                ids.len(),
                self.batch.num_rows()
            )));
        }
        self.partition_ids = Some(ids);
        Ok(self)
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_record_batch(self) -> RecordBatch {
        self.batch
    }

    /// Partition id of each row, when partition expressions are configured.
    pub fn partition_ids(&self) -> Option<&[i64]> {
        self.partition_ids.as_deref()
    }

    /// Keep rows where `mask` is true. NULL mask entries drop the row.
    pub fn filter(self, mask: &BooleanArray) -> Result<Self> {
        let batch = filter_record_batch(&self.batch, mask)
            .map_err(|e| TundraError::Evaluation(format!("filter failed: {e}")))?;
        let partition_ids = self.partition_ids.map(|ids| {
            ids.into_iter()
                .enumerate()
                .filter(|(row, _)| mask.is_valid(*row) && mask.value(*row))
                .map(|(_, id)| id)
                .collect()
        });
        Ok(Self {
            batch,
            partition_ids,
        })
    }

    /// Bytes held by the column buffers.
    pub fn memory_size(&self) -> usize {
        self.batch.get_array_memory_size()
    }
}

impl From<RecordBatch> for RowBatch {
    fn from(batch: RecordBatch) -> Self {
        Self::new(batch)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    #[test]
    fn filter_keeps_partition_ids_aligned() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![10, 20, 30, 40]))],
        )
        .expect("batch");
        let rb = RowBatch::new(batch)
            .with_partition_ids(vec![1, 2, 3, 4])
            .expect("ids");
        let mask = BooleanArray::from(vec![Some(true), None, Some(false), Some(true)]);
        let out = rb.filter(&mask).expect("filter");
        assert_eq!(out.num_rows(), 2);
        assert_eq!(out.partition_ids(), Some(&[1_i64, 4][..]));
    }

    #[test]
    fn mismatched_id_count_is_rejected() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2]))])
                .expect("batch");
        assert!(RowBatch::new(batch).with_partition_ids(vec![7]).is_err());
    }
}
