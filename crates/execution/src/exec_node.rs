use std::collections::VecDeque;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use tundra_common::{PlanNodeId, Result, TundraError};

use crate::batch::RowBatch;
use crate::context::RuntimeState;

/// A pull-based physical operator.
///
/// Lifecycle: `open` once, `get_next` until it yields `None`, then `close`.
/// `close` must be callable after any earlier failure and more than once.
/// A node is driven by a single consumer thread.
pub trait ExecNode: Send {
    fn name(&self) -> &'static str;

    fn id(&self) -> PlanNodeId;

    fn schema(&self) -> SchemaRef;

    fn open(&mut self, state: &RuntimeState) -> Result<()>;

    /// Next batch, or `None` at end of stream.
    fn get_next(&mut self, state: &RuntimeState) -> Result<Option<RowBatch>>;

    fn close(&mut self, state: &RuntimeState) -> Result<()>;
}

/// Source node replaying a fixed list of batches.
#[derive(Debug)]
pub struct ValuesNode {
    id: PlanNodeId,
    schema: SchemaRef,
    batches: VecDeque<RecordBatch>,
}

impl ValuesNode {
    pub fn try_new(id: PlanNodeId, schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self> {
        if let Some(bad) = batches.iter().find(|b| b.schema() != schema) {
            return Err(TundraError::Construction(format!(
                "values batch schema {:?} does not match node schema {:?}",
                bad.schema(),
                schema
            )));
        }
        Ok(Self {
            id,
            schema,
            batches: batches.into(),
        })
    }
}

impl ExecNode for ValuesNode {
    fn name(&self) -> &'static str {
        "ValuesNode"
    }

    fn id(&self) -> PlanNodeId {
        self.id
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn open(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    fn get_next(&mut self, state: &RuntimeState) -> Result<Option<RowBatch>> {
        if state.is_cancelled() {
            return Err(TundraError::Cancelled);
        }
        Ok(self.batches.pop_front().map(RowBatch::new))
    }

    fn close(&mut self, _state: &RuntimeState) -> Result<()> {
        self.batches.clear();
        Ok(())
    }
}
