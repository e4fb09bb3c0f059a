use std::collections::VecDeque;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tundra_common::{MemoryReservation, PlanNodeId, Result, TundraError, MAX_HASH_LEVEL};

use crate::aggregate::accumulator::{
    avg_count, avg_count_col_name, final_value, init_states, intermediate_value,
    merge_state_value, normalized_type, update_state, AggExpr, AggSpec, AggState,
};
use crate::aggregate::hash_table::{GroupHashTable, HashTableCtx, Probe};
use crate::batch::RowBatch;
use crate::context::RuntimeState;
use crate::exec_node::ExecNode;
use crate::expressions::{compile_expr, evaluate_all, Expr, PhysicalExpr};
use crate::scalar::{row_key, scalar_from_array, scalars_to_array, ScalarValue};

const AGG_HASH_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// What the node's input rows are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateMode {
    /// Raw rows; aggregate arguments are evaluated per row.
    Update,
    /// Intermediate rows from another aggregation; states are merged.
    Merge,
}

/// Per-batch input of one aggregate.
enum AggColumn {
    /// `COUNT(*)`: the row itself.
    Rows,
    Values(ArrayRef),
    States {
        values: ArrayRef,
        counts: Option<ArrayRef>,
    },
}

/// Hash aggregation over a child node.
///
/// `open` consumes the whole child. Without group expressions every row
/// folds into one state vector; otherwise rows are grouped by key in a
/// [`GroupHashTable`]. Output is the finalized values, or with
/// `finalize == false` the intermediate layout: group columns, one state
/// column per aggregate, then one hidden count column per AVG.
pub struct AggregationNode {
    id: PlanNodeId,
    child: Box<dyn ExecNode>,
    mode: AggregateMode,
    finalize: bool,
    specs: Vec<AggSpec>,
    ctx: HashTableCtx,
    agg_inputs: Vec<Option<Arc<dyn PhysicalExpr>>>,
    avg_count_cols: Vec<Option<usize>>,
    num_group_exprs: usize,
    intermediate_schema: SchemaRef,
    output_schema: SchemaRef,
    table: GroupHashTable<Vec<AggState>>,
    singleton: Option<Vec<AggState>>,
    output: VecDeque<RecordBatch>,
    reservation: Option<MemoryReservation>,
    input_rows: u64,
    next_pressure_check: usize,
    max_level: u8,
    opened: bool,
    closed: bool,
    /// First failure of `open`; replayed by later `open`/`get_next` calls.
    failure: Option<TundraError>,
}

impl AggregationNode {
    /// Resolve types and compile expressions against the child's schema.
    ///
    /// In `Merge` mode the child must produce the intermediate layout and
    /// `group_exprs` only name its leading key columns.
    pub fn try_new(
        id: PlanNodeId,
        child: Box<dyn ExecNode>,
        group_exprs: Vec<Expr>,
        aggr_exprs: Vec<(AggExpr, String)>,
        mode: AggregateMode,
        finalize: bool,
    ) -> Result<Self> {
        if group_exprs.is_empty() && aggr_exprs.is_empty() {
            return Err(TundraError::Construction(
                "aggregation needs at least one group expression or aggregate".to_string(),
            ));
        }
        let input_schema = child.schema();
        let g = group_exprs.len();

        let (group_fields, specs, agg_inputs, avg_count_cols) = match mode {
            AggregateMode::Update => {
                let probe = group_exprs
                    .iter()
                    .map(|e| compile_expr(e, &input_schema))
                    .collect::<Result<Vec<_>>>()?;
                let group_fields = group_exprs
                    .iter()
                    .zip(&probe)
                    .map(|(e, p)| {
                        Field::new(e.output_name(), normalized_type(&p.data_type()), true)
                    })
                    .collect::<Vec<_>>();
                let mut specs = Vec::with_capacity(aggr_exprs.len());
                let mut inputs = Vec::with_capacity(aggr_exprs.len());
                for (agg, name) in aggr_exprs {
                    let input = agg
                        .input()
                        .map(|e| compile_expr(e, &input_schema))
                        .transpose()?;
                    let input_type = input.as_ref().map(|e| e.data_type());
                    specs.push(AggSpec::resolve(agg, name, input_type.as_ref())?);
                    inputs.push(input);
                }
                let counts = vec![None; specs.len()];
                (group_fields, specs, inputs, counts)
            }
            AggregateMode::Merge => {
                let fields = input_schema.fields();
                if fields.len() < g + aggr_exprs.len() {
                    return Err(TundraError::Construction(format!(
                        "merge input has {} columns, expected at least {}",
                        fields.len(),
                        g + aggr_exprs.len()
                    )));
                }
                let group_fields = fields[..g]
                    .iter()
                    .map(|f| f.as_ref().clone().with_nullable(true))
                    .collect::<Vec<_>>();
                let mut specs = Vec::with_capacity(aggr_exprs.len());
                let mut counts = Vec::with_capacity(aggr_exprs.len());
                for (i, (agg, name)) in aggr_exprs.into_iter().enumerate() {
                    let spec = AggSpec::from_state_column(agg, name, fields[g + i].data_type())?;
                    let count_col = if spec.is_avg() {
                        let hidden = avg_count_col_name(&spec.name);
                        Some(input_schema.index_of(&hidden).map_err(|_| {
                            TundraError::Construction(format!(
                                "merge input is missing column '{hidden}'"
                            ))
                        })?)
                    } else {
                        None
                    };
                    specs.push(spec);
                    counts.push(count_col);
                }
                let inputs = vec![None; specs.len()];
                (group_fields, specs, inputs, counts)
            }
        };

        let intermediate_schema = Arc::new(Schema::new(
            group_fields
                .iter()
                .cloned()
                .chain(specs.iter().map(|s| Field::new(&s.name, s.state_type.clone(), true)))
                .chain(
                    specs
                        .iter()
                        .filter(|s| s.is_avg())
                        .map(|s| Field::new(avg_count_col_name(&s.name), DataType::Int64, false)),
                )
                .collect::<Vec<_>>(),
        ));
        let output_schema = if finalize {
            Arc::new(Schema::new(
                group_fields
                    .iter()
                    .cloned()
                    .chain(specs.iter().map(|s| Field::new(&s.name, s.out_type.clone(), true)))
                    .collect::<Vec<_>>(),
            ))
        } else {
            Arc::clone(&intermediate_schema)
        };

        let build = group_fields
            .iter()
            .enumerate()
            .map(|(index, f)| {
                compile_expr(
                    &Expr::ColumnRef {
                        name: f.name().clone(),
                        index,
                    },
                    &intermediate_schema,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let probe = match mode {
            AggregateMode::Update => group_exprs
                .iter()
                .map(|e| compile_expr(e, &input_schema))
                .collect::<Result<Vec<_>>>()?,
            AggregateMode::Merge => build.clone(),
        };

        Ok(Self {
            id,
            child,
            mode,
            finalize,
            specs,
            ctx: HashTableCtx::new(AGG_HASH_SEED, build, probe),
            agg_inputs,
            avg_count_cols,
            num_group_exprs: g,
            intermediate_schema,
            output_schema,
            table: GroupHashTable::new(),
            singleton: None,
            output: VecDeque::new(),
            reservation: None,
            input_rows: 0,
            next_pressure_check: 0,
            max_level: MAX_HASH_LEVEL,
            opened: false,
            closed: false,
            failure: None,
        })
    }

    pub fn mode(&self) -> AggregateMode {
        self.mode
    }

    pub fn hash_level(&self) -> u8 {
        self.ctx.level()
    }

    pub fn hash_table_ctx(&self) -> &HashTableCtx {
        &self.ctx
    }

    pub fn num_groups(&self) -> usize {
        if self.num_group_exprs == 0 {
            usize::from(self.singleton.is_some())
        } else {
            self.table.len()
        }
    }

    pub fn input_rows(&self) -> u64 {
        self.input_rows
    }

    /// Schema of the output when `finalize` is false.
    pub fn intermediate_schema(&self) -> SchemaRef {
        Arc::clone(&self.intermediate_schema)
    }

    /// Move to the next hash level and rehash every group with its seed.
    pub fn raise_hash_level(&mut self) -> Result<u8> {
        let next = self.ctx.level().saturating_add(1);
        self.ctx.set_level(next)?;
        let ctx = &self.ctx;
        self.table.rehash(|key| ctx.hash_key(key));
        Ok(next)
    }

    /// Fold every row of `batch` into the single group.
    pub fn process_row_batch_no_grouping(&mut self, batch: &RecordBatch) -> Result<()> {
        let inputs = self.agg_columns(batch)?;
        let states = self.singleton.get_or_insert_with(|| init_states(&self.specs));
        for row in 0..batch.num_rows() {
            apply_row(states, &inputs, row)?;
        }
        self.input_rows += batch.num_rows() as u64;
        Ok(())
    }

    /// Fold every row of `batch` into its group, creating groups as needed.
    pub fn process_row_batch_with_grouping(&mut self, batch: &RecordBatch) -> Result<()> {
        let key_exprs = match self.mode {
            AggregateMode::Update => self.ctx.probe_expr_evals(),
            AggregateMode::Merge => self.ctx.build_expr_evals(),
        };
        let keys = evaluate_all(key_exprs, batch)?;
        let inputs = self.agg_columns(batch)?;
        for row in 0..batch.num_rows() {
            let key = row_key(&keys, row)?;
            let hash = self.ctx.hash_key(&key);
            let group = match self.table.find(hash, &key) {
                Probe::Found(group) => group,
                Probe::Vacant(slot) => {
                    self.table
                        .insert(slot, hash, key, init_states(&self.specs))?
                }
            };
            let states = self.table.state_mut(group).ok_or_else(|| {
                TundraError::Internal(format!("group {group:?} missing from hash table"))
            })?;
            apply_row(states, &inputs, row)?;
        }
        self.input_rows += batch.num_rows() as u64;
        self.check_memory_pressure()
    }

    fn agg_columns(&self, batch: &RecordBatch) -> Result<Vec<AggColumn>> {
        match self.mode {
            AggregateMode::Update => self
                .agg_inputs
                .iter()
                .map(|input| match input {
                    None => Ok(AggColumn::Rows),
                    Some(expr) => expr.evaluate(batch).map(AggColumn::Values),
                })
                .collect(),
            AggregateMode::Merge => {
                let expected = self.intermediate_schema.fields().len();
                if batch.num_columns() != expected {
                    return Err(TundraError::Internal(format!(
                        "merge batch has {} columns, expected {expected}",
                        batch.num_columns()
                    )));
                }
                Ok(self
                    .avg_count_cols
                    .iter()
                    .enumerate()
                    .map(|(i, count_col)| AggColumn::States {
                        values: Arc::clone(batch.column(self.num_group_exprs + i)),
                        counts: count_col.map(|c| Arc::clone(batch.column(c))),
                    })
                    .collect())
            }
        }
    }

    fn estimated_bytes(&self) -> usize {
        let per_group = self.specs.len() * std::mem::size_of::<AggState>();
        self.table.estimated_bytes() + self.table.len() * per_group
    }

    fn check_memory_pressure(&mut self) -> Result<()> {
        let Some(signal) = self.reservation.as_ref().map(MemoryReservation::signal) else {
            return Ok(());
        };
        let estimated = self.estimated_bytes();
        if estimated < self.next_pressure_check || !signal.should_repartition(estimated) {
            return Ok(());
        }
        if self.ctx.level() >= self.max_level {
            warn!(
                node_id = %self.id,
                estimated_bytes = estimated,
                "memory pressure at maximum hash level"
            );
            self.next_pressure_check = usize::MAX;
            return Ok(());
        }
        let level = self.raise_hash_level()?;
        warn!(
            node_id = %self.id,
            level,
            estimated_bytes = estimated,
            granted_bytes = signal.granted_bytes,
            pressure = ?signal.pressure,
            "memory pressure, raised aggregation hash level"
        );
        self.next_pressure_check = estimated.saturating_mul(2);
        Ok(())
    }

    fn build_output(&mut self, batch_size: usize) -> Result<()> {
        let empty = Vec::new();
        let groups: Vec<(&[ScalarValue], &[AggState])> = if self.num_group_exprs == 0 {
            let states = self.singleton.get_or_insert_with(|| init_states(&self.specs));
            vec![(&empty[..], states.as_slice())]
        } else {
            self.table
                .iter()
                .map(|(_, key, states)| (key, states.as_slice()))
                .collect()
        };

        for chunk in groups.chunks(batch_size.max(1)) {
            let mut columns = Vec::with_capacity(self.output_schema.fields().len());
            for (i, field) in self.output_schema.fields()[..self.num_group_exprs]
                .iter()
                .enumerate()
            {
                let values = chunk.iter().map(|(key, _)| key[i].clone()).collect::<Vec<_>>();
                columns.push(scalars_to_array(&values, field.data_type())?);
            }
            for (j, spec) in self.specs.iter().enumerate() {
                let values = chunk
                    .iter()
                    .map(|(_, states)| {
                        if self.finalize {
                            final_value(&states[j])
                        } else {
                            intermediate_value(&states[j])
                        }
                    })
                    .collect::<Vec<_>>();
                let dt = if self.finalize {
                    &spec.out_type
                } else {
                    &spec.state_type
                };
                columns.push(scalars_to_array(&values, dt)?);
            }
            if !self.finalize {
                for (j, _) in self.specs.iter().enumerate().filter(|(_, s)| s.is_avg()) {
                    let counts = chunk
                        .iter()
                        .map(|(_, states)| ScalarValue::Int64(avg_count(&states[j])))
                        .collect::<Vec<_>>();
                    columns.push(scalars_to_array(&counts, &DataType::Int64)?);
                }
            }
            let batch = RecordBatch::try_new(Arc::clone(&self.output_schema), columns)
                .map_err(|e| TundraError::Internal(format!("aggregation output batch: {e}")))?;
            self.output.push_back(batch);
        }
        Ok(())
    }

    /// Drain the child into the hash table and build the output batches.
    fn consume_input(&mut self, state: &RuntimeState) -> Result<()> {
        self.max_level = state.config().max_hash_level.min(MAX_HASH_LEVEL);
        self.reservation = Some(state.memory().reserve(state.config().mem_budget_bytes));
        self.child.open(state)?;
        while let Some(batch) = self.child.get_next(state)? {
            if state.is_cancelled() {
                return Err(TundraError::Cancelled);
            }
            let batch = batch.into_record_batch();
            if self.num_group_exprs == 0 {
                self.process_row_batch_no_grouping(&batch)?;
            } else {
                self.process_row_batch_with_grouping(&batch)?;
            }
            debug!(
                node_id = %self.id,
                rows = batch.num_rows(),
                groups = self.num_groups(),
                "aggregated batch"
            );
        }
        self.build_output(state.config().batch_size_rows)?;
        state.metrics().record_aggregation(
            &state.query_id().to_string(),
            self.id.0,
            self.input_rows,
            self.num_groups(),
            self.ctx.level(),
        );
        info!(
            node_id = %self.id,
            mode = ?self.mode,
            input_rows = self.input_rows,
            groups = self.num_groups(),
            hash_level = self.ctx.level(),
            "aggregation input consumed"
        );
        Ok(())
    }
}

fn apply_row(states: &mut [AggState], inputs: &[AggColumn], row: usize) -> Result<()> {
    for (state, input) in states.iter_mut().zip(inputs) {
        match input {
            AggColumn::Rows => update_state(state, None)?,
            AggColumn::Values(values) => {
                update_state(state, Some(&scalar_from_array(values, row)?))?;
            }
            AggColumn::States { values, counts } => {
                let count = match counts {
                    Some(c) => match scalar_from_array(c, row)? {
                        ScalarValue::Int64(n) => Some(n),
                        _ => None,
                    },
                    None => None,
                };
                merge_state_value(state, &scalar_from_array(values, row)?, count)?;
            }
        }
    }
    Ok(())
}

impl ExecNode for AggregationNode {
    fn name(&self) -> &'static str {
        "AggregationNode"
    }

    fn id(&self) -> PlanNodeId {
        self.id
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    fn open(&mut self, state: &RuntimeState) -> Result<()> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if self.opened {
            return Ok(());
        }
        match self.consume_input(state) {
            Ok(()) => {
                self.opened = true;
                Ok(())
            }
            Err(err) => {
                self.failure = Some(err.clone());
                Err(err)
            }
        }
    }

    fn get_next(&mut self, state: &RuntimeState) -> Result<Option<RowBatch>> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if !self.opened {
            return Err(TundraError::Internal(
                "aggregation get_next called before open".to_string(),
            ));
        }
        if state.is_cancelled() {
            return Err(TundraError::Cancelled);
        }
        Ok(self.output.pop_front().map(RowBatch::new))
    }

    fn close(&mut self, state: &RuntimeState) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.output.clear();
        self.table.clear();
        self.singleton = None;
        self.reservation = None;
        self.child.close(state)
    }
}
