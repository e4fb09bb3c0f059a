//! Expression compilation and evaluation.
//!
//! Input contract:
//! - callers hand in an [`Expr`] tree plus the schema of the batches it will see;
//! - arithmetic operands must already share a type (insert `Cast` otherwise).
//!
//! Output contract:
//! - each evaluation returns an `ArrayRef` aligned to the input batch row count.

mod expr;

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray};
use arrow::compute::is_null;
use arrow::compute::kernels::{
    boolean::{and_kleene, not, or_kleene},
    cast::cast,
    cmp::{eq, gt, gt_eq, lt, lt_eq, neq},
    numeric::{add, div, mul, sub},
};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use tundra_common::{Result, TundraError};

use crate::scalar::ScalarValue;
use crate::udf::{get_scalar_udf, ScalarUdf};

pub use expr::{call, col, lit, BinaryOp, Expr};

/// Executable expression compiled against one input schema.
///
/// Implementations keep no per-row state, so one compiled expression can be
/// shared by every worker thread of a scan.
pub trait PhysicalExpr: Send + Sync {
    /// Static output data type of this expression.
    fn data_type(&self) -> DataType;
    /// Evaluate the expression for every row in `batch`.
    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef>;
}

/// Compile an [`Expr`] into a runnable expression for batches of `input_schema`.
pub fn compile_expr(expr: &Expr, input_schema: &SchemaRef) -> Result<Arc<dyn PhysicalExpr>> {
    match expr {
        Expr::ColumnRef { index, name } => {
            if *index >= input_schema.fields().len() {
                return Err(TundraError::Construction(format!(
                    "column '{name}' index {index} out of range for {} input columns",
                    input_schema.fields().len()
                )));
            }
            let dt = input_schema.field(*index).data_type().clone();
            Ok(Arc::new(ColumnExpr { index: *index, dt }))
        }
        Expr::Column(name) => {
            let idx = input_schema.index_of(name).map_err(|_| {
                TundraError::Construction(format!("unknown column in expression: {name}"))
            })?;
            let dt = input_schema.field(idx).data_type().clone();
            Ok(Arc::new(ColumnExpr { index: idx, dt }))
        }

        Expr::Literal(v) => Ok(Arc::new(LiteralExpr { v: v.clone() })),

        Expr::Cast { expr, to_type } => {
            let inner = compile_expr(expr, input_schema)?;
            if !arrow::compute::can_cast_types(&inner.data_type(), to_type) {
                return Err(TundraError::Construction(format!(
                    "cannot cast {} to {to_type}",
                    inner.data_type()
                )));
            }
            Ok(Arc::new(CastExpr {
                inner,
                to_type: to_type.clone(),
            }))
        }

        Expr::Not(e) => {
            let inner = compile_expr(e, input_schema)?;
            Ok(Arc::new(NotExpr { inner }))
        }

        Expr::IsNull(e) => {
            let inner = compile_expr(e, input_schema)?;
            Ok(Arc::new(IsNullExpr { inner }))
        }

        Expr::And(a, b) | Expr::Or(a, b) => {
            let op = if matches!(expr, Expr::And(..)) {
                BoolOp::And
            } else {
                BoolOp::Or
            };
            Ok(Arc::new(BoolBinaryExpr {
                left: compile_expr(a, input_schema)?,
                right: compile_expr(b, input_schema)?,
                op,
            }))
        }

        Expr::BinaryOp { left, op, right } => {
            let l = compile_expr(left, input_schema)?;
            let r = compile_expr(right, input_schema)?;
            let out = binary_out_type(*op, &l.data_type(), &r.data_type())?;
            Ok(Arc::new(BinaryExpr {
                left: l,
                right: r,
                op: *op,
                out,
            }))
        }

        Expr::ScalarUdf { name, args } => {
            let compiled_args = args
                .iter()
                .map(|a| compile_expr(a, input_schema))
                .collect::<Result<Vec<_>>>()?;
            let udf = get_scalar_udf(name).ok_or_else(|| {
                TundraError::Construction(format!("scalar udf '{name}' is not registered"))
            })?;
            let arg_types = compiled_args
                .iter()
                .map(|arg| arg.data_type())
                .collect::<Vec<_>>();
            let out = udf.return_type(&arg_types)?;
            Ok(Arc::new(ScalarUdfExpr {
                udf,
                args: compiled_args,
                out,
            }))
        }
    }
}

/// Evaluate every expression over `batch`, in order.
pub fn evaluate_all(exprs: &[Arc<dyn PhysicalExpr>], batch: &RecordBatch) -> Result<Vec<ArrayRef>> {
    exprs.iter().map(|e| e.evaluate(batch)).collect()
}

/// Evaluate a predicate and require a boolean result.
pub fn evaluate_predicate(expr: &dyn PhysicalExpr, batch: &RecordBatch) -> Result<BooleanArray> {
    let out = expr.evaluate(batch)?;
    out.as_any()
        .downcast_ref::<BooleanArray>()
        .cloned()
        .ok_or_else(|| {
            TundraError::Evaluation(format!(
                "predicate evaluated to {} instead of Boolean",
                out.data_type()
            ))
        })
}

struct ColumnExpr {
    index: usize,
    dt: DataType,
}

impl PhysicalExpr for ColumnExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        Ok(Arc::clone(batch.column(self.index)))
    }
}

struct LiteralExpr {
    v: ScalarValue,
}

impl PhysicalExpr for LiteralExpr {
    fn data_type(&self) -> DataType {
        self.v.data_type()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        self.v.to_array(batch.num_rows())
    }
}

struct CastExpr {
    inner: Arc<dyn PhysicalExpr>,
    to_type: DataType,
}

impl PhysicalExpr for CastExpr {
    fn data_type(&self) -> DataType {
        self.to_type.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        cast(&arr, &self.to_type).map_err(|e| TundraError::Evaluation(format!("cast failed: {e}")))
    }
}

struct NotExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for NotExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let b = evaluate_predicate(self.inner.as_ref(), batch)?;
        let out = not(&b).map_err(|e| TundraError::Evaluation(format!("not failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

struct IsNullExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for IsNullExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let out = is_null(arr.as_ref())
            .map_err(|e| TundraError::Evaluation(format!("is_null failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

#[derive(Clone, Copy)]
enum BoolOp {
    And,
    Or,
}

struct BoolBinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BoolOp,
}

impl PhysicalExpr for BoolBinaryExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let lb = evaluate_predicate(self.left.as_ref(), batch)?;
        let rb = evaluate_predicate(self.right.as_ref(), batch)?;
        let out = match self.op {
            BoolOp::And => and_kleene(&lb, &rb),
            BoolOp::Or => or_kleene(&lb, &rb),
        }
        .map_err(|e| TundraError::Evaluation(format!("boolean kernel failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

struct BinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BinaryOp,
    out: DataType,
}

impl PhysicalExpr for BinaryExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        if self.op.is_comparison() {
            eval_cmp(self.op, &l, &r)
        } else {
            eval_arith(self.op, &l, &r)
        }
    }
}

struct ScalarUdfExpr {
    udf: Arc<dyn ScalarUdf>,
    args: Vec<Arc<dyn PhysicalExpr>>,
    out: DataType,
}

impl PhysicalExpr for ScalarUdfExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arrays = self
            .args
            .iter()
            .map(|arg| arg.evaluate(batch))
            .collect::<Result<Vec<_>>>()?;
        self.udf.invoke(&arrays, batch.num_rows()).map_err(|e| match e {
            TundraError::Evaluation(msg) => {
                TundraError::Evaluation(format!("scalar udf '{}' failed: {msg}", self.udf.name()))
            }
            other => other,
        })
    }
}

fn binary_out_type(op: BinaryOp, l: &DataType, r: &DataType) -> Result<DataType> {
    if l != r {
        return Err(TundraError::Construction(format!(
            "operands of {op:?} must share a type; got {l} vs {r}"
        )));
    }
    if op.is_comparison() {
        return Ok(DataType::Boolean);
    }
    match l {
        DataType::Int64 | DataType::Float64 => Ok(l.clone()),
        other => Err(TundraError::Unsupported(format!(
            "arithmetic not supported for type {other}"
        ))),
    }
}

fn eval_arith(op: BinaryOp, l: &ArrayRef, r: &ArrayRef) -> Result<ArrayRef> {
    match op {
        BinaryOp::Plus => add(l, r),
        BinaryOp::Minus => sub(l, r),
        BinaryOp::Multiply => mul(l, r),
        BinaryOp::Divide => div(l, r),
        other => {
            return Err(TundraError::Internal(format!(
                "{other:?} is not an arithmetic operator"
            )));
        }
    }
    .map_err(|e| TundraError::Evaluation(format!("arith kernel failed: {e}")))
}

fn eval_cmp(op: BinaryOp, l: &ArrayRef, r: &ArrayRef) -> Result<ArrayRef> {
    let res = match op {
        BinaryOp::Eq => eq(l, r),
        BinaryOp::NotEq => neq(l, r),
        BinaryOp::Lt => lt(l, r),
        BinaryOp::LtEq => lt_eq(l, r),
        BinaryOp::Gt => gt(l, r),
        BinaryOp::GtEq => gt_eq(l, r),
        other => {
            return Err(TundraError::Internal(format!(
                "{other:?} is not a comparison operator"
            )));
        }
    }
    .map_err(|e| TundraError::Evaluation(format!("cmp kernel failed: {e}")))?;
    Ok(Arc::new(res))
}
