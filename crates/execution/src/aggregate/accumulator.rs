use std::cmp::Ordering;

use arrow_schema::DataType;
use serde::{Deserialize, Serialize};
use tundra_common::decimal::{ARROW_PRECISION, ARROW_SCALE};
use tundra_common::{Decimal12, Result, TundraError};

use crate::expressions::Expr;
use crate::scalar::ScalarValue;

/// Aggregate function applied per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggExpr {
    CountStar,
    Count(Expr),
    Sum(Expr),
    Min(Expr),
    Max(Expr),
    Avg(Expr),
}

impl AggExpr {
    /// Argument expression; `None` for `COUNT(*)`.
    pub fn input(&self) -> Option<&Expr> {
        match self {
            Self::CountStar => None,
            Self::Count(e) | Self::Sum(e) | Self::Min(e) | Self::Max(e) | Self::Avg(e) => Some(e),
        }
    }
}

/// An aggregate plus its resolved types.
#[derive(Debug, Clone)]
pub(crate) struct AggSpec {
    pub expr: AggExpr,
    pub name: String,
    /// Type of the single state column in the intermediate layout.
    pub state_type: DataType,
    /// Type of the finalized output column.
    pub out_type: DataType,
}

impl AggSpec {
    /// Resolve types from the argument type (raw input) of the aggregate.
    pub fn resolve(expr: AggExpr, name: String, input_type: Option<&DataType>) -> Result<Self> {
        let unsupported = |dt: &DataType| {
            TundraError::Unsupported(format!("{expr:?} over {dt} is not supported"))
        };
        let (state_type, out_type) = match (&expr, input_type) {
            (AggExpr::CountStar, _) | (AggExpr::Count(_), _) => (DataType::Int64, DataType::Int64),
            (AggExpr::Sum(_), Some(dt)) => {
                let t = match normalized_type(dt) {
                    t @ (DataType::Int64 | DataType::Float64) => t,
                    DataType::Decimal128(_, s) if s == ARROW_SCALE => {
                        DataType::Decimal128(ARROW_PRECISION, ARROW_SCALE)
                    }
                    other => return Err(unsupported(&other)),
                };
                (t.clone(), t)
            }
            (AggExpr::Min(_) | AggExpr::Max(_), Some(dt)) => {
                let t = normalized_type(dt);
                match t {
                    DataType::Boolean
                    | DataType::Int64
                    | DataType::Float64
                    | DataType::Utf8
                    | DataType::Decimal128(_, ARROW_SCALE) => (t.clone(), t),
                    other => return Err(unsupported(&other)),
                }
            }
            (AggExpr::Avg(_), Some(dt)) => match normalized_type(dt) {
                DataType::Int64 | DataType::Float64 => (DataType::Float64, DataType::Float64),
                other => return Err(unsupported(&other)),
            },
            (_, None) => {
                return Err(TundraError::Internal(format!(
                    "{expr:?} requires an argument type"
                )));
            }
        };
        Ok(Self {
            expr,
            name,
            state_type,
            out_type,
        })
    }

    /// Resolve types from an intermediate state column.
    pub fn from_state_column(expr: AggExpr, name: String, state_type: &DataType) -> Result<Self> {
        let input = match &expr {
            AggExpr::Avg(_) => DataType::Float64,
            _ => state_type.clone(),
        };
        let spec = Self::resolve(expr, name, Some(&input))?;
        if spec.state_type != *state_type {
            return Err(TundraError::Construction(format!(
                "state column for '{}' has type {state_type}, expected {}",
                spec.name, spec.state_type
            )));
        }
        Ok(spec)
    }

    pub fn is_avg(&self) -> bool {
        matches!(self.expr, AggExpr::Avg(_))
    }
}

/// Type produced by `scalar_from_array` for a column of type `dt`.
pub(crate) fn normalized_type(dt: &DataType) -> DataType {
    match dt {
        DataType::Int8 | DataType::Int16 | DataType::Int32 => DataType::Int64,
        DataType::Float32 => DataType::Float64,
        DataType::LargeUtf8 => DataType::Utf8,
        DataType::Decimal128(_, s) if *s == ARROW_SCALE => {
            DataType::Decimal128(ARROW_PRECISION, ARROW_SCALE)
        }
        other => other.clone(),
    }
}

/// Running accumulator for one aggregate of one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggState {
    Count(i64),
    SumInt(Option<i64>),
    SumFloat(Option<f64>),
    SumDecimal(Option<Decimal12>),
    Min(Option<ScalarValue>),
    Max(Option<ScalarValue>),
    Avg { sum: f64, count: i64 },
}

impl AggState {
    pub(crate) fn estimate_bytes(&self) -> usize {
        match self {
            Self::Min(Some(v)) | Self::Max(Some(v)) => 16 + v.estimate_bytes(),
            _ => 24,
        }
    }
}

pub(crate) fn init_states(specs: &[AggSpec]) -> Vec<AggState> {
    specs
        .iter()
        .map(|s| match s.expr {
            AggExpr::CountStar | AggExpr::Count(_) => AggState::Count(0),
            AggExpr::Sum(_) => match s.out_type {
                DataType::Int64 => AggState::SumInt(None),
                DataType::Float64 => AggState::SumFloat(None),
                _ => AggState::SumDecimal(None),
            },
            AggExpr::Min(_) => AggState::Min(None),
            AggExpr::Max(_) => AggState::Max(None),
            AggExpr::Avg(_) => AggState::Avg { sum: 0.0, count: 0 },
        })
        .collect()
}

/// Fold one raw input value into `state`. `None` is the row itself for `COUNT(*)`.
pub(crate) fn update_state(state: &mut AggState, value: Option<&ScalarValue>) -> Result<()> {
    let Some(value) = value else {
        if let AggState::Count(acc) = state {
            *acc += 1;
            return Ok(());
        }
        return Err(TundraError::Internal(
            "only COUNT(*) accepts rows without an argument".to_string(),
        ));
    };
    if value.is_null() {
        return Ok(());
    }
    match state {
        AggState::Count(acc) => *acc += 1,
        AggState::Avg { sum, count } => {
            *sum += as_f64(value)?;
            *count += 1;
        }
        other => fold_value(other, value)?,
    }
    Ok(())
}

/// Fold one intermediate state value into `state`.
///
/// `avg_count` carries the hidden count column for AVG states.
pub(crate) fn merge_state_value(
    state: &mut AggState,
    value: &ScalarValue,
    avg_count: Option<i64>,
) -> Result<()> {
    match state {
        AggState::Count(acc) => {
            if let ScalarValue::Int64(v) = value {
                *acc = acc
                    .checked_add(*v)
                    .ok_or_else(|| TundraError::Evaluation("count overflow".to_string()))?;
            }
        }
        AggState::Avg { sum, count } => {
            if !value.is_null() {
                *sum += as_f64(value)?;
            }
            *count += avg_count.unwrap_or(0);
        }
        other => {
            if !value.is_null() {
                fold_value(other, value)?;
            }
        }
    }
    Ok(())
}

fn fold_value(state: &mut AggState, value: &ScalarValue) -> Result<()> {
    match (state, value) {
        (AggState::SumInt(acc), ScalarValue::Int64(v)) => {
            let next = acc.unwrap_or(0).checked_add(*v).ok_or_else(|| {
                TundraError::Evaluation("integer overflow in SUM".to_string())
            })?;
            *acc = Some(next);
        }
        (AggState::SumFloat(acc), v) => *acc = Some(acc.unwrap_or(0.0) + as_f64(v)?),
        (AggState::SumDecimal(acc), ScalarValue::Decimal(v)) => {
            *acc = Some(acc.unwrap_or(Decimal12::ZERO).checked_add(*v)?);
        }
        (AggState::Min(cur), v) => replace_if(cur, v, Ordering::Less)?,
        (AggState::Max(cur), v) => replace_if(cur, v, Ordering::Greater)?,
        (state, v) => {
            return Err(TundraError::Internal(format!(
                "cannot fold {} into {state:?}",
                v.data_type()
            )));
        }
    }
    Ok(())
}

fn replace_if(cur: &mut Option<ScalarValue>, v: &ScalarValue, wanted: Ordering) -> Result<()> {
    let replace = match cur {
        None => true,
        Some(c) => v.try_cmp(c)? == wanted,
    };
    if replace {
        *cur = Some(v.clone());
    }
    Ok(())
}

fn as_f64(v: &ScalarValue) -> Result<f64> {
    v.as_f64().ok_or_else(|| {
        TundraError::Internal(format!("expected numeric value, got {}", v.data_type()))
    })
}

/// Finalized output value.
pub(crate) fn final_value(state: &AggState) -> ScalarValue {
    match state {
        AggState::Avg { sum, count } => {
            if *count == 0 {
                ScalarValue::Null
            } else {
                ScalarValue::float64(sum / (*count as f64))
            }
        }
        other => intermediate_value(other),
    }
}

/// Value of the state column in the intermediate layout. AVG yields its sum.
pub(crate) fn intermediate_value(state: &AggState) -> ScalarValue {
    match state {
        AggState::Count(v) => ScalarValue::Int64(*v),
        AggState::SumInt(v) => v.map_or(ScalarValue::Null, ScalarValue::Int64),
        AggState::SumFloat(v) => v.map_or(ScalarValue::Null, ScalarValue::float64),
        AggState::SumDecimal(v) => v.map_or(ScalarValue::Null, ScalarValue::Decimal),
        AggState::Min(v) | AggState::Max(v) => v.clone().unwrap_or(ScalarValue::Null),
        AggState::Avg { sum, .. } => ScalarValue::float64(*sum),
    }
}

pub(crate) fn avg_count(state: &AggState) -> i64 {
    match state {
        AggState::Avg { count, .. } => *count,
        _ => 0,
    }
}

pub(crate) fn avg_count_col_name(name: &str) -> String {
    format!("__tundra_avg_count_{name}")
}
