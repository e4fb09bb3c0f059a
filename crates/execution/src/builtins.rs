//! Built-in scalar functions available to every query.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Decimal128Array, Float64Array, Int64Array, StringArray,
};
use arrow_schema::DataType;
use tundra_common::{Result, TundraError};

use crate::udf::ScalarUdf;

pub(crate) fn builtin_udfs() -> Vec<Arc<dyn ScalarUdf>> {
    vec![
        Arc::new(AbsUdf),
        Arc::new(AddTwoNumberUdf),
        Arc::new(SubstringUdf),
        Arc::new(LowerUdf),
        Arc::new(PiUdf),
        Arc::new(VersionUdf),
    ]
}

fn check_arity(name: &str, arg_types: &[DataType], expected: usize) -> Result<()> {
    if arg_types.len() != expected {
        return Err(TundraError::Construction(format!(
            "{name} expects {expected} argument(s), got {}",
            arg_types.len()
        )));
    }
    Ok(())
}

fn arg<'a, T: 'static>(args: &'a [ArrayRef], idx: usize, name: &str) -> Result<&'a T> {
    args.get(idx)
        .and_then(|a| a.as_any().downcast_ref::<T>())
        .ok_or_else(|| TundraError::Evaluation(format!("{name}: bad argument {idx}")))
}

/// `abs(x)` for Int64, Float64 and Decimal128.
struct AbsUdf;

impl ScalarUdf for AbsUdf {
    fn name(&self) -> &str {
        "abs"
    }

    fn return_type(&self, arg_types: &[DataType]) -> Result<DataType> {
        check_arity("abs", arg_types, 1)?;
        match &arg_types[0] {
            dt @ (DataType::Int64 | DataType::Float64 | DataType::Decimal128(_, _)) => {
                Ok(dt.clone())
            }
            other => Err(TundraError::Unsupported(format!("abs({other})"))),
        }
    }

    fn invoke(&self, args: &[ArrayRef], _num_rows: usize) -> Result<ArrayRef> {
        let input = args
            .first()
            .ok_or_else(|| TundraError::Evaluation("abs: missing argument".to_string()))?;
        match input.data_type() {
            DataType::Int64 => {
                let a = arg::<Int64Array>(args, 0, "abs")?;
                let out: Int64Array = a.iter().map(|v| v.map(i64::wrapping_abs)).collect();
                Ok(Arc::new(out))
            }
            DataType::Float64 => {
                let a = arg::<Float64Array>(args, 0, "abs")?;
                let out: Float64Array = a.iter().map(|v| v.map(f64::abs)).collect();
                Ok(Arc::new(out))
            }
            DataType::Decimal128(precision, scale) => {
                let a = arg::<Decimal128Array>(args, 0, "abs")?;
                let out: Decimal128Array = a.iter().map(|v| v.map(i128::abs)).collect();
                let out = out
                    .with_precision_and_scale(*precision, *scale)
                    .map_err(|e| TundraError::Evaluation(format!("abs: {e}")))?;
                Ok(Arc::new(out))
            }
            other => Err(TundraError::Unsupported(format!("abs({other})"))),
        }
    }
}

/// `add_two_number(a, b)`: NULL when either side is NULL.
struct AddTwoNumberUdf;

impl ScalarUdf for AddTwoNumberUdf {
    fn name(&self) -> &str {
        "add_two_number"
    }

    fn return_type(&self, arg_types: &[DataType]) -> Result<DataType> {
        check_arity("add_two_number", arg_types, 2)?;
        if arg_types.iter().any(|t| *t != DataType::Int64) {
            return Err(TundraError::Unsupported(format!(
                "add_two_number({}, {})",
                arg_types[0], arg_types[1]
            )));
        }
        Ok(DataType::Int64)
    }

    fn invoke(&self, args: &[ArrayRef], _num_rows: usize) -> Result<ArrayRef> {
        let a = arg::<Int64Array>(args, 0, "add_two_number")?;
        let b = arg::<Int64Array>(args, 1, "add_two_number")?;
        let out: Int64Array = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| Some(x?.wrapping_add(y?)))
            .collect();
        Ok(Arc::new(out))
    }
}

/// `substring(s, begin, len)` with a zero-based character offset.
///
/// `len` is clamped to what remains after `begin`; negative values yield "".
struct SubstringUdf;

impl ScalarUdf for SubstringUdf {
    fn name(&self) -> &str {
        "substring"
    }

    fn return_type(&self, arg_types: &[DataType]) -> Result<DataType> {
        check_arity("substring", arg_types, 3)?;
        if arg_types[0] != DataType::Utf8
            || arg_types[1] != DataType::Int64
            || arg_types[2] != DataType::Int64
        {
            return Err(TundraError::Unsupported(format!(
                "substring({}, {}, {})",
                arg_types[0], arg_types[1], arg_types[2]
            )));
        }
        Ok(DataType::Utf8)
    }

    fn invoke(&self, args: &[ArrayRef], _num_rows: usize) -> Result<ArrayRef> {
        let s = arg::<StringArray>(args, 0, "substring")?;
        let begin = arg::<Int64Array>(args, 1, "substring")?;
        let len = arg::<Int64Array>(args, 2, "substring")?;
        let out: StringArray = s
            .iter()
            .zip(begin.iter())
            .zip(len.iter())
            .map(|((s, begin), len)| {
                let (s, begin, len) = (s?, begin?, len?);
                let begin = usize::try_from(begin).unwrap_or(0);
                let len = usize::try_from(len).unwrap_or(0);
                Some(s.chars().skip(begin).take(len).collect::<String>())
            })
            .collect();
        Ok(Arc::new(out))
    }
}

/// `lower(s)`: ASCII lowercase.
struct LowerUdf;

impl ScalarUdf for LowerUdf {
    fn name(&self) -> &str {
        "lower"
    }

    fn return_type(&self, arg_types: &[DataType]) -> Result<DataType> {
        check_arity("lower", arg_types, 1)?;
        if arg_types[0] != DataType::Utf8 {
            return Err(TundraError::Unsupported(format!("lower({})", arg_types[0])));
        }
        Ok(DataType::Utf8)
    }

    fn invoke(&self, args: &[ArrayRef], _num_rows: usize) -> Result<ArrayRef> {
        let s = arg::<StringArray>(args, 0, "lower")?;
        let out: StringArray = s.iter().map(|v| v.map(str::to_ascii_lowercase)).collect();
        Ok(Arc::new(out))
    }
}

struct PiUdf;

impl ScalarUdf for PiUdf {
    fn name(&self) -> &str {
        "pi"
    }

    fn return_type(&self, arg_types: &[DataType]) -> Result<DataType> {
        check_arity("pi", arg_types, 0)?;
        Ok(DataType::Float64)
    }

    fn invoke(&self, _args: &[ArrayRef], num_rows: usize) -> Result<ArrayRef> {
        Ok(Arc::new(Float64Array::from(vec![
            std::f64::consts::PI;
            num_rows
        ])))
    }
}

/// `version()`: engine version string.
struct VersionUdf;

impl ScalarUdf for VersionUdf {
    fn name(&self) -> &str {
        "version"
    }

    fn return_type(&self, arg_types: &[DataType]) -> Result<DataType> {
        check_arity("version", arg_types, 0)?;
        Ok(DataType::Utf8)
    }

    fn invoke(&self, _args: &[ArrayRef], num_rows: usize) -> Result<ArrayRef> {
        Ok(Arc::new(StringArray::from(vec![
            env!("CARGO_PKG_VERSION");
            num_rows
        ])))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Array, Float64Array, Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};

    use crate::expressions::{call, col, compile_expr, lit};

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Int64, true),
            Field::new("s", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![Some(-3), Some(4), None])),
                Arc::new(Int64Array::from(vec![Some(10), None, Some(1)])),
                Arc::new(StringArray::from(vec![Some("Hello"), Some("WORLD"), None])),
            ],
        )
        .expect("batch")
    }

    fn eval(expr: crate::expressions::Expr) -> arrow::array::ArrayRef {
        let b = batch();
        compile_expr(&expr, b.schema_ref())
            .expect("compile")
            .evaluate(&b)
            .expect("evaluate")
    }

    #[test]
    fn add_two_number_propagates_nulls() {
        let out = eval(call("add_two_number", vec![col("a"), col("b")]));
        let out = out.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(out.value(0), 7);
        assert!(out.is_null(1));
        assert!(out.is_null(2));
    }

    #[test]
    fn abs_lower_and_substring() {
        let out = eval(call("abs", vec![col("a")]));
        let out = out.as_any().downcast_ref::<Int64Array>().expect("int64");
        assert_eq!(out.value(0), 3);

        let out = eval(call("lower", vec![col("s")]));
        let out = out.as_any().downcast_ref::<StringArray>().expect("utf8");
        assert_eq!(out.value(1), "world");
        assert!(out.is_null(2));

        let out = eval(call("substring", vec![col("s"), lit(1_i64), lit(30_i64)]));
        let out = out.as_any().downcast_ref::<StringArray>().expect("utf8");
        assert_eq!(out.value(0), "ello");
    }

    #[test]
    fn zero_argument_functions_fill_the_batch() {
        let out = eval(call("pi", vec![]));
        let out = out.as_any().downcast_ref::<Float64Array>().expect("f64");
        assert_eq!(out.len(), 3);
        assert!((out.value(2) - std::f64::consts::PI).abs() < 1e-12);

        let out = eval(call("version", vec![]));
        let out = out.as_any().downcast_ref::<StringArray>().expect("utf8");
        assert_eq!(out.value(0), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn wrong_arity_fails_at_compile_time() {
        let b = batch();
        let err = compile_expr(&call("pi", vec![col("a")]), b.schema_ref())
            .err()
            .expect("arity");
        assert!(err.to_string().contains("pi expects 0"));
    }
}
