//! Owned single values extracted from Arrow arrays.
//!
//! Group keys, partition bounds, literals and MIN/MAX states are all kept as
//! [`ScalarValue`]s so they can be hashed, compared and serialized without
//! holding on to the batch they came from.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Decimal128Array, Decimal128Builder,
    Float32Array, Float64Array, Float64Builder, Int16Array, Int32Array, Int64Array, Int64Builder,
    Int8Array, LargeStringArray, StringArray, StringBuilder,
};
use arrow_schema::DataType;
use serde::{Deserialize, Serialize};
use tundra_common::decimal::{ARROW_PRECISION, ARROW_SCALE};
use tundra_common::{Decimal12, Result, TundraError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int64(i64),
    /// `f64` stored by bit pattern so the value is `Eq` and `Hash`. Build it
    /// with [`ScalarValue::float64`] so equal floats share one pattern.
    Float64Bits(u64),
    Utf8(String),
    Decimal(Decimal12),
}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Null => 0_u8.hash(state),
            Self::Boolean(v) => {
                1_u8.hash(state);
                v.hash(state);
            }
            Self::Int64(v) => {
                2_u8.hash(state);
                v.hash(state);
            }
            Self::Float64Bits(v) => {
                3_u8.hash(state);
                v.hash(state);
            }
            Self::Utf8(v) => {
                4_u8.hash(state);
                v.hash(state);
            }
            Self::Decimal(v) => {
                5_u8.hash(state);
                v.hash(state);
            }
        }
    }
}

impl ScalarValue {
    /// `-0.0` folds into `0.0` and every NaN into `f64::NAN`.
    pub fn float64(v: f64) -> Self {
        let v = if v.is_nan() {
            f64::NAN
        } else if v == 0.0 {
            0.0
        } else {
            v
        };
        Self::Float64Bits(v.to_bits())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Arrow type a column of this value would have.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Null => DataType::Null,
            Self::Boolean(_) => DataType::Boolean,
            Self::Int64(_) => DataType::Int64,
            Self::Float64Bits(_) => DataType::Float64,
            Self::Utf8(_) => DataType::Utf8,
            Self::Decimal(_) => DataType::Decimal128(ARROW_PRECISION, ARROW_SCALE),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(*v as f64),
            Self::Float64Bits(v) => Some(f64::from_bits(*v)),
            _ => None,
        }
    }

    /// Total order used by MIN/MAX and partition bounds. NULL sorts first.
    ///
    /// Int64 and Float64 compare numerically; any other type mix is an error.
    pub fn try_cmp(&self, other: &Self) -> Result<Ordering> {
        use ScalarValue::*;
        Ok(match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Int64(a), Int64(b)) => a.cmp(b),
            (Float64Bits(a), Float64Bits(b)) => f64::from_bits(*a).total_cmp(&f64::from_bits(*b)),
            (Int64(a), Float64Bits(b)) => (*a as f64).total_cmp(&f64::from_bits(*b)),
            (Float64Bits(a), Int64(b)) => f64::from_bits(*a).total_cmp(&(*b as f64)),
            (Utf8(a), Utf8(b)) => a.cmp(b),
            (Decimal(a), Decimal(b)) => a.cmp(b),
            (a, b) => {
                return Err(TundraError::Evaluation(format!(
                    "cannot compare {} with {}",
                    a.data_type(),
                    b.data_type()
                )));
            }
        })
    }

    /// Rough heap + inline footprint, used for memory pressure checks.
    pub fn estimate_bytes(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Boolean(_) => 1,
            Self::Int64(_) | Self::Float64Bits(_) => 8,
            Self::Utf8(s) => s.len() + 24,
            Self::Decimal(_) => 12,
        }
    }

    /// Column of `len` copies of this value.
    pub fn to_array(&self, len: usize) -> Result<ArrayRef> {
        scalars_to_array(&vec![self.clone(); len], &self.data_type())
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        Self::float64(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        Self::Utf8(v.to_string())
    }
}

impl From<Decimal12> for ScalarValue {
    fn from(v: Decimal12) -> Self {
        Self::Decimal(v)
    }
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, what: &str) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| TundraError::Internal(format!("expected {what}")))
}

/// Read row `row` of `array`. Narrow integers widen to Int64, Float32 to Float64.
pub fn scalar_from_array(array: &ArrayRef, row: usize) -> Result<ScalarValue> {
    if array.is_null(row) {
        return Ok(ScalarValue::Null);
    }
    match array.data_type() {
        DataType::Null => Ok(ScalarValue::Null),
        DataType::Boolean => Ok(ScalarValue::Boolean(
            downcast::<BooleanArray>(array, "BooleanArray")?.value(row),
        )),
        DataType::Int8 => Ok(ScalarValue::Int64(
            downcast::<Int8Array>(array, "Int8Array")?.value(row).into(),
        )),
        DataType::Int16 => Ok(ScalarValue::Int64(
            downcast::<Int16Array>(array, "Int16Array")?.value(row).into(),
        )),
        DataType::Int32 => Ok(ScalarValue::Int64(
            downcast::<Int32Array>(array, "Int32Array")?.value(row).into(),
        )),
        DataType::Int64 => Ok(ScalarValue::Int64(
            downcast::<Int64Array>(array, "Int64Array")?.value(row),
        )),
        DataType::Float32 => Ok(ScalarValue::float64(
            downcast::<Float32Array>(array, "Float32Array")?.value(row).into(),
        )),
        DataType::Float64 => Ok(ScalarValue::float64(
            downcast::<Float64Array>(array, "Float64Array")?.value(row),
        )),
        DataType::Utf8 => Ok(ScalarValue::Utf8(
            downcast::<StringArray>(array, "StringArray")?
                .value(row)
                .to_string(),
        )),
        DataType::LargeUtf8 => Ok(ScalarValue::Utf8(
            downcast::<LargeStringArray>(array, "LargeStringArray")?
                .value(row)
                .to_string(),
        )),
        DataType::Decimal128(_, scale) if *scale == ARROW_SCALE => {
            let raw = downcast::<Decimal128Array>(array, "Decimal128Array")?.value(row);
            Ok(ScalarValue::Decimal(Decimal12::from_scaled_i128(raw)?))
        }
        other => Err(TundraError::Unsupported(format!(
            "scalar type not supported: {other}"
        ))),
    }
}

/// Row `row` of every column, as an owned key.
pub fn row_key(columns: &[ArrayRef], row: usize) -> Result<Vec<ScalarValue>> {
    columns.iter().map(|c| scalar_from_array(c, row)).collect()
}

/// Build an array of type `dt` from owned values. `Null` entries become nulls.
pub fn scalars_to_array(values: &[ScalarValue], dt: &DataType) -> Result<ArrayRef> {
    let mismatch = |v: &ScalarValue| {
        TundraError::Internal(format!(
            "type mismatch while building {dt} array: got {}",
            v.data_type()
        ))
    };
    match dt {
        DataType::Null => Ok(arrow::array::new_null_array(dt, values.len())),
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Boolean(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(mismatch(other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Int64(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(mismatch(other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Float64Bits(x) => b.append_value(f64::from_bits(*x)),
                    ScalarValue::Int64(x) => b.append_value(*x as f64),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(mismatch(other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::with_capacity(values.len(), values.len() * 8);
            for v in values {
                match v {
                    ScalarValue::Utf8(x) => b.append_value(x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(mismatch(other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Decimal128(precision, scale) if *scale == ARROW_SCALE => {
            let mut b = Decimal128Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Decimal(x) => b.append_value(x.to_scaled_i128()),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(mismatch(other)),
                }
            }
            let array = b
                .finish()
                .with_precision_and_scale(*precision, *scale)
                .map_err(|e| TundraError::Internal(format!("decimal array build failed: {e}")))?;
            Ok(Arc::new(array))
        }
        other => Err(TundraError::Unsupported(format!(
            "output type not supported: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &ScalarValue) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn null_sorts_before_values_and_mixed_numerics_compare() {
        assert_eq!(
            ScalarValue::Null.try_cmp(&ScalarValue::Int64(i64::MIN)).expect("cmp"),
            Ordering::Less
        );
        assert_eq!(
            ScalarValue::Int64(2)
                .try_cmp(&ScalarValue::float64(1.5))
                .expect("cmp"),
            Ordering::Greater
        );
        assert!(ScalarValue::Int64(1)
            .try_cmp(&ScalarValue::Utf8("1".to_string()))
            .is_err());
    }

    #[test]
    fn type_tag_separates_equal_payloads() {
        assert_ne!(hash_of(&ScalarValue::Null), hash_of(&ScalarValue::Boolean(false)));
        assert_ne!(
            hash_of(&ScalarValue::Int64(0)),
            hash_of(&ScalarValue::Float64Bits(0))
        );
    }

    #[test]
    fn signed_zeros_and_nans_share_one_key() {
        assert_eq!(ScalarValue::float64(-0.0), ScalarValue::float64(0.0));
        let quiet = f64::from_bits(0x7ff8_0000_0000_0001);
        let negative = -f64::NAN;
        assert_eq!(ScalarValue::float64(quiet), ScalarValue::float64(f64::NAN));
        assert_eq!(
            hash_of(&ScalarValue::float64(negative)),
            hash_of(&ScalarValue::float64(f64::NAN))
        );
        let array: ArrayRef = Arc::new(Float64Array::from(vec![-0.0, 0.0]));
        assert_eq!(
            scalar_from_array(&array, 0).expect("row 0"),
            scalar_from_array(&array, 1).expect("row 1")
        );
    }

    #[test]
    fn decimal_column_reads_back_as_decimal12() {
        let d: Decimal12 = "-3.250000001".parse().expect("decimal");
        let values = vec![ScalarValue::Decimal(d), ScalarValue::Null];
        let array = scalars_to_array(&values, &DataType::Decimal128(27, 9)).expect("array");
        assert_eq!(scalar_from_array(&array, 0).expect("row 0"), ScalarValue::Decimal(d));
        assert_eq!(scalar_from_array(&array, 1).expect("row 1"), ScalarValue::Null);
    }

    #[test]
    fn narrow_integers_widen() {
        let array: ArrayRef = Arc::new(Int32Array::from(vec![Some(7), None]));
        assert_eq!(scalar_from_array(&array, 0).expect("row"), ScalarValue::Int64(7));
        assert!(scalar_from_array(&array, 1).expect("row").is_null());
    }
}
