//! Fixed-point decimal with 18 integer and 9 fractional digits.
//!
//! The value is split into an integer part and a fractional part scaled by
//! [`FRAC_RATIO`]. Both parts always carry the same sign (or the fraction is
//! zero), and `|fraction| < FRAC_RATIO`. Arrow stores the same value as a
//! `Decimal128(27, 9)` integer.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TundraError};

/// Scale of the fractional part.
pub const FRAC_RATIO: i32 = 1_000_000_000;
/// Maximum number of integer digits.
pub const MAX_INT_DIGITS: usize = 18;
/// Maximum number of fractional digits.
pub const MAX_FRAC_DIGITS: usize = 9;
/// Arrow precision matching [`MAX_INT_DIGITS`] + [`MAX_FRAC_DIGITS`].
pub const ARROW_PRECISION: u8 = 27;
/// Arrow scale matching [`MAX_FRAC_DIGITS`].
pub const ARROW_SCALE: i8 = 9;

const MAX_INTEGER: i64 = 999_999_999_999_999_999;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "DecimalParts")]
pub struct Decimal12 {
    integer: i64,
    fraction: i32,
}

/// Wire form of [`Decimal12`]; validated through [`Decimal12::new`].
#[derive(Deserialize)]
struct DecimalParts {
    integer: i64,
    fraction: i32,
}

impl TryFrom<DecimalParts> for Decimal12 {
    type Error = TundraError;

    fn try_from(parts: DecimalParts) -> Result<Self> {
        Self::new(parts.integer, parts.fraction)
    }
}

impl Decimal12 {
    pub const ZERO: Self = Self {
        integer: 0,
        fraction: 0,
    };

    /// Build from parts, rejecting mixed signs and out-of-range fractions.
    pub fn new(integer: i64, fraction: i32) -> Result<Self> {
        let value = Self { integer, fraction };
        if !value.is_normalized() || integer.unsigned_abs() > MAX_INTEGER as u64 {
            return Err(TundraError::Evaluation(format!(
                "invalid decimal parts integer={integer} fraction={fraction}"
            )));
        }
        Ok(value)
    }

    pub fn integer(&self) -> i64 {
        self.integer
    }

    pub fn fraction(&self) -> i32 {
        self.fraction
    }

    /// Sign agreement and fraction bound both hold.
    pub fn is_normalized(&self) -> bool {
        let bounded = self.fraction > -FRAC_RATIO && self.fraction < FRAC_RATIO;
        let signs_agree = self.fraction == 0
            || self.integer == 0
            || self.integer.signum() == i64::from(self.fraction.signum());
        bounded && signs_agree
    }

    pub fn is_negative(&self) -> bool {
        self.integer < 0 || self.fraction < 0
    }

    pub fn abs(&self) -> Self {
        Self {
            integer: self.integer.abs(),
            fraction: self.fraction.abs(),
        }
    }

    /// Value scaled by `10^9`, as stored in an Arrow `Decimal128(27, 9)` column.
    pub fn to_scaled_i128(&self) -> i128 {
        i128::from(self.integer) * i128::from(FRAC_RATIO) + i128::from(self.fraction)
    }

    /// Inverse of [`Decimal12::to_scaled_i128`]. Fails beyond 18 integer digits.
    pub fn from_scaled_i128(scaled: i128) -> Result<Self> {
        let ratio = i128::from(FRAC_RATIO);
        let integer = scaled / ratio;
        if integer.abs() > i128::from(MAX_INTEGER) {
            return Err(TundraError::Evaluation(format!(
                "decimal overflow: scaled value {scaled} exceeds {MAX_INT_DIGITS} integer digits"
            )));
        }
        // Truncating division keeps the remainder's sign equal to the dividend's.
        Ok(Self {
            integer: integer as i64,
            fraction: (scaled % ratio) as i32,
        })
    }

    /// Addition that reports overflow instead of wrapping.
    pub fn checked_add(self, rhs: Self) -> Result<Self> {
        Self::from_scaled_i128(self.to_scaled_i128() + rhs.to_scaled_i128())
    }
}

impl AddAssign for Decimal12 {
    fn add_assign(&mut self, rhs: Self) {
        self.integer += rhs.integer;
        self.fraction += rhs.fraction;

        if self.fraction >= FRAC_RATIO {
            self.integer += 1;
            self.fraction -= FRAC_RATIO;
        } else if self.fraction <= -FRAC_RATIO {
            self.integer -= 1;
            self.fraction += FRAC_RATIO;
        }

        if self.fraction != 0
            && self.integer != 0
            && self.integer.signum() != i64::from(self.fraction.signum())
        {
            if self.integer < 0 {
                self.integer += 1;
                self.fraction -= FRAC_RATIO;
            } else {
                self.integer -= 1;
                self.fraction += FRAC_RATIO;
            }
        }
    }
}

impl Add for Decimal12 {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl Ord for Decimal12 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.integer
            .cmp(&other.integer)
            .then(self.fraction.cmp(&other.fraction))
    }
}

impl PartialOrd for Decimal12 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Decimal12 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.is_negative() { "-" } else { "" };
        write!(
            f,
            "{sign}{}.{:09}",
            self.integer.unsigned_abs(),
            self.fraction.unsigned_abs()
        )
    }
}

impl FromStr for Decimal12 {
    type Err = TundraError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TundraError::Evaluation(format!("invalid decimal literal '{s}'"));
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if int_part.len() > MAX_INT_DIGITS || frac_part.len() > MAX_FRAC_DIGITS {
            return Err(invalid());
        }
        let all_digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(int_part) || !all_digits(frac_part) {
            return Err(invalid());
        }

        let integer: i64 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        let mut fraction: i32 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().map_err(|_| invalid())?
        };
        for _ in frac_part.len()..MAX_FRAC_DIGITS {
            fraction *= 10;
        }

        if negative {
            Ok(Self {
                integer: -integer,
                fraction: -fraction,
            })
        } else {
            Ok(Self { integer, fraction })
        }
    }
}
