//! Numeric conversions between native types and wire representations,
//! governed by the overflow and truncation policies.
//!
//! Every conversion checks range first. A value outside the destination
//! range takes the overflow path: it fails unless overflow is allowed, in
//! which case the value wraps the way an unchecked narrowing cast would.
//! A value inside the range that does not survive a round trip takes the
//! truncation path. The float extremes, infinities and NaN map onto their
//! counterparts without tripping either check.

use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};

use crate::decimal128::Decimal128;
use crate::error::{BsonError, BsonResult};

/// A numeric value on its way through a conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Integer(i128),
    Single(f32),
    Double(f64),
    Decimal(Decimal),
    Decimal128(Decimal128),
}

macro_rules! number_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Number {
                fn from(value: $ty) -> Self {
                    Self::Integer(i128::from(value))
                }
            }
        )*
    };
}

number_from_int!(i16, i32, i64, u32, u64);

impl From<f32> for Number {
    fn from(value: f32) -> Self {
        Self::Single(value)
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<Decimal> for Number {
    fn from(value: Decimal) -> Self {
        Self::Decimal(value)
    }
}

impl From<Decimal128> for Number {
    fn from(value: Decimal128) -> Self {
        Self::Decimal128(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntKind {
    I16,
    I32,
    I64,
    U32,
    U64,
}

impl IntKind {
    fn range(self) -> (i128, i128) {
        match self {
            Self::I16 => (i128::from(i16::MIN), i128::from(i16::MAX)),
            Self::I32 => (i128::from(i32::MIN), i128::from(i32::MAX)),
            Self::I64 => (i128::from(i64::MIN), i128::from(i64::MAX)),
            Self::U32 => (0, i128::from(u32::MAX)),
            Self::U64 => (0, i128::from(u64::MAX)),
        }
    }

    /// Keep the low bits, as an unchecked cast does.
    fn wrap(self, value: i128) -> i128 {
        match self {
            Self::I16 => i128::from(value as i16),
            Self::I32 => i128::from(value as i32),
            Self::I64 => i128::from(value as i64),
            Self::U32 => i128::from(value as u32),
            Self::U64 => i128::from(value as u64),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::I16 => "Int16",
            Self::I32 => "Int32",
            Self::I64 => "Int64",
            Self::U32 => "UInt32",
            Self::U64 => "UInt64",
        }
    }
}

/// Applies the overflow and truncation policies to numeric conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepresentationConverter {
    pub allow_overflow: bool,
    pub allow_truncation: bool,
}

impl RepresentationConverter {
    pub fn new(allow_overflow: bool, allow_truncation: bool) -> Self {
        Self {
            allow_overflow,
            allow_truncation,
        }
    }

    fn overflow(&self, value: &Number, target: &str) -> BsonResult<()> {
        if self.allow_overflow {
            Ok(())
        } else {
            Err(BsonError::overflow(format!("{:?} does not fit in {}", value, target)))
        }
    }

    fn truncation(&self, value: &Number, target: &str) -> BsonResult<()> {
        if self.allow_truncation {
            Ok(())
        } else {
            Err(BsonError::truncation(format!("{:?} loses precision as {}", value, target)))
        }
    }

    fn to_integer(&self, value: Number, kind: IntKind) -> BsonResult<i128> {
        let (min, max) = kind.range();
        match value {
            Number::Integer(v) => {
                if v < min || v > max {
                    self.overflow(&value, kind.name())?;
                    return Ok(kind.wrap(v));
                }
                Ok(v)
            }
            Number::Single(f) => self.float_to_integer(f64::from(f), value, kind),
            Number::Double(f) => self.float_to_integer(f, value, kind),
            Number::Decimal(d) => {
                let truncated = d.trunc();
                let Some(v) = truncated.to_i128() else {
                    self.overflow(&value, kind.name())?;
                    return Ok(0);
                };
                if v < min || v > max {
                    self.overflow(&value, kind.name())?;
                    return Ok(kind.wrap(v));
                }
                if truncated != d {
                    self.truncation(&value, kind.name())?;
                }
                Ok(v)
            }
            Number::Decimal128(d) => match d.to_i128_truncated() {
                None => {
                    self.overflow(&value, kind.name())?;
                    Ok(0)
                }
                Some((v, exact)) => {
                    if v < min || v > max {
                        self.overflow(&value, kind.name())?;
                        return Ok(kind.wrap(v));
                    }
                    if !exact {
                        self.truncation(&value, kind.name())?;
                    }
                    Ok(v)
                }
            },
        }
    }

    fn float_to_integer(&self, f: f64, value: Number, kind: IntKind) -> BsonResult<i128> {
        let (min, max) = kind.range();
        if f < min as f64 || f >= max as f64 + 1.0 {
            self.overflow(&value, kind.name())?;
            return Ok(kind.wrap(f as i128));
        }
        // NaN fails every range comparison and lands here.
        if f.is_nan() || f.trunc() != f {
            self.truncation(&value, kind.name())?;
        }
        Ok(f as i128)
    }

    pub fn to_i16(&self, value: impl Into<Number>) -> BsonResult<i16> {
        self.to_integer(value.into(), IntKind::I16).map(|v| v as i16)
    }

    pub fn to_i32(&self, value: impl Into<Number>) -> BsonResult<i32> {
        self.to_integer(value.into(), IntKind::I32).map(|v| v as i32)
    }

    pub fn to_i64(&self, value: impl Into<Number>) -> BsonResult<i64> {
        self.to_integer(value.into(), IntKind::I64).map(|v| v as i64)
    }

    pub fn to_u32(&self, value: impl Into<Number>) -> BsonResult<u32> {
        self.to_integer(value.into(), IntKind::U32).map(|v| v as u32)
    }

    pub fn to_u64(&self, value: impl Into<Number>) -> BsonResult<u64> {
        self.to_integer(value.into(), IntKind::U64).map(|v| v as u64)
    }

    pub fn to_f64(&self, value: impl Into<Number>) -> BsonResult<f64> {
        let value = value.into();
        match value {
            Number::Integer(v) => {
                let f = v as f64;
                if f as i128 != v {
                    self.truncation(&value, "Double")?;
                }
                Ok(f)
            }
            Number::Single(f) => Ok(if f == f32::MIN {
                f64::MIN
            } else if f == f32::MAX {
                f64::MAX
            } else {
                f64::from(f)
            }),
            Number::Double(f) => Ok(f),
            Number::Decimal(d) => {
                if d == Decimal::MIN {
                    return Ok(f64::MIN);
                }
                if d == Decimal::MAX {
                    return Ok(f64::MAX);
                }
                let f = d.to_f64().unwrap_or(f64::NAN);
                if Decimal::from_f64(f) != Some(d) {
                    self.truncation(&value, "Double")?;
                }
                Ok(f)
            }
            Number::Decimal128(d) => {
                let f = d.to_f64();
                if d.is_finite() && !same_decimal128(Decimal128::from_f64(f), d) {
                    self.truncation(&value, "Double")?;
                }
                Ok(f)
            }
        }
    }

    pub fn to_f32(&self, value: impl Into<Number>) -> BsonResult<f32> {
        let value = value.into();
        let f = match value {
            Number::Single(f) => return Ok(f),
            Number::Double(f) => {
                if f == f64::MIN {
                    return Ok(f32::MIN);
                }
                if f == f64::MAX {
                    return Ok(f32::MAX);
                }
                f
            }
            other => self.to_f64(other)?,
        };
        if f.is_finite() && (f < f64::from(f32::MIN) || f > f64::from(f32::MAX)) {
            self.overflow(&value, "Single")?;
            return Ok(f as f32);
        }
        let narrowed = f as f32;
        if !f.is_nan() && f64::from(narrowed) != f {
            self.truncation(&value, "Single")?;
        }
        Ok(narrowed)
    }

    pub fn to_decimal(&self, value: impl Into<Number>) -> BsonResult<Decimal> {
        let value = value.into();
        match value {
            Number::Integer(v) => match Decimal::from_i128(v) {
                Some(d) => Ok(d),
                None => {
                    self.overflow(&value, "Decimal")?;
                    Ok(if v < 0 { Decimal::MIN } else { Decimal::MAX })
                }
            },
            Number::Single(f) => {
                if f == f32::MIN {
                    return Ok(Decimal::MIN);
                }
                if f == f32::MAX {
                    return Ok(Decimal::MAX);
                }
                self.float_to_decimal(f64::from(f), value)
            }
            Number::Double(f) => {
                if f == f64::MIN {
                    return Ok(Decimal::MIN);
                }
                if f == f64::MAX {
                    return Ok(Decimal::MAX);
                }
                self.float_to_decimal(f, value)
            }
            Number::Decimal(d) => Ok(d),
            Number::Decimal128(d) => match d.to_decimal() {
                Some((converted, exact)) => {
                    if !exact {
                        self.truncation(&value, "Decimal")?;
                    }
                    Ok(converted)
                }
                None if d.is_nan() => Err(BsonError::overflow("NaN cannot be converted to Decimal")),
                None => {
                    self.overflow(&value, "Decimal")?;
                    Ok(if d.is_negative() { Decimal::MIN } else { Decimal::MAX })
                }
            },
        }
    }

    fn float_to_decimal(&self, f: f64, value: Number) -> BsonResult<Decimal> {
        if f.is_nan() {
            return Err(BsonError::overflow("NaN cannot be converted to Decimal"));
        }
        let max = Decimal::MAX.to_f64().unwrap_or(f64::MAX);
        if f.abs() > max {
            self.overflow(&value, "Decimal")?;
            return Ok(if f < 0.0 { Decimal::MIN } else { Decimal::MAX });
        }
        match Decimal::from_f64(f) {
            Some(d) => {
                if d.to_f64() != Some(f) {
                    self.truncation(&value, "Decimal")?;
                }
                Ok(d)
            }
            None => {
                self.truncation(&value, "Decimal")?;
                Ok(Decimal::ZERO)
            }
        }
    }

    pub fn to_decimal128(&self, value: impl Into<Number>) -> BsonResult<Decimal128> {
        let value = value.into();
        match value {
            Number::Integer(v) => {
                if let Ok(v) = i64::try_from(v) {
                    Ok(Decimal128::from_i64(v))
                } else if let Ok(v) = u64::try_from(v) {
                    Ok(Decimal128::from_u64(v))
                } else {
                    Decimal128::parse(&v.to_string())
                }
            }
            Number::Single(f) => Ok(if f.is_finite() {
                // Shortest digits of the single, not of its widened double.
                Decimal128::parse(&format!("{:e}", f)).unwrap_or(Decimal128::NAN)
            } else {
                Decimal128::from_f64(f64::from(f))
            }),
            Number::Double(f) => Ok(Decimal128::from_f64(f)),
            Number::Decimal(d) => Ok(Decimal128::from_decimal(d)),
            Number::Decimal128(d) => Ok(d),
        }
    }
}

/// Numeric equality of two finite decimals regardless of trailing zeros.
fn same_decimal128(a: Decimal128, b: Decimal128) -> bool {
    a.normalize() == b.normalize()
}
