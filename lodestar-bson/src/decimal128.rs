//! IEEE 754-2008 128-bit decimal floating point in the binary integer
//! decimal (BID) encoding used on the wire.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;

use crate::error::{BsonError, BsonResult};

const EXPONENT_BIAS: i32 = 6176;
const MAX_EXPONENT: i32 = 6111;
const MIN_EXPONENT: i32 = -6176;
const MAX_DIGITS: usize = 34;
const MAX_COEFFICIENT: u128 = 9_999_999_999_999_999_999_999_999_999_999_999;
const SIGN_BIT: u128 = 1 << 127;
const COEFFICIENT_MASK: u128 = (1 << 113) - 1;
const NAN_BITS: u128 = 0x7C00_0000_0000_0000 << 64;
const INFINITY_BITS: u128 = 0x7800_0000_0000_0000 << 64;
/// 2^96, one past the largest native decimal mantissa.
const DECIMAL_MANTISSA_LIMIT: u128 = 1 << 96;

/// A 128-bit decimal value, stored as its raw bit pattern.
///
/// Equality is structural: `1.0` and `1.00` are different values.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal128 {
    bits: u128,
}

/// The decoded fields of a finite value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Parts {
    negative: bool,
    coefficient: u128,
    exponent: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Finite(Parts),
    Infinite(bool),
    NaN,
}

impl Decimal128 {
    pub const NAN: Self = Self { bits: NAN_BITS };
    pub const INFINITY: Self = Self {
        bits: INFINITY_BITS,
    };
    pub const NEG_INFINITY: Self = Self {
        bits: INFINITY_BITS | SIGN_BIT,
    };
    pub const ZERO: Self = Self {
        bits: (EXPONENT_BIAS as u128) << 113,
    };
    pub const MAX: Self = Self {
        bits: ((MAX_EXPONENT + EXPONENT_BIAS) as u128) << 113 | MAX_COEFFICIENT,
    };
    pub const MIN: Self = Self {
        bits: SIGN_BIT | ((MAX_EXPONENT + EXPONENT_BIAS) as u128) << 113 | MAX_COEFFICIENT,
    };

    /// Build from the 16 little-endian bytes found on the wire.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self {
            bits: u128::from_le_bytes(bytes),
        }
    }

    /// The 16 little-endian wire bytes.
    pub const fn bytes(&self) -> [u8; 16] {
        self.bits.to_le_bytes()
    }

    fn from_parts(negative: bool, coefficient: u128, exponent: i32) -> Self {
        debug_assert!(coefficient <= MAX_COEFFICIENT);
        debug_assert!((MIN_EXPONENT..=MAX_EXPONENT).contains(&exponent));
        let mut bits = ((exponent + EXPONENT_BIAS) as u128) << 113 | coefficient;
        if negative {
            bits |= SIGN_BIT;
        }
        Self { bits }
    }

    fn classify(&self) -> Class {
        let negative = self.bits & SIGN_BIT != 0;
        let combination = (self.bits >> 122) & 0x1F;
        if combination == 0x1F {
            return Class::NaN;
        }
        if combination == 0x1E {
            return Class::Infinite(negative);
        }
        let (biased, coefficient) = if (self.bits >> 125) & 0b11 == 0b11 {
            // The implicit 0b100 prefix always exceeds the largest coefficient.
            (((self.bits >> 111) & 0x3FFF) as i32, 0)
        } else {
            let coefficient = self.bits & COEFFICIENT_MASK;
            let coefficient = if coefficient > MAX_COEFFICIENT {
                0
            } else {
                coefficient
            };
            (((self.bits >> 113) & 0x3FFF) as i32, coefficient)
        };
        Class::Finite(Parts {
            negative,
            coefficient,
            exponent: biased - EXPONENT_BIAS,
        })
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.classify(), Class::NaN)
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self.classify(), Class::Infinite(_))
    }

    pub fn is_finite(&self) -> bool {
        matches!(self.classify(), Class::Finite(_))
    }

    pub fn is_negative(&self) -> bool {
        self.bits & SIGN_BIT != 0
    }

    pub fn is_zero(&self) -> bool {
        matches!(self.classify(), Class::Finite(p) if p.coefficient == 0)
    }

    /// The same value with trailing zeros stripped from the coefficient, so
    /// that numerically equal finite values compare equal.
    pub fn normalize(&self) -> Self {
        let Class::Finite(mut p) = self.classify() else {
            return *self;
        };
        if p.coefficient == 0 {
            return Self::from_parts(p.negative, 0, 0);
        }
        while p.coefficient % 10 == 0 && p.exponent < MAX_EXPONENT {
            p.coefficient /= 10;
            p.exponent += 1;
        }
        Self::from_parts(p.negative, p.coefficient, p.exponent)
    }

    /// Parse the textual form, failing rather than rounding when the value
    /// cannot be represented exactly.
    pub fn parse(s: &str) -> BsonResult<Self> {
        let invalid = || BsonError::format(format!("invalid decimal128 string {:?}", s));
        let (negative, body) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };

        let lower = body.to_ascii_lowercase();
        if lower == "inf" || lower == "infinity" {
            return Ok(if negative {
                Self::NEG_INFINITY
            } else {
                Self::INFINITY
            });
        }
        if lower == "nan" {
            return Ok(Self::NAN);
        }

        let (mantissa, exponent_text) = match body.find(['e', 'E']) {
            Some(i) => (&body[..i], Some(&body[i + 1..])),
            None => (body, None),
        };
        let (int_part, frac_part) = match mantissa.find('.') {
            Some(i) => (&mantissa[..i], &mantissa[i + 1..]),
            None => (mantissa, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let mut exponent: i64 = match exponent_text {
            Some(text) => {
                let digits = text.strip_prefix(['+', '-']).unwrap_or(text);
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) || digits.len() > 9 {
                    return Err(invalid());
                }
                text.parse::<i64>().map_err(|_| invalid())?
            }
            None => 0,
        };
        exponent -= frac_part.len() as i64;

        let all_digits: String = format!("{}{}", int_part, frac_part);
        let mut digits = all_digits.trim_start_matches('0').to_string();

        if digits.is_empty() {
            let exponent = exponent.clamp(MIN_EXPONENT as i64, MAX_EXPONENT as i64) as i32;
            return Ok(Self::from_parts(negative, 0, exponent));
        }

        while digits.len() > MAX_DIGITS {
            if digits.ends_with('0') {
                digits.pop();
                exponent += 1;
            } else {
                return Err(BsonError::format(format!(
                    "decimal128 string {:?} has more than {} significant digits",
                    s, MAX_DIGITS
                )));
            }
        }
        while exponent > MAX_EXPONENT as i64 && digits.len() < MAX_DIGITS {
            digits.push('0');
            exponent -= 1;
        }
        if exponent > MAX_EXPONENT as i64 {
            return Err(BsonError::overflow(format!(
                "decimal128 string {:?} is out of range",
                s
            )));
        }
        while exponent < MIN_EXPONENT as i64 {
            if digits.ends_with('0') {
                digits.pop();
                exponent += 1;
            } else {
                return Err(BsonError::format(format!(
                    "decimal128 string {:?} underflows the exponent range",
                    s
                )));
            }
        }

        let coefficient: u128 = digits.parse().map_err(|_| invalid())?;
        Ok(Self::from_parts(negative, coefficient, exponent as i32))
    }

    /// Convert an `f64` through its shortest round-trip decimal digits.
    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() {
            return Self::NAN;
        }
        if value.is_infinite() {
            return if value > 0.0 {
                Self::INFINITY
            } else {
                Self::NEG_INFINITY
            };
        }
        // At most 17 significant digits; always representable.
        Self::parse(&format!("{:e}", value)).unwrap_or(Self::NAN)
    }

    /// Nearest `f64`; NaN and the infinities map to their `f64` counterparts.
    pub fn to_f64(&self) -> f64 {
        match self.classify() {
            Class::NaN => f64::NAN,
            Class::Infinite(negative) => {
                if negative {
                    f64::NEG_INFINITY
                } else {
                    f64::INFINITY
                }
            }
            Class::Finite(p) => {
                let magnitude: f64 = format!("{}e{}", p.coefficient, p.exponent)
                    .parse()
                    .unwrap_or(f64::NAN);
                if p.negative { -magnitude } else { magnitude }
            }
        }
    }

    pub fn from_i64(value: i64) -> Self {
        Self::from_parts(value < 0, u128::from(value.unsigned_abs()), 0)
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_parts(false, u128::from(value), 0)
    }

    /// The integral part, rounded toward zero, and whether it was exact.
    ///
    /// `None` for NaN, infinities and magnitudes beyond `i128`.
    pub fn to_i128_truncated(&self) -> Option<(i128, bool)> {
        let Class::Finite(p) = self.classify() else {
            return None;
        };
        let (magnitude, exact) = if p.exponent >= 0 {
            let scale = 10u128.checked_pow(p.exponent as u32)?;
            (p.coefficient.checked_mul(scale)?, true)
        } else if p.exponent < -38 {
            (0, p.coefficient == 0)
        } else {
            let scale = 10u128.pow((-p.exponent) as u32);
            (p.coefficient / scale, p.coefficient % scale == 0)
        };
        let magnitude = i128::try_from(magnitude).ok()?;
        Some((if p.negative { -magnitude } else { magnitude }, exact))
    }

    /// Exact conversion from the native 96-bit decimal.
    pub fn from_decimal(value: Decimal) -> Self {
        let mantissa = value.mantissa().unsigned_abs();
        Self::from_parts(
            value.is_sign_negative(),
            mantissa,
            -(value.scale() as i32),
        )
    }

    /// Conversion to the native decimal, rounding toward zero when digits
    /// must be dropped. Returns the value and whether it was exact, or
    /// `None` when the magnitude exceeds the native range.
    pub fn to_decimal(&self) -> Option<(Decimal, bool)> {
        let Class::Finite(p) = self.classify() else {
            return None;
        };
        let mut coefficient = p.coefficient;
        let mut exact = true;
        let mut scale: i32 = -p.exponent;

        if scale < 0 {
            let factor = 10u128.checked_pow((-scale) as u32)?;
            coefficient = coefficient.checked_mul(factor)?;
            scale = 0;
        }
        while scale > 28 || (coefficient >= DECIMAL_MANTISSA_LIMIT && scale > 0) {
            if coefficient % 10 != 0 {
                exact = false;
            }
            coefficient /= 10;
            scale -= 1;
        }
        if coefficient >= DECIMAL_MANTISSA_LIMIT {
            return None;
        }
        let signed = if p.negative {
            -(coefficient as i128)
        } else {
            coefficient as i128
        };
        let value = Decimal::try_from_i128_with_scale(signed, scale as u32).ok()?;
        Some((value, exact))
    }
}

impl Default for Decimal128 {
    fn default() -> Self {
        Self::ZERO
    }
}

impl FromStr for Decimal128 {
    type Err = BsonError;

    fn from_str(s: &str) -> BsonResult<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Decimal128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = match self.classify() {
            Class::NaN => return f.write_str("NaN"),
            Class::Infinite(true) => return f.write_str("-Infinity"),
            Class::Infinite(false) => return f.write_str("Infinity"),
            Class::Finite(p) => p,
        };
        if p.negative {
            f.write_str("-")?;
        }
        let digits = p.coefficient.to_string();
        let adjusted = p.exponent + digits.len() as i32 - 1;

        if p.exponent <= 0 && adjusted >= -6 {
            if p.exponent == 0 {
                return f.write_str(&digits);
            }
            let fraction_len = (-p.exponent) as usize;
            if digits.len() > fraction_len {
                let split = digits.len() - fraction_len;
                write!(f, "{}.{}", &digits[..split], &digits[split..])
            } else {
                write!(f, "0.{}{}", "0".repeat(fraction_len - digits.len()), digits)
            }
        } else {
            f.write_str(&digits[..1])?;
            if digits.len() > 1 {
                write!(f, ".{}", &digits[1..])?;
            }
            let sign = if adjusted >= 0 { '+' } else { '-' };
            write!(f, "E{}{}", sign, adjusted.abs())
        }
    }
}

impl fmt::Debug for Decimal128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decimal128({})", self)
    }
}

impl From<Decimal> for Decimal128 {
    fn from(value: Decimal) -> Self {
        Self::from_decimal(value)
    }
}

impl From<i64> for Decimal128 {
    fn from(value: i64) -> Self {
        Self::from_i64(value)
    }
}
