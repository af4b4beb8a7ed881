//! The in-memory value model: one variant per wire type.

use std::cmp::Ordering;

use crate::datetime::DateTime;
use crate::decimal128::Decimal128;
use crate::document::Document;
use crate::element::{BinarySubtype, ElementType};
use crate::oid::ObjectId;

/// An ordered sequence of values.
pub type Array = Vec<Bson>;

/// A tagged wire value.
///
/// Equality is exact: doubles compare by bit pattern, so `-0.0` differs
/// from `0.0` and every NaN with the same payload equals itself.
#[derive(Debug, Clone)]
pub enum Bson {
    Double(f64),
    String(String),
    Document(Document),
    Array(Array),
    Binary(Binary),
    Undefined,
    ObjectId(ObjectId),
    Boolean(bool),
    DateTime(DateTime),
    Null,
    RegularExpression(Regex),
    JavaScriptCode(String),
    JavaScriptCodeWithScope(JavaScriptCodeWithScope),
    Symbol(String),
    Int32(i32),
    Timestamp(Timestamp),
    Int64(i64),
    Decimal128(Decimal128),
    MaxKey,
    MinKey,
}

/// Binary data with its subtype.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binary {
    pub subtype: BinarySubtype,
    pub bytes: Vec<u8>,
}

impl Binary {
    pub fn new(subtype: BinarySubtype, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            subtype,
            bytes: bytes.into(),
        }
    }
}

/// A regular expression; option characters are kept sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Regex {
    pub pattern: String,
    pub options: String,
}

impl Regex {
    pub fn new(pattern: impl Into<String>, options: impl AsRef<str>) -> Self {
        let mut chars: Vec<char> = options.as_ref().chars().collect();
        chars.sort_unstable();
        chars.dedup();
        Self {
            pattern: pattern.into(),
            options: chars.into_iter().collect(),
        }
    }
}

/// JavaScript code together with its scope document.
#[derive(Debug, Clone, PartialEq)]
pub struct JavaScriptCodeWithScope {
    pub code: String,
    pub scope: Document,
}

/// Internal replication timestamp: seconds and an ordinal within the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    pub time: u32,
    pub increment: u32,
}

impl Timestamp {
    /// The packed 64-bit form used on the wire.
    pub fn to_u64(self) -> u64 {
        (u64::from(self.time) << 32) | u64::from(self.increment)
    }

    pub fn from_u64(value: u64) -> Self {
        Self {
            time: (value >> 32) as u32,
            increment: value as u32,
        }
    }
}

impl Bson {
    /// The wire type tag of this value.
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Double(_) => ElementType::Double,
            Self::String(_) => ElementType::String,
            Self::Document(_) => ElementType::EmbeddedDocument,
            Self::Array(_) => ElementType::Array,
            Self::Binary(_) => ElementType::Binary,
            Self::Undefined => ElementType::Undefined,
            Self::ObjectId(_) => ElementType::ObjectId,
            Self::Boolean(_) => ElementType::Boolean,
            Self::DateTime(_) => ElementType::DateTime,
            Self::Null => ElementType::Null,
            Self::RegularExpression(_) => ElementType::RegularExpression,
            Self::JavaScriptCode(_) => ElementType::JavaScript,
            Self::JavaScriptCodeWithScope(_) => ElementType::JavaScriptWithScope,
            Self::Symbol(_) => ElementType::Symbol,
            Self::Int32(_) => ElementType::Int32,
            Self::Timestamp(_) => ElementType::Timestamp,
            Self::Int64(_) => ElementType::Int64,
            Self::Decimal128(_) => ElementType::Decimal128,
            Self::MaxKey => ElementType::MaxKey,
            Self::MinKey => ElementType::MinKey,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_number(&self) -> bool {
        self.element_type().is_numeric()
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Self::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Any numeric value widened to `f64`.
    pub fn to_f64_lossy(&self) -> Option<f64> {
        match self {
            Self::Int32(v) => Some(f64::from(*v)),
            Self::Int64(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            Self::Decimal128(d) => Some(d.to_f64()),
            _ => None,
        }
    }

    /// Any integral numeric value as `i64`, without rounding.
    pub fn to_i64_exact(&self) -> Option<i64> {
        match self {
            Self::Int32(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            Self::Double(v) if v.fract() == 0.0 && v.abs() < 9.2e18 => Some(*v as i64),
            Self::Decimal128(d) => match d.to_i128_truncated() {
                Some((v, true)) => i64::try_from(v).ok(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Truthiness as the aggregation language defines it.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Boolean(b) => *b,
            Self::Null | Self::Undefined => false,
            Self::Int32(v) => *v != 0,
            Self::Int64(v) => *v != 0,
            Self::Double(v) => *v != 0.0,
            Self::Decimal128(d) => !d.is_zero(),
            _ => true,
        }
    }

    /// Position of the value's type class in the cross-type order. Values
    /// of different classes never match a query comparison.
    pub fn canonical_rank(&self) -> u8 {
        match self {
            Self::MinKey => 1,
            Self::Null | Self::Undefined => 2,
            Self::Int32(_) | Self::Int64(_) | Self::Double(_) | Self::Decimal128(_) => 3,
            Self::Symbol(_) | Self::String(_) => 4,
            Self::Document(_) => 5,
            Self::Array(_) => 6,
            Self::Binary(_) => 7,
            Self::ObjectId(_) => 8,
            Self::Boolean(_) => 9,
            Self::DateTime(_) => 10,
            Self::Timestamp(_) => 11,
            Self::RegularExpression(_) => 12,
            Self::JavaScriptCode(_) => 13,
            Self::JavaScriptCodeWithScope(_) => 14,
            Self::MaxKey => 15,
        }
    }

    /// Total order following the server's cross-type comparison rules:
    /// type class first, numbers compared by value across types.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        let rank = self.canonical_rank().cmp(&other.canonical_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (a, b) if a.is_number() && b.is_number() => compare_numbers(a, b),
            (Self::String(a) | Self::Symbol(a), Self::String(b) | Self::Symbol(b)) => a.cmp(b),
            (Self::Document(a), Self::Document(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = va
                        .canonical_rank()
                        .cmp(&vb.canonical_rank())
                        .then_with(|| ka.cmp(kb))
                        .then_with(|| va.canonical_cmp(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Self::Array(a), Self::Array(b)) => {
                for (va, vb) in a.iter().zip(b.iter()) {
                    let ord = va.canonical_cmp(vb);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Self::Binary(a), Self::Binary(b)) => a
                .bytes
                .len()
                .cmp(&b.bytes.len())
                .then_with(|| u8::from(a.subtype).cmp(&u8::from(b.subtype)))
                .then_with(|| a.bytes.cmp(&b.bytes)),
            (Self::ObjectId(a), Self::ObjectId(b)) => a.cmp(b),
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::DateTime(a), Self::DateTime(b)) => a.cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (Self::RegularExpression(a), Self::RegularExpression(b)) => a
                .pattern
                .cmp(&b.pattern)
                .then_with(|| a.options.cmp(&b.options)),
            (Self::JavaScriptCode(a), Self::JavaScriptCode(b)) => a.cmp(b),
            (Self::JavaScriptCodeWithScope(a), Self::JavaScriptCodeWithScope(b)) => a
                .code
                .cmp(&b.code)
                .then_with(|| {
                    Bson::Document(a.scope.clone()).canonical_cmp(&Bson::Document(b.scope.clone()))
                }),
            _ => Ordering::Equal,
        }
    }
}

fn compare_numbers(a: &Bson, b: &Bson) -> Ordering {
    if let (Some(x), Some(y)) = (integral(a), integral(b)) {
        return x.cmp(&y);
    }
    let x = a.to_f64_lossy().unwrap_or(f64::NAN);
    let y = b.to_f64_lossy().unwrap_or(f64::NAN);
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

fn integral(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        _ => None,
    }
}

impl PartialEq for Bson {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Document(a), Self::Document(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Binary(a), Self::Binary(b)) => a == b,
            (Self::Undefined, Self::Undefined) => true,
            (Self::ObjectId(a), Self::ObjectId(b)) => a == b,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::DateTime(a), Self::DateTime(b)) => a == b,
            (Self::Null, Self::Null) => true,
            (Self::RegularExpression(a), Self::RegularExpression(b)) => a == b,
            (Self::JavaScriptCode(a), Self::JavaScriptCode(b)) => a == b,
            (Self::JavaScriptCodeWithScope(a), Self::JavaScriptCodeWithScope(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::Int32(a), Self::Int32(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Decimal128(a), Self::Decimal128(b)) => a == b,
            (Self::MaxKey, Self::MaxKey) => true,
            (Self::MinKey, Self::MinKey) => true,
            _ => false,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Bson {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

impl_from! {
    f64 => Double,
    String => String,
    Document => Document,
    Array => Array,
    Binary => Binary,
    ObjectId => ObjectId,
    bool => Boolean,
    DateTime => DateTime,
    Regex => RegularExpression,
    JavaScriptCodeWithScope => JavaScriptCodeWithScope,
    i32 => Int32,
    Timestamp => Timestamp,
    i64 => Int64,
    Decimal128 => Decimal128,
}

impl From<&str> for Bson {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl<T: Into<Bson>> From<Option<T>> for Bson {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
