//! Wire type tags and binary subtypes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The one-byte type tag that precedes every element on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum ElementType {
    Double = 0x01,
    String = 0x02,
    EmbeddedDocument = 0x03,
    Array = 0x04,
    Binary = 0x05,
    Undefined = 0x06,
    ObjectId = 0x07,
    Boolean = 0x08,
    DateTime = 0x09,
    Null = 0x0A,
    RegularExpression = 0x0B,
    JavaScript = 0x0D,
    Symbol = 0x0E,
    JavaScriptWithScope = 0x0F,
    Int32 = 0x10,
    Timestamp = 0x11,
    Int64 = 0x12,
    Decimal128 = 0x13,
    MaxKey = 0x7F,
    MinKey = 0xFF,
}

impl ElementType {
    /// Map a tag byte to its type, `None` for unknown or unsupported tags.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Double,
            0x02 => Self::String,
            0x03 => Self::EmbeddedDocument,
            0x04 => Self::Array,
            0x05 => Self::Binary,
            0x06 => Self::Undefined,
            0x07 => Self::ObjectId,
            0x08 => Self::Boolean,
            0x09 => Self::DateTime,
            0x0A => Self::Null,
            0x0B => Self::RegularExpression,
            0x0D => Self::JavaScript,
            0x0E => Self::Symbol,
            0x0F => Self::JavaScriptWithScope,
            0x10 => Self::Int32,
            0x11 => Self::Timestamp,
            0x12 => Self::Int64,
            0x13 => Self::Decimal128,
            0x7F => Self::MaxKey,
            0xFF => Self::MinKey,
            _ => return None,
        })
    }

    /// The tag byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the type is one of the four numeric wire types.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Int32 | Self::Int64 | Self::Double | Self::Decimal128
        )
    }

    /// The name used by `$type` queries and in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Double => "double",
            Self::String => "string",
            Self::EmbeddedDocument => "object",
            Self::Array => "array",
            Self::Binary => "binData",
            Self::Undefined => "undefined",
            Self::ObjectId => "objectId",
            Self::Boolean => "bool",
            Self::DateTime => "date",
            Self::Null => "null",
            Self::RegularExpression => "regex",
            Self::JavaScript => "javascript",
            Self::Symbol => "symbol",
            Self::JavaScriptWithScope => "javascriptWithScope",
            Self::Int32 => "int",
            Self::Timestamp => "timestamp",
            Self::Int64 => "long",
            Self::Decimal128 => "decimal",
            Self::MaxKey => "maxKey",
            Self::MinKey => "minKey",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Subtype byte of a binary value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinarySubtype {
    Generic,
    Function,
    /// Deprecated layout with a second, inner length prefix.
    BinaryOld,
    UuidLegacy,
    Uuid,
    Md5,
    Encrypted,
    Column,
    Sensitive,
    UserDefined(u8),
    Reserved(u8),
}

impl From<u8> for BinarySubtype {
    fn from(byte: u8) -> Self {
        match byte {
            0x00 => Self::Generic,
            0x01 => Self::Function,
            0x02 => Self::BinaryOld,
            0x03 => Self::UuidLegacy,
            0x04 => Self::Uuid,
            0x05 => Self::Md5,
            0x06 => Self::Encrypted,
            0x07 => Self::Column,
            0x08 => Self::Sensitive,
            0x80..=0xFF => Self::UserDefined(byte),
            _ => Self::Reserved(byte),
        }
    }
}

impl From<BinarySubtype> for u8 {
    fn from(subtype: BinarySubtype) -> u8 {
        match subtype {
            BinarySubtype::Generic => 0x00,
            BinarySubtype::Function => 0x01,
            BinarySubtype::BinaryOld => 0x02,
            BinarySubtype::UuidLegacy => 0x03,
            BinarySubtype::Uuid => 0x04,
            BinarySubtype::Md5 => 0x05,
            BinarySubtype::Encrypted => 0x06,
            BinarySubtype::Column => 0x07,
            BinarySubtype::Sensitive => 0x08,
            BinarySubtype::UserDefined(b) | BinarySubtype::Reserved(b) => b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_mapping() {
        for tag in 0u8..=0xFF {
            if let Some(ty) = ElementType::from_u8(tag) {
                assert_eq!(ty.as_u8(), tag);
            }
        }
        assert_eq!(ElementType::from_u8(0x0C), None);
        assert_eq!(ElementType::from_u8(0x14), None);
    }

    #[test]
    fn test_binary_subtype_bytes() {
        assert_eq!(BinarySubtype::from(0x04), BinarySubtype::Uuid);
        assert_eq!(BinarySubtype::from(0x85), BinarySubtype::UserDefined(0x85));
        assert_eq!(BinarySubtype::from(0x20), BinarySubtype::Reserved(0x20));
        assert_eq!(u8::from(BinarySubtype::UserDefined(0x85)), 0x85);
        assert_eq!(u8::from(BinarySubtype::BinaryOld), 0x02);
    }
}
