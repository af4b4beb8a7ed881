//! GUID byte orders for binary subtypes 3 and 4.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::element::BinarySubtype;
use crate::error::{BsonError, BsonResult};
use crate::value::Binary;

/// How a GUID is laid out inside a binary value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GuidRepresentation {
    /// No representation chosen; encoding and decoding GUIDs fails.
    #[default]
    Unspecified,
    /// RFC 4122 byte order, subtype 4.
    Standard,
    /// .NET legacy order (first three groups little-endian), subtype 3.
    CSharpLegacy,
    /// Java legacy order (each 8-byte half reversed), subtype 3.
    JavaLegacy,
    /// Python legacy order (RFC order), subtype 3.
    PythonLegacy,
}

impl GuidRepresentation {
    /// The binary subtype this representation writes.
    pub fn subtype(self) -> BsonResult<BinarySubtype> {
        match self {
            Self::Unspecified => Err(BsonError::invalid_operation(
                "GuidRepresentation is Unspecified; choose an explicit representation",
            )),
            Self::Standard => Ok(BinarySubtype::Uuid),
            Self::CSharpLegacy | Self::JavaLegacy | Self::PythonLegacy => {
                Ok(BinarySubtype::UuidLegacy)
            }
        }
    }

    /// Encode a GUID as a binary value.
    pub fn to_binary(self, guid: Uuid) -> BsonResult<Binary> {
        let subtype = self.subtype()?;
        let mut bytes = *guid.as_bytes();
        match self {
            Self::CSharpLegacy => swap_csharp(&mut bytes),
            Self::JavaLegacy => swap_java(&mut bytes),
            _ => {}
        }
        Ok(Binary {
            subtype,
            bytes: bytes.to_vec(),
        })
    }

    /// Decode a GUID, checking that the subtype agrees with the representation.
    pub fn from_binary(self, binary: &Binary) -> BsonResult<Uuid> {
        let expected = self.subtype()?;
        if binary.subtype != expected {
            return Err(BsonError::format(format!(
                "binary subtype {:?} does not match guid representation {:?}",
                binary.subtype, self
            )));
        }
        let mut bytes: [u8; 16] = binary.bytes.as_slice().try_into().map_err(|_| {
            BsonError::format(format!(
                "guid binary must be 16 bytes, got {}",
                binary.bytes.len()
            ))
        })?;
        match self {
            Self::CSharpLegacy => swap_csharp(&mut bytes),
            Self::JavaLegacy => swap_java(&mut bytes),
            _ => {}
        }
        Ok(Uuid::from_bytes(bytes))
    }
}

fn swap_csharp(bytes: &mut [u8; 16]) {
    bytes[0..4].reverse();
    bytes[4..6].reverse();
    bytes[6..8].reverse();
}

fn swap_java(bytes: &mut [u8; 16]) {
    bytes[0..8].reverse();
    bytes[8..16].reverse();
}
