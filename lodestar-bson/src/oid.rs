//! 12-byte object identifiers.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{BsonError, BsonResult};

const MAX_COUNTER: u32 = 0x00FF_FFFF;

/// Random bytes identifying this process, drawn once.
static PROCESS_UNIQUE: LazyLock<[u8; 5]> = LazyLock::new(|| {
    let random = uuid::Uuid::new_v4();
    let mut bytes = [0u8; 5];
    bytes.copy_from_slice(&random.as_bytes()[..5]);
    bytes
});

static COUNTER: LazyLock<AtomicU32> = LazyLock::new(|| {
    let random = uuid::Uuid::new_v4();
    let b = random.as_bytes();
    AtomicU32::new(u32::from_be_bytes([0, b[0], b[1], b[2]]))
});

/// An object identifier: 4-byte big-endian seconds since the epoch, a
/// 5-byte per-process random value and a 3-byte big-endian counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    bytes: [u8; 12],
}

impl ObjectId {
    /// Generate a fresh identifier stamped with the current time.
    pub fn new() -> Self {
        let seconds = Utc::now().timestamp() as u32;
        let counter = COUNTER.fetch_add(1, Ordering::SeqCst) & MAX_COUNTER;
        Self::from_parts(seconds, *PROCESS_UNIQUE, counter)
    }

    /// Assemble an identifier from its three fields.
    pub fn from_parts(seconds: u32, process_unique: [u8; 5], counter: u32) -> Self {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..9].copy_from_slice(&process_unique);
        bytes[9..].copy_from_slice(&(counter & MAX_COUNTER).to_be_bytes()[1..]);
        Self { bytes }
    }

    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self { bytes }
    }

    pub const fn bytes(&self) -> [u8; 12] {
        self.bytes
    }

    /// Parse a 24-character hex string.
    pub fn parse_str(s: &str) -> BsonResult<Self> {
        if s.len() != 24 {
            return Err(BsonError::format(format!(
                "object id must be 24 hex characters, got {:?}",
                s
            )));
        }
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| BsonError::format(format!("invalid object id {:?}: {}", s, e)))?;
        Ok(Self { bytes })
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Seconds encoded in the leading four bytes.
    pub fn seconds(&self) -> u32 {
        u32::from_be_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    /// Creation time with one-second resolution.
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(i64::from(self.seconds()), 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn counter(&self) -> u32 {
        u32::from_be_bytes([0, self.bytes[9], self.bytes[10], self.bytes[11]])
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ObjectId {
    type Err = BsonError;

    fn from_str(s: &str) -> BsonResult<Self> {
        Self::parse_str(s)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format() {
        let oid = ObjectId::parse_str("5f1d7e0a9d3b2c4e8a6f0b1c").unwrap();
        assert_eq!(oid.to_string(), "5f1d7e0a9d3b2c4e8a6f0b1c");
        assert_eq!(oid.seconds(), 0x5f1d7e0a);
        assert_eq!(oid.counter(), 0x6f0b1c);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ObjectId::parse_str("abc").unwrap_err().is_format_error());
        assert!(ObjectId::parse_str("zz1d7e0a9d3b2c4e8a6f0b1c").is_err());
    }

    #[test]
    fn test_generated_ids_differ() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
        assert_eq!(&a.bytes()[4..9], &b.bytes()[4..9]);
    }

    #[test]
    fn test_counter_wraps_to_three_bytes() {
        let oid = ObjectId::from_parts(1, [0; 5], 0x0123_4567);
        assert_eq!(oid.counter(), 0x23_4567);
        assert_eq!(oid.timestamp().timestamp(), 1);
    }
}
