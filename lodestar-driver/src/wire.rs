//! Message framing.
//!
//! Every message starts with a 16-byte little-endian header
//! `<int32 messageLength><int32 requestId><int32 responseTo><int32 opCode>`.
//! Commands travel as `OP_MSG`: a `uint32` flag word followed by sections,
//! of which exactly one is a kind-0 body document. Kind-1 document
//! sequences are folded into the body as arrays on decode.

use std::sync::atomic::{AtomicI32, Ordering};

use lodestar_bson::binary::{ReaderSettings, WriterSettings, decode_document_with, encode_document_into};
use lodestar_bson::{Bson, Document};

use crate::error::{DriverError, DriverResult};

/// Size of the message header.
pub const HEADER_LENGTH: usize = 16;

/// Default upper bound on a whole message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

const SECTION_BODY: u8 = 0;
const SECTION_DOCUMENT_SEQUENCE: u8 = 1;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// A fresh request id, unique within the process until it wraps.
pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply,
    Query,
    Compressed,
    Msg,
}

impl OpCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Reply => 1,
            Self::Query => 2004,
            Self::Compressed => 2012,
            Self::Msg => 2013,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Reply),
            2004 => Some(Self::Query),
            2012 => Some(Self::Compressed),
            2013 => Some(Self::Msg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    pub fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.message_length.to_le_bytes());
        out[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        out[12..16].copy_from_slice(&self.op_code.code().to_le_bytes());
    }

    pub fn parse(bytes: &[u8]) -> DriverResult<Self> {
        if bytes.len() < HEADER_LENGTH {
            return Err(DriverError::protocol(format!(
                "message of {} bytes is shorter than the header",
                bytes.len()
            )));
        }
        let op_code = read_i32(bytes, 12);
        Ok(Self {
            message_length: read_i32(bytes, 0),
            request_id: read_i32(bytes, 4),
            response_to: read_i32(bytes, 8),
            op_code: OpCode::from_code(op_code)
                .ok_or_else(|| DriverError::protocol(format!("unknown opcode {op_code}")))?,
        })
    }
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    i32::from_le_bytes(word)
}

/// `OP_MSG` flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MessageFlags(u32);

impl MessageFlags {
    pub const NONE: Self = Self(0);
    pub const CHECKSUM_PRESENT: Self = Self(1);
    pub const MORE_TO_COME: Self = Self(1 << 1);
    pub const EXHAUST_ALLOWED: Self = Self(1 << 16);

    const KNOWN: u32 = Self::CHECKSUM_PRESENT.0 | Self::MORE_TO_COME.0 | Self::EXHAUST_ALLOWED.0;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One `OP_MSG` message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub request_id: i32,
    pub response_to: i32,
    pub flags: MessageFlags,
    pub body: Document,
}

impl Message {
    /// A request with a fresh id.
    pub fn request(body: Document) -> Self {
        Self {
            request_id: next_request_id(),
            response_to: 0,
            flags: MessageFlags::NONE,
            body,
        }
    }

    /// A reply answering this message.
    pub fn reply(&self, body: Document) -> Self {
        Self {
            request_id: next_request_id(),
            response_to: self.request_id,
            flags: MessageFlags::NONE,
            body,
        }
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn encode(&self, settings: &WriterSettings) -> DriverResult<Vec<u8>> {
        if self.flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            return Err(DriverError::protocol("checksums are not supported on output"));
        }
        let mut out = Vec::with_capacity(HEADER_LENGTH + 64);
        out.resize(HEADER_LENGTH, 0);
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.push(SECTION_BODY);
        encode_document_into(&self.body, &mut out, settings)?;
        let message_length = i32::try_from(out.len())
            .map_err(|_| DriverError::protocol(format!("message of {} bytes is too large", out.len())))?;
        MessageHeader {
            message_length,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: OpCode::Msg,
        }
        .write_to(&mut out[..HEADER_LENGTH]);
        Ok(out)
    }

    pub fn decode(bytes: &[u8], settings: &ReaderSettings) -> DriverResult<Self> {
        let header = MessageHeader::parse(bytes)?;
        if usize::try_from(header.message_length).ok() != Some(bytes.len()) {
            return Err(DriverError::protocol(format!(
                "header length {} does not match the {} bytes received",
                header.message_length,
                bytes.len()
            )));
        }
        if header.op_code != OpCode::Msg {
            return Err(DriverError::protocol(format!("expected OP_MSG, got opcode {}", header.op_code.code())));
        }
        if bytes.len() < HEADER_LENGTH + 5 {
            return Err(DriverError::protocol("OP_MSG without sections"));
        }
        let flags = MessageFlags::from_bits(u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]));
        // Unknown bits in the low 16 are required flags and must be rejected.
        let unknown_required = flags.bits() & 0xFFFF & !MessageFlags::KNOWN;
        if unknown_required != 0 {
            return Err(DriverError::protocol(format!("unsupported required flag bits {unknown_required:#x}")));
        }
        let end = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            bytes
                .len()
                .checked_sub(4)
                .filter(|end| *end >= HEADER_LENGTH + 4)
                .ok_or_else(|| DriverError::protocol("checksum flag set without room for a checksum"))?
        } else {
            bytes.len()
        };

        let mut body = None;
        let mut sequences = Vec::new();
        let mut position = HEADER_LENGTH + 4;
        while position < end {
            let kind = bytes[position];
            position += 1;
            match kind {
                SECTION_BODY => {
                    let length = section_length(bytes, position, end)?;
                    if body.is_some() {
                        return Err(DriverError::protocol("more than one body section"));
                    }
                    body = Some(decode_document_with(&bytes[position..position + length], settings)?);
                    position += length;
                }
                SECTION_DOCUMENT_SEQUENCE => {
                    let length = section_length(bytes, position, end)?;
                    sequences.push(decode_sequence(&bytes[position + 4..position + length], settings)?);
                    position += length;
                }
                other => return Err(DriverError::protocol(format!("unknown section kind {other}"))),
            }
        }

        let mut body = body.ok_or_else(|| DriverError::protocol("missing body section"))?;
        for (identifier, documents) in sequences {
            body.insert(identifier, Bson::Array(documents.into_iter().map(Bson::Document).collect()));
        }
        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            body,
        })
    }
}

/// The length prefix at `position`, checked against the end of the sections.
fn section_length(bytes: &[u8], position: usize, end: usize) -> DriverResult<usize> {
    if position + 4 > end {
        return Err(DriverError::protocol("truncated section"));
    }
    let length = usize::try_from(read_i32(bytes, position))
        .map_err(|_| DriverError::protocol("negative section length"))?;
    if length < 5 || position + length > end {
        return Err(DriverError::protocol(format!("section length {length} is out of bounds")));
    }
    Ok(length)
}

fn decode_sequence(bytes: &[u8], settings: &ReaderSettings) -> DriverResult<(String, Vec<Document>)> {
    let nul = bytes
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| DriverError::protocol("unterminated sequence identifier"))?;
    let identifier = std::str::from_utf8(&bytes[..nul])
        .map_err(|_| DriverError::protocol("sequence identifier is not UTF-8"))?
        .to_string();
    let mut documents = Vec::new();
    let mut position = nul + 1;
    while position < bytes.len() {
        let length = section_length(bytes, position, bytes.len())?;
        documents.push(decode_document_with(&bytes[position..position + length], settings)?);
        position += length;
    }
    Ok((identifier, documents))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_bson::doc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_layout() {
        let message = Message::request(doc! { "ping" => 1, "$db" => "admin" });
        let bytes = message.encode(&WriterSettings::default()).unwrap();
        let header = MessageHeader::parse(&bytes).unwrap();
        assert_eq!(header.message_length as usize, bytes.len());
        assert_eq!(header.request_id, message.request_id);
        assert_eq!(header.response_to, 0);
        assert_eq!(header.op_code, OpCode::Msg);
        assert_eq!(&bytes[12..16], &2013i32.to_le_bytes());
        assert_eq!(&bytes[16..20], &[0, 0, 0, 0]);
        assert_eq!(bytes[20], SECTION_BODY);
        assert_eq!(Message::decode(&bytes, &ReaderSettings::default()).unwrap(), message);
    }

    #[test]
    fn test_request_ids_increase() {
        let first = next_request_id();
        let second = next_request_id();
        assert!(second > first);
    }

    #[test]
    fn test_reply_answers_request() {
        let request = Message::request(doc! { "hello" => 1 });
        let reply = request.reply(doc! { "ok" => 1.0 });
        assert_eq!(reply.response_to, request.request_id);
        assert_ne!(reply.request_id, request.request_id);
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let mut bytes = Message::request(doc! { "x" => 1 }).encode(&WriterSettings::default()).unwrap();
        bytes.push(0);
        let err = Message::decode(&bytes, &ReaderSettings::default()).unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
    }

    #[test]
    fn test_document_sequence_folds_into_body() {
        let mut bytes = Message::request(doc! { "insert" => "c" }).encode(&WriterSettings::default()).unwrap();
        let docs: Vec<Vec<u8>> = [doc! { "a" => 1 }, doc! { "a" => 2 }].iter().map(|d| d.to_vec().unwrap()).collect();
        let payload: usize = docs.iter().map(Vec::len).sum();
        let identifier = b"documents\0";
        bytes.push(SECTION_DOCUMENT_SEQUENCE);
        bytes.extend_from_slice(&((4 + identifier.len() + payload) as i32).to_le_bytes());
        bytes.extend_from_slice(identifier);
        for d in &docs {
            bytes.extend_from_slice(d);
        }
        let total = bytes.len() as i32;
        bytes[0..4].copy_from_slice(&total.to_le_bytes());

        let message = Message::decode(&bytes, &ReaderSettings::default()).unwrap();
        assert_eq!(
            message.body,
            doc! { "insert" => "c", "documents" => lodestar_bson::array![doc! { "a" => 1 }, doc! { "a" => 2 }] }
        );
    }

    #[test]
    fn test_unknown_required_flag() {
        let mut bytes = Message::request(doc! { "x" => 1 }).encode(&WriterSettings::default()).unwrap();
        bytes[16] = 0b100;
        let err = Message::decode(&bytes, &ReaderSettings::default()).unwrap_err();
        assert_eq!(err, DriverError::protocol("unsupported required flag bits 0x4"));
    }

    #[test]
    fn test_optional_flags_round_trip() {
        let message = Message::request(doc! { "getMore" => 1i64 }).with_flags(MessageFlags::EXHAUST_ALLOWED | MessageFlags::MORE_TO_COME);
        let bytes = message.encode(&WriterSettings::default()).unwrap();
        let decoded = Message::decode(&bytes, &ReaderSettings::default()).unwrap();
        assert!(decoded.flags.contains(MessageFlags::EXHAUST_ALLOWED));
        assert!(decoded.flags.contains(MessageFlags::MORE_TO_COME));
    }
}
