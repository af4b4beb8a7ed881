use tracing::trace;

use super::{DuplicateElementPolicy, MAX_NESTING_DEPTH, ReaderSettings};
use crate::datetime::DateTime;
use crate::decimal128::Decimal128;
use crate::document::Document;
use crate::element::{BinarySubtype, ElementType};
use crate::error::{BsonError, BsonResult};
use crate::oid::ObjectId;
use crate::value::{Array, Binary, Bson, JavaScriptCodeWithScope, Regex, Timestamp};

const OLD_MAX_DATE_TIME: i64 = 253_402_300_800_000;

/// Decode one document that must span the entire slice.
pub fn decode_document(bytes: &[u8]) -> BsonResult<Document> {
    decode_document_with(bytes, &ReaderSettings::default())
}

/// Decode one document with explicit settings.
pub fn decode_document_with(bytes: &[u8], settings: &ReaderSettings) -> BsonResult<Document> {
    let mut reader = DocumentReader::new(bytes, settings.clone());
    let document = reader
        .next_document()?
        .ok_or_else(|| BsonError::format("empty input"))?;
    if !reader.is_at_end() {
        return Err(BsonError::format(format!(
            "{} trailing bytes after document",
            bytes.len() - reader.position()
        )));
    }
    Ok(document)
}

/// Reads a sequence of concatenated top-level documents.
///
/// A failed read leaves the position at the start of the offending
/// document; no partially decoded value is ever returned.
#[derive(Debug, Clone)]
pub struct DocumentReader<'a> {
    bytes: &'a [u8],
    position: usize,
    settings: ReaderSettings,
}

impl<'a> DocumentReader<'a> {
    pub fn new(bytes: &'a [u8], settings: ReaderSettings) -> Self {
        Self {
            bytes,
            position: 0,
            settings,
        }
    }

    /// True once every byte has been consumed.
    pub fn is_at_end(&self) -> bool {
        self.position >= self.bytes.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Decode the next document, or `None` at end of input.
    pub fn next_document(&mut self) -> BsonResult<Option<Document>> {
        if self.is_at_end() {
            return Ok(None);
        }
        let mut cursor = Cursor {
            bytes: self.bytes,
            pos: self.position,
            settings: &self.settings,
        };
        let document = cursor.read_document(0)?;
        trace!(start = self.position, end = cursor.pos, "decoded document");
        self.position = cursor.pos;
        Ok(Some(document))
    }
}

impl Iterator for DocumentReader<'_> {
    type Item = BsonResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_document().transpose()
    }
}

struct Cursor<'a, 's> {
    bytes: &'a [u8],
    pos: usize,
    settings: &'s ReaderSettings,
}

impl<'a> Cursor<'a, '_> {
    fn take(&mut self, n: usize) -> BsonResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                BsonError::format(format!(
                    "unexpected end of input: needed {} bytes at offset {}",
                    n, self.pos
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_array_of<const N: usize>(&mut self) -> BsonResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> BsonResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_i32(&mut self) -> BsonResult<i32> {
        Ok(i32::from_le_bytes(self.read_array_of()?))
    }

    fn read_i64(&mut self) -> BsonResult<i64> {
        Ok(i64::from_le_bytes(self.read_array_of()?))
    }

    fn read_length(&mut self, what: &str) -> BsonResult<usize> {
        let length = self.read_i32()?;
        usize::try_from(length)
            .map_err(|_| BsonError::format(format!("negative {} length {}", what, length)))
    }

    fn read_cstring(&mut self) -> BsonResult<String> {
        let rest = &self.bytes[self.pos..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| BsonError::format("unterminated cstring"))?;
        let text = std::str::from_utf8(&rest[..nul])
            .map_err(|e| BsonError::format(format!("invalid UTF-8 in cstring: {}", e)))?
            .to_string();
        self.pos += nul + 1;
        Ok(text)
    }

    fn read_string(&mut self) -> BsonResult<String> {
        let length = self.read_length("string")?;
        if length == 0 {
            return Err(BsonError::format("string length must include the terminator"));
        }
        let raw = self.take(length)?;
        if raw[length - 1] != 0 {
            return Err(BsonError::format("string is not null-terminated"));
        }
        std::str::from_utf8(&raw[..length - 1])
            .map(str::to_string)
            .map_err(|e| BsonError::format(format!("invalid UTF-8 in string: {}", e)))
    }

    /// Reads the length prefix and returns the absolute end offset.
    fn read_container_header(&mut self) -> BsonResult<usize> {
        let start = self.pos;
        let length = self.read_length("document")?;
        if length < 5 {
            return Err(BsonError::format(format!("document length {} is too small", length)));
        }
        if length > self.settings.max_document_size {
            return Err(BsonError::DocumentTooLarge {
                size: length,
                max: self.settings.max_document_size,
            });
        }
        let end = start + length;
        if end > self.bytes.len() {
            return Err(BsonError::format(format!(
                "document length {} exceeds the {} bytes available",
                length,
                self.bytes.len() - start
            )));
        }
        Ok(end)
    }

    fn read_elements(
        &mut self,
        depth: usize,
        mut visit: impl FnMut(String, Bson) -> BsonResult<()>,
    ) -> BsonResult<()> {
        if depth > MAX_NESTING_DEPTH {
            return Err(BsonError::format("maximum nesting depth exceeded"));
        }
        let end = self.read_container_header()?;
        loop {
            if self.pos >= end {
                return Err(BsonError::format("document is missing its terminator"));
            }
            let tag = self.read_u8()?;
            if tag == 0 {
                if self.pos != end {
                    return Err(BsonError::format(format!(
                        "document length mismatch: terminator at {}, expected {}",
                        self.pos, end
                    )));
                }
                return Ok(());
            }
            let element_type = ElementType::from_u8(tag).ok_or_else(|| {
                BsonError::format(format!("invalid element type 0x{:02X} at offset {}", tag, self.pos - 1))
            })?;
            let name = self.read_cstring()?;
            let value = self.read_value(element_type, depth)?;
            if self.pos > end {
                return Err(BsonError::format(format!(
                    "element {:?} runs past the end of its document",
                    name
                )));
            }
            visit(name, value)?;
        }
    }

    fn read_document(&mut self, depth: usize) -> BsonResult<Document> {
        let mut document = Document::new();
        let policy = self.settings.duplicate_element_policy;
        self.read_elements(depth, |name, value| {
            if document.contains_key(&name) && policy == DuplicateElementPolicy::Reject {
                return Err(BsonError::format(format!("duplicate element name {:?}", name)));
            }
            document.insert(name, value);
            Ok(())
        })?;
        Ok(document)
    }

    fn read_array(&mut self, depth: usize) -> BsonResult<Array> {
        let mut items = Array::new();
        self.read_elements(depth, |_, value| {
            items.push(value);
            Ok(())
        })?;
        Ok(items)
    }

    fn read_binary(&mut self) -> BsonResult<Binary> {
        let length = self.read_length("binary")?;
        let subtype = BinarySubtype::from(self.read_u8()?);
        if subtype == BinarySubtype::BinaryOld {
            let inner = self.read_length("old binary")?;
            if length < 4 || inner != length - 4 {
                return Err(BsonError::format(format!(
                    "old binary inner length {} does not match outer length {}",
                    inner, length
                )));
            }
            let bytes = self.take(inner)?.to_vec();
            let subtype = if self.settings.fix_old_binary_subtype_on_input {
                BinarySubtype::Generic
            } else {
                subtype
            };
            return Ok(Binary { subtype, bytes });
        }
        Ok(Binary {
            subtype,
            bytes: self.take(length)?.to_vec(),
        })
    }

    fn read_value(&mut self, element_type: ElementType, depth: usize) -> BsonResult<Bson> {
        Ok(match element_type {
            ElementType::Double => Bson::Double(f64::from_le_bytes(self.read_array_of()?)),
            ElementType::String => Bson::String(self.read_string()?),
            ElementType::EmbeddedDocument => Bson::Document(self.read_document(depth + 1)?),
            ElementType::Array => Bson::Array(self.read_array(depth + 1)?),
            ElementType::Binary => Bson::Binary(self.read_binary()?),
            ElementType::Undefined => Bson::Undefined,
            ElementType::ObjectId => Bson::ObjectId(ObjectId::from_bytes(self.read_array_of()?)),
            ElementType::Boolean => match self.read_u8()? {
                0 => Bson::Boolean(false),
                1 => Bson::Boolean(true),
                other => {
                    return Err(BsonError::format(format!("invalid boolean byte 0x{:02X}", other)));
                }
            },
            ElementType::DateTime => {
                let mut millis = self.read_i64()?;
                if self.settings.fix_old_date_time_max_value_on_input && millis == OLD_MAX_DATE_TIME {
                    millis = DateTime::MAX_FOUR_DIGIT_YEAR.timestamp_millis();
                }
                Bson::DateTime(DateTime::from_millis(millis))
            }
            ElementType::Null => Bson::Null,
            ElementType::RegularExpression => {
                let pattern = self.read_cstring()?;
                let options = self.read_cstring()?;
                Bson::RegularExpression(Regex::new(pattern, options))
            }
            ElementType::JavaScript => Bson::JavaScriptCode(self.read_string()?),
            ElementType::Symbol => Bson::Symbol(self.read_string()?),
            ElementType::JavaScriptWithScope => {
                let start = self.pos;
                let length = self.read_length("code with scope")?;
                let code = self.read_string()?;
                let scope = self.read_document(depth + 1)?;
                if self.pos - start != length {
                    return Err(BsonError::format(format!(
                        "code with scope length {} does not match content length {}",
                        length,
                        self.pos - start
                    )));
                }
                Bson::JavaScriptCodeWithScope(JavaScriptCodeWithScope { code, scope })
            }
            ElementType::Int32 => Bson::Int32(self.read_i32()?),
            ElementType::Timestamp => {
                Bson::Timestamp(Timestamp::from_u64(u64::from_le_bytes(self.read_array_of()?)))
            }
            ElementType::Int64 => Bson::Int64(self.read_i64()?),
            ElementType::Decimal128 => Bson::Decimal128(Decimal128::from_bytes(self.read_array_of()?)),
            ElementType::MaxKey => Bson::MaxKey,
            ElementType::MinKey => Bson::MinKey,
        })
    }
}
