use super::WriterSettings;
use crate::document::Document;
use crate::element::{BinarySubtype, ElementType};
use crate::error::{BsonError, BsonResult};
use crate::value::{Binary, Bson};

/// Encode a document with default settings.
pub fn encode_document(document: &Document) -> BsonResult<Vec<u8>> {
    encode_document_with(document, &WriterSettings::default())
}

/// Encode a document with explicit settings.
pub fn encode_document_with(document: &Document, settings: &WriterSettings) -> BsonResult<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    encode_document_into(document, &mut out, settings)?;
    Ok(out)
}

/// Append an encoded document to `out`.
///
/// On failure `out` is restored to its original length.
pub fn encode_document_into(
    document: &Document,
    out: &mut Vec<u8>,
    settings: &WriterSettings,
) -> BsonResult<()> {
    let start = out.len();
    let mut writer = Writer { out, settings };
    let result = writer.write_document(document).and_then(|()| {
        let size = writer.out.len() - start;
        if size > settings.max_document_size {
            Err(BsonError::DocumentTooLarge {
                size,
                max: settings.max_document_size,
            })
        } else {
            Ok(())
        }
    });
    if result.is_err() {
        writer.out.truncate(start);
    }
    result
}

struct Writer<'a> {
    out: &'a mut Vec<u8>,
    settings: &'a WriterSettings,
}

impl Writer<'_> {
    fn write_i32(&mut self, value: i32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    fn write_length(&mut self, length: usize) -> BsonResult<()> {
        let length = i32::try_from(length)
            .map_err(|_| BsonError::format(format!("length {} exceeds int32 range", length)))?;
        self.write_i32(length);
        Ok(())
    }

    fn write_cstring(&mut self, text: &str) -> BsonResult<()> {
        if text.as_bytes().contains(&0) {
            return Err(BsonError::format(format!(
                "cstring {:?} contains a null byte",
                text
            )));
        }
        self.out.extend_from_slice(text.as_bytes());
        self.out.push(0);
        Ok(())
    }

    fn write_string(&mut self, text: &str) -> BsonResult<()> {
        self.write_length(text.len() + 1)?;
        self.out.extend_from_slice(text.as_bytes());
        self.out.push(0);
        Ok(())
    }

    /// Runs `body` between a length placeholder and the terminator.
    fn write_container(&mut self, body: impl FnOnce(&mut Self) -> BsonResult<()>) -> BsonResult<()> {
        let start = self.out.len();
        self.write_i32(0);
        body(self)?;
        self.out.push(0);
        let length = i32::try_from(self.out.len() - start)
            .map_err(|_| BsonError::format("document length exceeds int32 range"))?;
        self.out[start..start + 4].copy_from_slice(&length.to_le_bytes());
        Ok(())
    }

    fn write_document(&mut self, document: &Document) -> BsonResult<()> {
        self.write_container(|w| {
            for (name, value) in document {
                w.write_element(name, value)?;
            }
            Ok(())
        })
    }

    fn write_array(&mut self, items: &[Bson]) -> BsonResult<()> {
        self.write_container(|w| {
            for (index, value) in items.iter().enumerate() {
                w.write_element(&index.to_string(), value)?;
            }
            Ok(())
        })
    }

    fn write_binary(&mut self, binary: &Binary) -> BsonResult<()> {
        let old_layout = binary.subtype == BinarySubtype::BinaryOld;
        if old_layout && !self.settings.fix_old_binary_subtype_on_output {
            self.write_length(binary.bytes.len() + 4)?;
            self.out.push(u8::from(binary.subtype));
            self.write_length(binary.bytes.len())?;
        } else {
            let subtype = if old_layout {
                BinarySubtype::Generic
            } else {
                binary.subtype
            };
            self.write_length(binary.bytes.len())?;
            self.out.push(u8::from(subtype));
        }
        self.out.extend_from_slice(&binary.bytes);
        Ok(())
    }

    fn write_element(&mut self, name: &str, value: &Bson) -> BsonResult<()> {
        let element_type: ElementType = value.element_type();
        self.out.push(element_type.as_u8());
        self.write_cstring(name)?;
        match value {
            Bson::Double(v) => self.out.extend_from_slice(&v.to_le_bytes()),
            Bson::String(s) | Bson::JavaScriptCode(s) | Bson::Symbol(s) => self.write_string(s)?,
            Bson::Document(d) => self.write_document(d)?,
            Bson::Array(items) => self.write_array(items)?,
            Bson::Binary(b) => self.write_binary(b)?,
            Bson::Undefined | Bson::Null | Bson::MaxKey | Bson::MinKey => {}
            Bson::ObjectId(oid) => self.out.extend_from_slice(&oid.bytes()),
            Bson::Boolean(b) => self.out.push(u8::from(*b)),
            Bson::DateTime(dt) => self
                .out
                .extend_from_slice(&dt.timestamp_millis().to_le_bytes()),
            Bson::RegularExpression(re) => {
                self.write_cstring(&re.pattern)?;
                self.write_cstring(&re.options)?;
            }
            Bson::JavaScriptCodeWithScope(code) => {
                let start = self.out.len();
                self.write_i32(0);
                self.write_string(&code.code)?;
                self.write_document(&code.scope)?;
                let length = i32::try_from(self.out.len() - start)
                    .map_err(|_| BsonError::format("code with scope exceeds int32 range"))?;
                self.out[start..start + 4].copy_from_slice(&length.to_le_bytes());
            }
            Bson::Int32(v) => self.write_i32(*v),
            Bson::Timestamp(ts) => self.out.extend_from_slice(&ts.to_u64().to_le_bytes()),
            Bson::Int64(v) => self.out.extend_from_slice(&v.to_le_bytes()),
            Bson::Decimal128(d) => self.out.extend_from_slice(&d.bytes()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::decode_document;
    use crate::datetime::DateTime;
    use crate::decimal128::Decimal128;
    use crate::oid::ObjectId;
    use crate::value::{JavaScriptCodeWithScope, Regex, Timestamp};
    use crate::{array, doc};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_hello_world() {
        let bytes = encode_document(&doc! { "hello" => "world" }).unwrap();
        assert_eq!(
            bytes,
            b"\x16\x00\x00\x00\x02hello\x00\x06\x00\x00\x00world\x00\x00".to_vec()
        );
    }

    #[test]
    fn test_length_prefix_matches_output() {
        let doc = doc! {
            "a" => array![1, "two", 3.0],
            "nested" => doc! { "x" => Bson::Null },
        };
        let bytes = encode_document(&doc).unwrap();
        let prefix = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(prefix as usize, bytes.len());
    }

    #[test]
    fn test_round_trip_every_type() {
        let doc = doc! {
            "double" => -0.0,
            "nan" => f64::NAN,
            "string" => "text",
            "doc" => doc! { "k" => 1 },
            "array" => array![1, 2],
            "binary" => Binary::new(BinarySubtype::Uuid, vec![0u8; 16]),
            "undefined" => Bson::Undefined,
            "oid" => ObjectId::parse_str("5f1d7e0a9d3b2c4e8a6f0b1c").unwrap(),
            "bool" => true,
            "date" => DateTime::from_millis(-62_135_596_800_000),
            "null" => Bson::Null,
            "regex" => Regex::new("^a.*", "i"),
            "code" => Bson::JavaScriptCode("f()".into()),
            "scoped" => JavaScriptCodeWithScope { code: "x".into(), scope: doc! { "x" => 1 } },
            "symbol" => Bson::Symbol("sym".into()),
            "int" => 42,
            "ts" => Timestamp { time: 1, increment: 2 },
            "long" => 1i64 << 40,
            "decimal" => Decimal128::parse("1.5").unwrap(),
            "max" => Bson::MaxKey,
            "min" => Bson::MinKey,
        };
        let bytes = encode_document(&doc).unwrap();
        let decoded = decode_document(&bytes).unwrap();
        assert_eq!(decoded, doc);
        assert_eq!(encode_document(&decoded).unwrap(), bytes);
    }

    #[test]
    fn test_null_in_name_rejected() {
        let err = encode_document(&doc! { "a\0b" => 1 }).unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn test_failed_encode_restores_buffer() {
        let mut out = vec![1, 2, 3];
        let doc = doc! { "ok" => 1, "bad\0" => 2 };
        assert!(encode_document_into(&doc, &mut out, &WriterSettings::default()).is_err());
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn test_max_document_size_on_write() {
        let settings = WriterSettings {
            max_document_size: 16,
            ..WriterSettings::default()
        };
        let err = encode_document_with(&doc! { "s" => "long enough string" }, &settings).unwrap_err();
        assert!(matches!(err, BsonError::DocumentTooLarge { max: 16, .. }));
    }

    #[test]
    fn test_old_binary_layout() {
        let doc = doc! { "b" => Binary::new(BinarySubtype::BinaryOld, vec![7]) };
        let bytes = encode_document(&doc).unwrap();
        // 0x05 'b' 0x00 <len 5> 0x02 <len 1> 0x07
        assert_eq!(&bytes[7..17], &[5, 0, 0, 0, 2, 1, 0, 0, 0, 7]);

        let settings = WriterSettings {
            fix_old_binary_subtype_on_output: true,
            ..WriterSettings::default()
        };
        let fixed = encode_document_with(&doc, &settings).unwrap();
        assert_eq!(&fixed[7..13], &[1, 0, 0, 0, 0, 7]);
    }
}
