use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use uuid::Uuid;

use super::scanner::{Scanner, Token};
use crate::datetime::DateTime;
use crate::decimal128::Decimal128;
use crate::document::Document;
use crate::element::BinarySubtype;
use crate::error::{BsonError, BsonResult};
use crate::guid::GuidRepresentation;
use crate::oid::ObjectId;
use crate::value::{Binary, Bson, JavaScriptCodeWithScope, Regex, Timestamp};

/// Parse text that must contain exactly one document.
pub fn parse_document(text: &str) -> BsonResult<Document> {
    match parse_value(text)? {
        Bson::Document(document) => Ok(document),
        other => Err(BsonError::format(format!(
            "expected a document, found {}",
            other.element_type()
        ))),
    }
}

/// Parse text that must contain exactly one value.
pub fn parse_value(text: &str) -> BsonResult<Bson> {
    let mut reader = JsonReader::new(text);
    let value = reader.read_value()?;
    if !reader.is_at_end() {
        return Err(BsonError::format(format!(
            "JSON reader: unexpected trailing content at offset {}",
            reader.scanner.position()
        )));
    }
    Ok(value)
}

/// Reads values written in any supported dialect.
///
/// Several values may follow one another; [`JsonReader::is_at_end`] tells
/// when the input is exhausted.
#[derive(Debug)]
pub struct JsonReader<'a> {
    scanner: Scanner<'a>,
    peeked: Option<Token>,
}

impl<'a> JsonReader<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            scanner: Scanner::new(text),
            peeked: None,
        }
    }

    pub fn is_at_end(&mut self) -> bool {
        self.peeked.is_none() && self.scanner.at_end()
    }

    fn next(&mut self) -> BsonResult<Token> {
        match self.peeked.take() {
            Some(token) => Ok(token),
            None => self.scanner.next_token(),
        }
    }

    fn peek(&mut self) -> BsonResult<&Token> {
        let token = match self.peeked.take() {
            Some(token) => token,
            None => self.scanner.next_token()?,
        };
        Ok(self.peeked.insert(token))
    }

    fn error(&self, message: impl std::fmt::Display) -> BsonError {
        BsonError::format(format!(
            "JSON reader: {} near offset {}",
            message,
            self.scanner.position()
        ))
    }

    fn expect(&mut self, expected: Token) -> BsonResult<()> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}, found {:?}", expected, token)))
        }
    }

    /// Read the next complete value.
    pub fn read_value(&mut self) -> BsonResult<Bson> {
        match self.next()? {
            Token::BeginObject => self.read_document_body(),
            Token::BeginArray => self.read_array_body(),
            Token::String(s) => Ok(Bson::String(s)),
            Token::Number(text) => parse_number(&text).ok_or_else(|| self.error(format!("invalid number {:?}", text))),
            Token::Regex { pattern, options } => Ok(Bson::RegularExpression(Regex::new(pattern, options))),
            Token::Identifier(word) => self.read_identifier(&word),
            other => Err(self.error(format!("unexpected token {:?}", other))),
        }
    }

    fn read_document_body(&mut self) -> BsonResult<Bson> {
        let mut document = Document::new();
        if self.peek()? == &Token::EndObject {
            self.next()?;
            return Ok(Bson::Document(document));
        }
        loop {
            let name = match self.next()? {
                Token::String(s) | Token::Identifier(s) => s,
                other => return Err(self.error(format!("expected element name, found {:?}", other))),
            };
            self.expect(Token::Colon)?;
            let value = self.read_value()?;
            document.insert(name, value);
            match self.next()? {
                Token::Comma => continue,
                Token::EndObject => break,
                other => return Err(self.error(format!("expected ',' or '}}', found {:?}", other))),
            }
        }
        match interpret_wrapper(&document) {
            Some(result) => result.map_err(|e| self.error(e)),
            None => Ok(Bson::Document(document)),
        }
    }

    fn read_array_body(&mut self) -> BsonResult<Bson> {
        let mut items = Vec::new();
        if self.peek()? == &Token::EndArray {
            self.next()?;
            return Ok(Bson::Array(items));
        }
        loop {
            items.push(self.read_value()?);
            match self.next()? {
                Token::Comma => continue,
                Token::EndArray => return Ok(Bson::Array(items)),
                other => return Err(self.error(format!("expected ',' or ']', found {:?}", other))),
            }
        }
    }

    /// Arguments of a shell constructor call, after its name.
    fn read_arguments(&mut self) -> BsonResult<Vec<Bson>> {
        self.expect(Token::LeftParen)?;
        let mut args = Vec::new();
        if self.peek()? == &Token::RightParen {
            self.next()?;
            return Ok(args);
        }
        loop {
            args.push(self.read_value()?);
            match self.next()? {
                Token::Comma => continue,
                Token::RightParen => return Ok(args),
                other => return Err(self.error(format!("expected ',' or ')', found {:?}", other))),
            }
        }
    }

    fn read_optional_arguments(&mut self) -> BsonResult<()> {
        if self.peek()? == &Token::LeftParen {
            let args = self.read_arguments()?;
            if !args.is_empty() {
                return Err(self.error("unexpected arguments"));
            }
        }
        Ok(())
    }

    fn read_identifier(&mut self, word: &str) -> BsonResult<Bson> {
        match word {
            "true" => Ok(Bson::Boolean(true)),
            "false" => Ok(Bson::Boolean(false)),
            "null" => Ok(Bson::Null),
            "undefined" => Ok(Bson::Undefined),
            "NaN" | "+NaN" | "-NaN" => Ok(Bson::Double(f64::NAN)),
            "Infinity" | "+Infinity" => Ok(Bson::Double(f64::INFINITY)),
            "-Infinity" => Ok(Bson::Double(f64::NEG_INFINITY)),
            "MinKey" => {
                self.read_optional_arguments()?;
                Ok(Bson::MinKey)
            }
            "MaxKey" => {
                self.read_optional_arguments()?;
                Ok(Bson::MaxKey)
            }
            "new" => match self.next()? {
                Token::Identifier(name) => self.read_constructor(&name),
                other => Err(self.error(format!("expected constructor after 'new', found {:?}", other))),
            },
            _ => self.read_constructor(word),
        }
    }

    fn read_constructor(&mut self, name: &str) -> BsonResult<Bson> {
        let args = self.read_arguments()?;
        construct(name, &args).map_err(|e| self.error(e))
    }
}

/// Integers become Int32 when they fit, then Int64; anything with a
/// fraction or exponent becomes a Double.
fn parse_number(text: &str) -> Option<Bson> {
    let is_float = text.contains(['.', 'e', 'E']);
    if !is_float {
        if let Ok(v) = text.parse::<i64>() {
            return Some(i32::try_from(v).map_or(Bson::Int64(v), Bson::Int32));
        }
    }
    text.parse::<f64>().ok().map(Bson::Double)
}

fn expect_string<'b>(value: &'b Bson, what: &str) -> Result<&'b str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("{} must be a string, found {}", what, value.element_type()))
}

fn integer_argument(value: &Bson, what: &str) -> Result<i64, String> {
    match value {
        Bson::String(s) => s.parse().map_err(|_| format!("invalid {} {:?}", what, s)),
        other => other
            .to_i64_exact()
            .ok_or_else(|| format!("{} must be an integer, found {}", what, other.element_type())),
    }
}

fn parse_double_text(text: &str) -> Result<f64, String> {
    match text {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => text.parse().map_err(|_| format!("invalid $numberDouble {:?}", text)),
    }
}

fn subtype_from_hex(text: &str) -> Result<BinarySubtype, String> {
    if text.is_empty() || text.len() > 2 {
        return Err(format!("invalid binary subtype {:?}", text));
    }
    u8::from_str_radix(text, 16)
        .map(BinarySubtype::from)
        .map_err(|_| format!("invalid binary subtype {:?}", text))
}

fn decode_base64(text: &str) -> Result<Vec<u8>, String> {
    STANDARD
        .decode(text)
        .map_err(|e| format!("invalid base64 {:?}: {}", text, e))
}

fn parse_uuid(text: &str) -> Result<Uuid, String> {
    Uuid::parse_str(text).map_err(|e| format!("invalid uuid {:?}: {}", text, e))
}

fn date_from(value: &Bson) -> Result<Bson, String> {
    match value {
        Bson::String(s) => DateTime::parse_iso(s)
            .map(Bson::DateTime)
            .map_err(|e| e.to_string()),
        other => integer_argument(other, "$date")
            .map(|ms| Bson::DateTime(DateTime::from_millis(ms))),
    }
}

/// Recognise a `$`-prefixed wrapper document. `None` means the document is
/// an ordinary document; `Some(Err)` means it had a wrapper's shape but an
/// invalid payload.
fn interpret_wrapper(document: &Document) -> Option<Result<Bson, String>> {
    let (first, value) = document.first()?;
    if !first.starts_with('$') {
        return None;
    }
    let mut keys: Vec<&str> = document.keys().map(String::as_str).collect();
    keys.sort_unstable();

    let result = match keys.as_slice() {
        ["$oid"] => expect_string(value, "$oid")
            .and_then(|s| ObjectId::parse_str(s).map_err(|e| e.to_string()))
            .map(Bson::ObjectId),
        ["$symbol"] => expect_string(value, "$symbol").map(|s| Bson::Symbol(s.to_string())),
        ["$numberInt"] => expect_string(value, "$numberInt").and_then(|s| {
            s.parse::<i32>()
                .map(Bson::Int32)
                .map_err(|_| format!("invalid $numberInt {:?}", s))
        }),
        ["$numberLong"] => integer_argument(value, "$numberLong").map(Bson::Int64),
        ["$numberDouble"] => expect_string(value, "$numberDouble")
            .and_then(parse_double_text)
            .map(Bson::Double),
        ["$numberDecimal"] => expect_string(value, "$numberDecimal").and_then(|s| {
            Decimal128::parse(s)
                .map(Bson::Decimal128)
                .map_err(|e| e.to_string())
        }),
        ["$binary"] => {
            let Some(inner) = value.as_document() else {
                return Some(Err("$binary must be a document".to_string()));
            };
            let base64 = inner.get("base64").ok_or("$binary is missing base64");
            let subtype = inner.get("subType").ok_or("$binary is missing subType");
            match (base64, subtype) {
                (Ok(b), Ok(t)) if inner.len() == 2 => expect_string(b, "base64")
                    .and_then(decode_base64)
                    .and_then(|bytes| {
                        let subtype = subtype_from_hex(expect_string(t, "subType")?)?;
                        Ok(Bson::Binary(Binary { subtype, bytes }))
                    }),
                (Err(e), _) | (_, Err(e)) => Err(e.to_string()),
                _ => Err("$binary has unexpected fields".to_string()),
            }
        }
        ["$binary", "$type"] => {
            let bytes = document
                .get("$binary")
                .ok_or_else(|| "$binary missing".to_string())
                .and_then(|b| expect_string(b, "$binary"))
                .and_then(decode_base64);
            let subtype = document
                .get("$type")
                .ok_or_else(|| "$type missing".to_string())
                .and_then(|t| expect_string(t, "$type"))
                .and_then(subtype_from_hex);
            bytes.and_then(|bytes| subtype.map(|subtype| Bson::Binary(Binary { subtype, bytes })))
        }
        ["$uuid"] => expect_string(value, "$uuid")
            .and_then(parse_uuid)
            .map(|uuid| Bson::Binary(Binary::new(BinarySubtype::Uuid, uuid.as_bytes().to_vec()))),
        ["$code"] => expect_string(value, "$code").map(|s| Bson::JavaScriptCode(s.to_string())),
        ["$code", "$scope"] => {
            let code = document.get("$code").map(|c| expect_string(c, "$code"));
            let scope = document.get("$scope").and_then(Bson::as_document);
            match (code, scope) {
                (Some(Ok(code)), Some(scope)) => Ok(Bson::JavaScriptCodeWithScope(JavaScriptCodeWithScope {
                    code: code.to_string(),
                    scope: scope.clone(),
                })),
                _ => Err("$code with $scope needs a string and a document".to_string()),
            }
        }
        ["$timestamp"] => match value.as_document() {
            Some(inner) => {
                let part = |name: &str| -> Result<u32, String> {
                    let v = inner.get(name).ok_or_else(|| format!("$timestamp is missing {}", name))?;
                    let n = integer_argument(v, name)?;
                    u32::try_from(n).map_err(|_| format!("$timestamp {} out of range", name))
                };
                part("t").and_then(|time| {
                    part("i").map(|increment| Bson::Timestamp(Timestamp { time, increment }))
                })
            }
            None => Err("$timestamp must be a document".to_string()),
        },
        ["$regularExpression"] => match value.as_document() {
            Some(inner) => {
                let pattern = inner.get("pattern").map(|p| expect_string(p, "pattern"));
                let options = inner.get("options").map(|o| expect_string(o, "options"));
                match (pattern, options) {
                    (Some(Ok(p)), Some(Ok(o))) => Ok(Bson::RegularExpression(Regex::new(p, o))),
                    _ => Err("$regularExpression needs string pattern and options".to_string()),
                }
            }
            None => Err("$regularExpression must be a document".to_string()),
        },
        ["$options", "$regex"] => {
            let pattern = document.get("$regex").and_then(Bson::as_str);
            let options = document.get("$options").and_then(Bson::as_str);
            match (pattern, options) {
                (Some(p), Some(o)) => Ok(Bson::RegularExpression(Regex::new(p, o))),
                // Query operator form with a regex value; leave as a document.
                _ => return None,
            }
        }
        ["$date"] => date_from(value),
        ["$minKey"] => Ok(Bson::MinKey),
        ["$maxKey"] => Ok(Bson::MaxKey),
        ["$undefined"] => Ok(Bson::Undefined),
        _ => return None,
    };
    Some(result)
}

/// Shell constructor calls such as `NumberLong("5")` or `BinData(0, "AQ==")`.
fn construct(name: &str, args: &[Bson]) -> Result<Bson, String> {
    let arity = |n: usize| -> Result<(), String> {
        if args.len() == n {
            Ok(())
        } else {
            Err(format!("{} expects {} argument(s), found {}", name, n, args.len()))
        }
    };
    match name {
        "ObjectId" => {
            arity(1)?;
            let hex = expect_string(&args[0], "ObjectId")?;
            ObjectId::parse_str(hex).map(Bson::ObjectId).map_err(|e| e.to_string())
        }
        "NumberInt" => {
            arity(1)?;
            let v = integer_argument(&args[0], "NumberInt")?;
            i32::try_from(v)
                .map(Bson::Int32)
                .map_err(|_| format!("NumberInt value {} out of range", v))
        }
        "NumberLong" => {
            arity(1)?;
            integer_argument(&args[0], "NumberLong").map(Bson::Int64)
        }
        "NumberDecimal" => {
            arity(1)?;
            let decimal = match &args[0] {
                Bson::String(s) => Decimal128::parse(s).map_err(|e| e.to_string())?,
                Bson::Int32(v) => Decimal128::from_i64(i64::from(*v)),
                Bson::Int64(v) => Decimal128::from_i64(*v),
                Bson::Double(v) => Decimal128::from_f64(*v),
                other => return Err(format!("NumberDecimal cannot take {}", other.element_type())),
            };
            Ok(Bson::Decimal128(decimal))
        }
        "ISODate" => {
            arity(1)?;
            let text = expect_string(&args[0], "ISODate")?;
            DateTime::parse_iso(text).map(Bson::DateTime).map_err(|e| e.to_string())
        }
        "Date" => match args {
            [] => Ok(Bson::DateTime(DateTime::now())),
            [value] => date_from(value),
            _ => Err("Date expects at most one argument".to_string()),
        },
        "BinData" => {
            arity(2)?;
            let subtype = integer_argument(&args[0], "BinData subtype")?;
            let subtype = u8::try_from(subtype).map_err(|_| format!("invalid BinData subtype {}", subtype))?;
            let bytes = decode_base64(expect_string(&args[1], "BinData")?)?;
            Ok(Bson::Binary(Binary::new(BinarySubtype::from(subtype), bytes)))
        }
        "HexData" => {
            arity(2)?;
            let subtype = integer_argument(&args[0], "HexData subtype")?;
            let subtype = u8::try_from(subtype).map_err(|_| format!("invalid HexData subtype {}", subtype))?;
            let bytes = hex::decode(expect_string(&args[1], "HexData")?).map_err(|e| e.to_string())?;
            Ok(Bson::Binary(Binary::new(BinarySubtype::from(subtype), bytes)))
        }
        "UUID" | "CSUUID" | "CSGUID" | "JUUID" | "JGUID" | "PYUUID" | "PYGUID" => {
            arity(1)?;
            let uuid = parse_uuid(expect_string(&args[0], name)?)?;
            let representation = match name {
                "UUID" => GuidRepresentation::Standard,
                "CSUUID" | "CSGUID" => GuidRepresentation::CSharpLegacy,
                "JUUID" | "JGUID" => GuidRepresentation::JavaLegacy,
                _ => GuidRepresentation::PythonLegacy,
            };
            representation
                .to_binary(uuid)
                .map(Bson::Binary)
                .map_err(|e| e.to_string())
        }
        "Timestamp" => {
            arity(2)?;
            let time = integer_argument(&args[0], "Timestamp time")?;
            let increment = integer_argument(&args[1], "Timestamp increment")?;
            match (u32::try_from(time), u32::try_from(increment)) {
                (Ok(time), Ok(increment)) => Ok(Bson::Timestamp(Timestamp { time, increment })),
                _ => Err("Timestamp fields out of range".to_string()),
            }
        }
        "RegExp" => {
            let pattern = args.first().map(|p| expect_string(p, "RegExp")).transpose()?;
            let options = args.get(1).map(|o| expect_string(o, "RegExp")).transpose()?;
            Ok(Bson::RegularExpression(Regex::new(
                pattern.unwrap_or_default(),
                options.unwrap_or_default(),
            )))
        }
        other => Err(format!("unknown constructor {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::{JsonWriterSettings, document_to_json};
    use crate::{array, doc};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_plain_json() {
        let doc = parse_document(r#"{ "a" : 1, "b" : [true, null, "x"], "c" : 2.5, "d" : 4294967296 }"#).unwrap();
        assert_eq!(
            doc,
            doc! {
                "a" => 1,
                "b" => array![true, Bson::Null, "x"],
                "c" => 2.5,
                "d" => 4_294_967_296i64,
            }
        );
    }

    #[test]
    fn test_canonical_wrappers() {
        let doc = parse_document(
            r#"{ "i" : { "$numberInt" : "7" }, "l" : { "$numberLong" : "7" },
                 "d" : { "$numberDouble" : "-0.0" }, "n" : { "$numberDouble" : "NaN" },
                 "dt" : { "$date" : { "$numberLong" : "0" } },
                 "b" : { "$binary" : { "base64" : "AQ==", "subType" : "00" } } }"#,
        )
        .unwrap();
        assert_eq!(doc.get("i"), Some(&Bson::Int32(7)));
        assert_eq!(doc.get("l"), Some(&Bson::Int64(7)));
        assert_eq!(doc.get("d"), Some(&Bson::Double(-0.0)));
        assert!(doc.get_f64("n").unwrap().is_nan());
        assert_eq!(doc.get("dt"), Some(&Bson::DateTime(DateTime::UNIX_EPOCH)));
        assert_eq!(doc.get("b"), Some(&Bson::Binary(Binary::new(BinarySubtype::Generic, vec![1]))));
    }

    #[test]
    fn test_legacy_wrappers() {
        let doc = parse_document(
            r#"{ "b" : { "$binary" : "AQ==", "$type" : "80" }, "d" : { "$date" : 1000 },
                 "r" : { "$regex" : "^a", "$options" : "mi" }, "s" : { "$date" : "1970-01-01T00:00:01Z" } }"#,
        )
        .unwrap();
        assert_eq!(
            doc.get("b"),
            Some(&Bson::Binary(Binary::new(BinarySubtype::UserDefined(0x80), vec![1])))
        );
        assert_eq!(doc.get("d"), Some(&Bson::DateTime(DateTime::from_millis(1000))));
        assert_eq!(doc.get("s"), Some(&Bson::DateTime(DateTime::from_millis(1000))));
        assert_eq!(doc.get("r"), Some(&Bson::RegularExpression(Regex::new("^a", "im"))));
    }

    #[test]
    fn test_shell_dialect() {
        let doc = parse_document(
            r#"{ l : NumberLong(1), big : NumberLong("2147483648"), dec : NumberDecimal("1.5"),
                 d : ISODate("1970-01-01T00:00:00Z"), nd : new Date(5), bin : new BinData(0, "AQ=="),
                 re : /a\/b/i, ts : Timestamp(1, 2), min : MinKey, max : MaxKey(), u : undefined,
                 inf : -Infinity, oid : ObjectId("5f1d7e0a9d3b2c4e8a6f0b1c"), s : 'single' }"#,
        )
        .unwrap();
        assert_eq!(doc.get("l"), Some(&Bson::Int64(1)));
        assert_eq!(doc.get("big"), Some(&Bson::Int64(2_147_483_648)));
        assert_eq!(doc.get("dec"), Some(&Bson::Decimal128(Decimal128::parse("1.5").unwrap())));
        assert_eq!(doc.get("d"), Some(&Bson::DateTime(DateTime::UNIX_EPOCH)));
        assert_eq!(doc.get("nd"), Some(&Bson::DateTime(DateTime::from_millis(5))));
        assert_eq!(doc.get("re"), Some(&Bson::RegularExpression(Regex::new(r"a\/b", "i"))));
        assert_eq!(doc.get("ts"), Some(&Bson::Timestamp(Timestamp { time: 1, increment: 2 })));
        assert_eq!(doc.get("min"), Some(&Bson::MinKey));
        assert_eq!(doc.get("max"), Some(&Bson::MaxKey));
        assert_eq!(doc.get("u"), Some(&Bson::Undefined));
        assert_eq!(doc.get("inf"), Some(&Bson::Double(f64::NEG_INFINITY)));
        assert_eq!(doc.get_str("s").unwrap(), "single");
    }

    #[test]
    fn test_legacy_uuid_constructors() {
        let value = parse_value(r#"CSUUID("01020304-0506-0708-090a-0b0c0d0e0f10")"#).unwrap();
        let Bson::Binary(binary) = value else {
            panic!("expected binary");
        };
        assert_eq!(binary.subtype, BinarySubtype::UuidLegacy);
        assert_eq!(&binary.bytes[..4], &[4, 3, 2, 1]);
    }

    #[test]
    fn test_canonical_text_round_trip() {
        let text = r#"{ "a" : { "$numberInt" : "1" }, "b" : { "$numberLong" : "2" }, "c" : { "$numberDouble" : "1.5E+40" }, "d" : [{ "$numberDecimal" : "0.5" }, { "$oid" : "5f1d7e0a9d3b2c4e8a6f0b1c" }], "e" : { "$date" : { "$numberLong" : "-5" } }, "f" : { "$regularExpression" : { "pattern" : "x", "options" : "" } }, "g" : { } }"#;
        let doc = parse_document(text).unwrap();
        assert_eq!(document_to_json(&doc, &JsonWriterSettings::canonical()), text);
    }

    #[test]
    fn test_shell_text_round_trip() {
        let doc = doc! {
            "n" => 1i64,
            "when" => DateTime::from_millis(1500),
            "pattern" => Regex::new(r"a\/b\d", "i"),
            "id" => Binary::new(BinarySubtype::Uuid, vec![9u8; 16]),
        };
        let text = document_to_json(&doc, &JsonWriterSettings::shell());
        assert_eq!(parse_document(&text).unwrap(), doc);
    }

    #[test]
    fn test_invalid_wrappers() {
        assert!(parse_document(r#"{ "x" : { "$numberInt" : "1.5" } }"#).is_err());
        assert!(parse_document(r#"{ "x" : { "$oid" : "nope" } }"#).is_err());
        assert!(parse_document(r#"{ "x" : { "$binary" : { "base64" : "!!", "subType" : "00" } } }"#).is_err());
    }

    #[test]
    fn test_query_operators_stay_documents() {
        let doc = parse_document(r#"{ "x" : { "$gte" : 3, "$lte" : 10 } }"#).unwrap();
        assert_eq!(doc, doc! { "x" => doc! { "$gte" => 3, "$lte" => 10 } });
    }

    #[test]
    fn test_syntax_errors() {
        for text in [r#"{ "a" 1 }"#, r#"{ "a" : 1 "#, "[1, 2", r#"{ "a" : 1 } x"#, "NumberLong(1, 2)", "Bogus(1)"] {
            assert!(parse_value(text).is_err(), "{:?} should fail", text);
        }
    }

    #[test]
    fn test_multiple_values() {
        let mut reader = JsonReader::new("{ \"a\" : 1 } { \"b\" : 2 }");
        assert_eq!(reader.read_value().unwrap(), Bson::Document(doc! { "a" => 1 }));
        assert!(!reader.is_at_end());
        assert_eq!(reader.read_value().unwrap(), Bson::Document(doc! { "b" => 2 }));
        assert!(reader.is_at_end());
    }
}
