//! Extended JSON in canonical, relaxed and shell dialects.
//!
//! Output is formatted as `{ "a" : 1, "b" : [1, 2] }`; the empty document
//! is `{ }` and the empty array `[]`. The reader accepts all three dialects
//! plus the legacy `$date`/`$binary`/`$regex` wrapper forms, whatever mode
//! produced them.

mod reader;
mod scanner;
mod writer;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use reader::{JsonReader, parse_document, parse_value};
pub use writer::{JsonWriter, format_double};

use crate::document::Document;
use crate::error::{BsonError, BsonResult};
use crate::value::Bson;

/// Which dialect the writer produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonOutputMode {
    /// Every typed value wrapped explicitly; always lossless.
    Canonical,
    /// Plain JSON literals where unambiguous.
    #[default]
    Relaxed,
    /// The interactive shell syntax: `NumberLong(1)`, `ISODate("…")`, `/re/i`.
    Shell,
}

/// Writer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonWriterSettings {
    pub output_mode: JsonOutputMode,
    pub indent: bool,
    pub indent_chars: String,
    pub new_line_chars: String,
}

impl Default for JsonWriterSettings {
    fn default() -> Self {
        Self {
            output_mode: JsonOutputMode::Relaxed,
            indent: false,
            indent_chars: "  ".to_string(),
            new_line_chars: "\n".to_string(),
        }
    }
}

impl JsonWriterSettings {
    pub fn new(output_mode: JsonOutputMode) -> Self {
        Self {
            output_mode,
            ..Self::default()
        }
    }

    pub fn canonical() -> Self {
        Self::new(JsonOutputMode::Canonical)
    }

    pub fn relaxed() -> Self {
        Self::new(JsonOutputMode::Relaxed)
    }

    pub fn shell() -> Self {
        Self::new(JsonOutputMode::Shell)
    }

    pub fn with_indent(mut self, indent: bool) -> Self {
        self.indent = indent;
        self
    }
}

/// Whether decoding the written text yields exactly the original value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fidelity {
    Lossless,
    Lossy,
}

impl Fidelity {
    pub fn is_lossless(self) -> bool {
        self == Self::Lossless
    }
}

/// Report whether writing `value` in `mode` loses type information.
///
/// Relaxed output writes an `Int64` that fits in 32 bits as a bare number,
/// which reads back as `Int32`. Shell output escapes a bare `/` in a regex
/// pattern, which reads back as `\/`, and cannot express a pattern ending
/// in an unpaired `\`. Every other value in every mode round-trips.
pub fn fidelity(value: &Bson, mode: JsonOutputMode) -> Fidelity {
    let lossy = match value {
        Bson::Int64(v) => mode == JsonOutputMode::Relaxed && i32::try_from(*v).is_ok(),
        Bson::RegularExpression(re) => {
            mode == JsonOutputMode::Shell && !writer::shell_pattern_round_trips(&re.pattern)
        }
        Bson::Document(doc) => !document_fidelity(doc, mode).is_lossless(),
        Bson::Array(items) => items.iter().any(|v| !fidelity(v, mode).is_lossless()),
        Bson::JavaScriptCodeWithScope(code) => !document_fidelity(&code.scope, mode).is_lossless(),
        _ => false,
    };
    if lossy { Fidelity::Lossy } else { Fidelity::Lossless }
}

/// [`fidelity`] over every element of a document.
pub fn document_fidelity(document: &Document, mode: JsonOutputMode) -> Fidelity {
    if document.values().any(|v| !fidelity(v, mode).is_lossless()) {
        Fidelity::Lossy
    } else {
        Fidelity::Lossless
    }
}

/// Write a single value.
pub fn to_json(value: &Bson, settings: &JsonWriterSettings) -> String {
    let mut writer = JsonWriter::new(settings);
    writer.write_value(value);
    writer.into_string()
}

/// Write a document.
pub fn document_to_json(document: &Document, settings: &JsonWriterSettings) -> String {
    let mut writer = JsonWriter::new(settings);
    writer.write_document(document);
    writer.into_string()
}

/// Write a document and report its fidelity in the chosen mode.
pub fn to_json_with_fidelity(document: &Document, settings: &JsonWriterSettings) -> (String, Fidelity) {
    (
        document_to_json(document, settings),
        document_fidelity(document, settings.output_mode),
    )
}

impl Document {
    pub fn to_canonical_json(&self) -> String {
        document_to_json(self, &JsonWriterSettings::canonical())
    }

    pub fn to_relaxed_json(&self) -> String {
        document_to_json(self, &JsonWriterSettings::relaxed())
    }

    pub fn to_shell_json(&self) -> String {
        document_to_json(self, &JsonWriterSettings::shell())
    }

    /// Parse any supported dialect.
    pub fn from_json(text: &str) -> BsonResult<Self> {
        parse_document(text)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_relaxed_json())
    }
}

impl fmt::Display for Bson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_json(self, &JsonWriterSettings::relaxed()))
    }
}

impl Bson {
    /// Convert into a `serde_json::Value` following the relaxed dialect.
    pub fn into_relaxed_json(self) -> BsonResult<serde_json::Value> {
        let text = to_json(&self, &JsonWriterSettings::relaxed());
        serde_json::from_str(&text).map_err(|e| BsonError::format(format!("relaxed JSON: {}", e)))
    }
}

impl From<serde_json::Value> for Bson {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match value {
            Json::Null => Bson::Null,
            Json::Bool(b) => Bson::Boolean(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i32::try_from(i).map_or(Bson::Int64(i), Bson::Int32)
                } else {
                    Bson::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Bson::String(s),
            Json::Array(items) => Bson::Array(items.into_iter().map(Bson::from).collect()),
            Json::Object(map) => {
                Bson::Document(map.into_iter().map(|(k, v)| (k, Bson::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::value::Regex;

    #[test]
    fn test_relaxed_int64_is_lossy() {
        assert_eq!(fidelity(&Bson::Int64(1), JsonOutputMode::Relaxed), Fidelity::Lossy);
        assert_eq!(fidelity(&Bson::Int64(1), JsonOutputMode::Canonical), Fidelity::Lossless);
        assert_eq!(fidelity(&Bson::Int64(1), JsonOutputMode::Shell), Fidelity::Lossless);
        assert_eq!(
            fidelity(&Bson::Int64(1 << 40), JsonOutputMode::Relaxed),
            Fidelity::Lossless
        );
    }

    #[test]
    fn test_nested_fidelity() {
        let doc = doc! { "outer" => doc! { "n" => 5i64 } };
        let (text, fidelity) = to_json_with_fidelity(&doc, &JsonWriterSettings::relaxed());
        assert_eq!(text, r#"{ "outer" : { "n" : 5 } }"#);
        assert_eq!(fidelity, Fidelity::Lossy);
    }

    #[test]
    fn test_shell_regex_fidelity() {
        let shell = JsonWriterSettings::shell();
        for (pattern, lossless) in [(r"a\/b", true), (r"\d+\\", true), ("a/b", false), (r"a/b\/c", false), ("a\\", false)] {
            let document = doc! { "r" => Regex::new(pattern, "mi") };
            let (text, reported) = to_json_with_fidelity(&document, &shell);
            assert_eq!(reported.is_lossless(), lossless, "{pattern} -> {text}");
            let round_trip = Document::from_json(&text).map(|parsed| parsed == document);
            if lossless {
                assert_eq!(round_trip, Ok(true), "{text}");
            } else {
                assert_ne!(round_trip, Ok(true), "{text}");
            }
        }
        assert_eq!(
            fidelity(&Bson::RegularExpression(Regex::new("a/b", "")), JsonOutputMode::Canonical),
            Fidelity::Lossless
        );
    }

    #[test]
    fn test_serde_json_interop() {
        let json = serde_json::json!({ "a": 1, "b": [true, null], "c": 2.5, "d": 8589934592i64 });
        let bson = Bson::from(json.clone());
        let doc = bson.as_document().unwrap();
        assert_eq!(doc.get("a"), Some(&Bson::Int32(1)));
        assert_eq!(doc.get("d"), Some(&Bson::Int64(8_589_934_592)));
        assert_eq!(bson.into_relaxed_json().unwrap(), json);
    }
}
