use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::{JsonOutputMode, JsonWriterSettings};
use crate::datetime::DateTime;
use crate::document::Document;
use crate::element::BinarySubtype;
use crate::value::{Binary, Bson};

/// First and last instants the shell's `ISODate(...)` form is used for.
const SHELL_ISO_MIN_MILLIS: i64 = -62_135_596_800_000;

/// Format a double the way every dialect spells it: shortest round-trip
/// digits, a `.0` suffix on integral values, and exponent notation such as
/// `1.5E+40` or `1E-05` outside the fixed-point window.
pub fn format_double(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let scientific = format!("{:e}", value);
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if value != 0.0 && !(-4..15).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{}E{}{:02}", mantissa, sign, exponent.abs());
    }
    let plain = value.to_string();
    if plain.contains('.') {
        plain
    } else {
        format!("{}.0", plain)
    }
}

/// Streams values into extended JSON text.
#[derive(Debug)]
pub struct JsonWriter<'s> {
    settings: &'s JsonWriterSettings,
    out: String,
    depth: usize,
}

impl<'s> JsonWriter<'s> {
    pub fn new(settings: &'s JsonWriterSettings) -> Self {
        Self {
            settings,
            out: String::new(),
            depth: 0,
        }
    }

    pub fn into_string(self) -> String {
        self.out
    }

    fn mode(&self) -> JsonOutputMode {
        self.settings.output_mode
    }

    fn write_string_literal(&mut self, text: &str) {
        self.out.push('"');
        for c in text.chars() {
            match c {
                '"' => self.out.push_str("\\\""),
                '\\' => self.out.push_str("\\\\"),
                '\u{08}' => self.out.push_str("\\b"),
                '\u{0C}' => self.out.push_str("\\f"),
                '\n' => self.out.push_str("\\n"),
                '\r' => self.out.push_str("\\r"),
                '\t' => self.out.push_str("\\t"),
                c if (c as u32) < 0x20 => {
                    self.out.push_str(&format!("\\u{:04x}", c as u32));
                }
                c => self.out.push(c),
            }
        }
        self.out.push('"');
    }

    /// `{ "$name" : "text" }`
    fn write_wrapped_string(&mut self, name: &str, text: &str) {
        self.out.push_str("{ \"");
        self.out.push_str(name);
        self.out.push_str("\" : ");
        self.write_string_literal(text);
        self.out.push_str(" }");
    }

    fn new_line(&mut self) {
        self.out.push_str(&self.settings.new_line_chars);
        for _ in 0..self.depth {
            self.out.push_str(&self.settings.indent_chars);
        }
    }

    pub fn write_document(&mut self, document: &Document) {
        if document.is_empty() {
            self.out.push_str("{ }");
            return;
        }
        if self.settings.indent {
            self.out.push('{');
            self.depth += 1;
            for (i, (name, value)) in document.iter().enumerate() {
                if i > 0 {
                    self.out.push(',');
                }
                self.new_line();
                self.write_string_literal(name);
                self.out.push_str(" : ");
                self.write_value(value);
            }
            self.depth -= 1;
            self.new_line();
            self.out.push('}');
        } else {
            self.out.push_str("{ ");
            for (i, (name, value)) in document.iter().enumerate() {
                if i > 0 {
                    self.out.push_str(", ");
                }
                self.write_string_literal(name);
                self.out.push_str(" : ");
                self.write_value(value);
            }
            self.out.push_str(" }");
        }
    }

    fn write_array(&mut self, items: &[Bson]) {
        self.out.push('[');
        for (i, value) in items.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.write_value(value);
        }
        self.out.push(']');
    }

    fn write_double(&mut self, value: f64) {
        let text = format_double(value);
        match self.mode() {
            JsonOutputMode::Canonical => self.write_wrapped_string("$numberDouble", &text),
            JsonOutputMode::Relaxed if !value.is_finite() => {
                self.write_wrapped_string("$numberDouble", &text)
            }
            _ => self.out.push_str(&text),
        }
    }

    fn write_binary(&mut self, binary: &Binary) {
        let base64 = STANDARD.encode(&binary.bytes);
        let subtype = u8::from(binary.subtype);
        if self.mode() == JsonOutputMode::Shell {
            if binary.subtype == BinarySubtype::Uuid {
                if let Ok(bytes) = <[u8; 16]>::try_from(binary.bytes.as_slice()) {
                    let uuid = uuid::Uuid::from_bytes(bytes);
                    self.out.push_str(&format!("UUID(\"{}\")", uuid.hyphenated()));
                    return;
                }
            }
            self.out.push_str(&format!("new BinData({}, \"{}\")", subtype, base64));
            return;
        }
        self.out.push_str("{ \"$binary\" : { \"base64\" : ");
        self.write_string_literal(&base64);
        self.out.push_str(&format!(", \"subType\" : \"{:02x}\" }} }}", subtype));
    }

    fn write_date_time(&mut self, value: DateTime) {
        let millis = value.timestamp_millis();
        match self.mode() {
            JsonOutputMode::Shell => {
                let in_range = (SHELL_ISO_MIN_MILLIS..=DateTime::MAX_FOUR_DIGIT_YEAR.timestamp_millis())
                    .contains(&millis);
                match value.to_iso_string().filter(|_| in_range) {
                    Some(iso) => self.out.push_str(&format!("ISODate(\"{}\")", iso)),
                    None => self.out.push_str(&format!("new Date({})", millis)),
                }
            }
            JsonOutputMode::Relaxed if value.is_in_relaxed_range() => {
                let iso = value.to_iso_string().unwrap_or_default();
                self.out.push_str("{ \"$date\" : ");
                self.write_string_literal(&iso);
                self.out.push_str(" }");
            }
            _ => self
                .out
                .push_str(&format!("{{ \"$date\" : {{ \"$numberLong\" : \"{}\" }} }}", millis)),
        }
    }

    pub fn write_value(&mut self, value: &Bson) {
        let mode = self.mode();
        match value {
            Bson::Double(v) => self.write_double(*v),
            Bson::String(s) => self.write_string_literal(s),
            Bson::Document(d) => self.write_document(d),
            Bson::Array(items) => self.write_array(items),
            Bson::Binary(b) => self.write_binary(b),
            Bson::Undefined => match mode {
                JsonOutputMode::Shell => self.out.push_str("undefined"),
                _ => self.out.push_str("{ \"$undefined\" : true }"),
            },
            Bson::ObjectId(oid) => match mode {
                JsonOutputMode::Shell => self.out.push_str(&format!("ObjectId(\"{}\")", oid)),
                _ => self.write_wrapped_string("$oid", &oid.to_hex()),
            },
            Bson::Boolean(b) => self.out.push_str(if *b { "true" } else { "false" }),
            Bson::DateTime(dt) => self.write_date_time(*dt),
            Bson::Null => self.out.push_str("null"),
            Bson::RegularExpression(re) => match mode {
                JsonOutputMode::Shell => {
                    self.out.push('/');
                    self.out.push_str(&escape_regex_pattern(&re.pattern));
                    self.out.push('/');
                    self.out.push_str(&re.options);
                }
                _ => {
                    self.out.push_str("{ \"$regularExpression\" : { \"pattern\" : ");
                    self.write_string_literal(&re.pattern);
                    self.out.push_str(", \"options\" : ");
                    self.write_string_literal(&re.options);
                    self.out.push_str(" } }");
                }
            },
            Bson::JavaScriptCode(code) => self.write_wrapped_string("$code", code),
            Bson::JavaScriptCodeWithScope(code) => {
                self.out.push_str("{ \"$code\" : ");
                self.write_string_literal(&code.code);
                self.out.push_str(", \"$scope\" : ");
                self.write_document(&code.scope);
                self.out.push_str(" }");
            }
            Bson::Symbol(s) => self.write_wrapped_string("$symbol", s),
            Bson::Int32(v) => match mode {
                JsonOutputMode::Canonical => self.write_wrapped_string("$numberInt", &v.to_string()),
                _ => self.out.push_str(&v.to_string()),
            },
            Bson::Timestamp(ts) => match mode {
                JsonOutputMode::Shell => {
                    self.out.push_str(&format!("Timestamp({}, {})", ts.time, ts.increment))
                }
                _ => self.out.push_str(&format!(
                    "{{ \"$timestamp\" : {{ \"t\" : {}, \"i\" : {} }} }}",
                    ts.time, ts.increment
                )),
            },
            Bson::Int64(v) => match mode {
                JsonOutputMode::Canonical => self.write_wrapped_string("$numberLong", &v.to_string()),
                JsonOutputMode::Relaxed => self.out.push_str(&v.to_string()),
                JsonOutputMode::Shell => {
                    if i32::try_from(*v).is_ok() {
                        self.out.push_str(&format!("NumberLong({})", v));
                    } else {
                        self.out.push_str(&format!("NumberLong(\"{}\")", v));
                    }
                }
            },
            Bson::Decimal128(d) => match mode {
                JsonOutputMode::Shell => self.out.push_str(&format!("NumberDecimal(\"{}\")", d)),
                _ => self.write_wrapped_string("$numberDecimal", &d.to_string()),
            },
            Bson::MaxKey => match mode {
                JsonOutputMode::Shell => self.out.push_str("MaxKey"),
                _ => self.out.push_str("{ \"$maxKey\" : 1 }"),
            },
            Bson::MinKey => match mode {
                JsonOutputMode::Shell => self.out.push_str("MinKey"),
                _ => self.out.push_str("{ \"$minKey\" : 1 }"),
            },
        }
    }
}

/// Whether a pattern reads back unchanged from its shell literal: it has
/// no unescaped `/` and does not end in an unpaired `\`.
pub(crate) fn shell_pattern_round_trips(pattern: &str) -> bool {
    let mut previous_backslash = false;
    for c in pattern.chars() {
        if c == '/' && !previous_backslash {
            return false;
        }
        previous_backslash = c == '\\' && !previous_backslash;
    }
    !previous_backslash
}

fn escape_regex_pattern(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    let mut previous_backslash = false;
    for c in pattern.chars() {
        if c == '/' && !previous_backslash {
            escaped.push('\\');
        }
        previous_backslash = c == '\\' && !previous_backslash;
        escaped.push(c);
    }
    escaped
}
