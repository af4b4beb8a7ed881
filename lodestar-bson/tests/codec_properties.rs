//! Property tests for the binary and extended JSON codecs.

use lodestar_bson::binary::{DuplicateElementPolicy, ReaderSettings, WriterSettings, decode_document_with, encode_document_with};
use lodestar_bson::json::{JsonWriterSettings, document_to_json};
use lodestar_bson::{
    Binary, BinarySubtype, Bson, BsonError, DateTime, Decimal128, Document, JavaScriptCodeWithScope, ObjectId, Regex,
    Timestamp, doc,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn key() -> impl Strategy<Value = String> {
    "[a-zA-Z_][a-zA-Z0-9_]{0,8}"
}

fn leaf() -> impl Strategy<Value = Bson> {
    prop_oneof![
        Just(Bson::Null),
        any::<bool>().prop_map(Bson::Boolean),
        any::<i32>().prop_map(Bson::Int32),
        any::<i64>().prop_map(Bson::Int64),
        any::<f64>().prop_map(Bson::Double),
        ".{0,12}".prop_map(Bson::String),
        any::<i64>().prop_map(|ms| Bson::DateTime(DateTime::from_millis(ms))),
        (any::<u32>(), any::<u32>()).prop_map(|(time, increment)| Bson::Timestamp(Timestamp { time, increment })),
        ("[a-z.*+]{0,6}", "[imsx]{0,3}").prop_map(|(p, o)| Bson::RegularExpression(Regex::new(p, o))),
        typed_leaf(),
    ]
}

/// Values with a dedicated wrapper in canonical extended JSON.
fn typed_leaf() -> impl Strategy<Value = Bson> {
    prop_oneof![
        decimal().prop_map(Bson::Decimal128),
        any::<[u8; 12]>().prop_map(|bytes| Bson::ObjectId(ObjectId::from_bytes(bytes))),
        (any::<u8>(), prop::collection::vec(any::<u8>(), 0..20))
            .prop_map(|(subtype, bytes)| Bson::Binary(Binary::new(BinarySubtype::from(subtype), bytes))),
        "[a-z]{0,8}".prop_map(Bson::Symbol),
        "[a-z(){};]{0,12}".prop_map(Bson::JavaScriptCode),
        ("[a-z(){};]{0,12}", prop::collection::vec((key(), any::<i32>()), 0..3)).prop_map(|(code, scope)| {
            let scope = document_from(scope.into_iter().map(|(k, v)| (k, Bson::Int32(v))).collect());
            Bson::JavaScriptCodeWithScope(JavaScriptCodeWithScope { code, scope })
        }),
        prop_oneof![
            Just(Bson::MinKey),
            Just(Bson::MaxKey),
            Just(Bson::Undefined),
            Just(Bson::Double(f64::INFINITY)),
            Just(Bson::Double(f64::NEG_INFINITY)),
            Just(Bson::Double(f64::NAN)),
        ],
    ]
}

fn decimal() -> impl Strategy<Value = Decimal128> {
    prop_oneof![
        (any::<i64>(), -40i32..40)
            .prop_filter_map("exact decimal", |(coefficient, exponent)| {
                Decimal128::parse(&format!("{coefficient}E{exponent}")).ok()
            }),
        prop::sample::select(vec!["NaN", "Infinity", "-Infinity", "-0", "1.10", "0E-6176"])
            .prop_filter_map("special decimal", |text| Decimal128::parse(text).ok()),
    ]
}

fn document_from(entries: Vec<(String, Bson)>) -> Document {
    let mut document = Document::new();
    for (k, v) in entries {
        document.insert(k, v);
    }
    document
}

fn value() -> impl Strategy<Value = Bson> {
    leaf().prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Bson::Array),
            prop::collection::vec((key(), inner), 0..6).prop_map(|entries| Bson::Document(document_from(entries))),
        ]
    })
}

fn document() -> impl Strategy<Value = Document> {
    prop::collection::vec((key(), value()), 0..8).prop_map(document_from)
}

proptest! {
    #[test]
    fn test_binary_round_trip(document in document()) {
        let bytes = encode_document_with(&document, &WriterSettings::default()).unwrap();
        let length = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        prop_assert_eq!(length as usize, bytes.len());
        let decoded = decode_document_with(&bytes, &ReaderSettings::default()).unwrap();
        prop_assert_eq!(decoded, document);
    }

    #[test]
    fn test_canonical_json_round_trip(document in document()) {
        let text = document_to_json(&document, &JsonWriterSettings::canonical());
        let parsed = Document::from_json(&text).unwrap();
        prop_assert_eq!(document_to_json(&parsed, &JsonWriterSettings::canonical()), text);
        prop_assert_eq!(parsed, document);
    }

    #[test]
    fn test_truncated_input_is_rejected(document in document(), cut in 1usize..8) {
        let bytes = encode_document_with(&document, &WriterSettings::default()).unwrap();
        let cut = cut.min(bytes.len());
        prop_assert!(decode_document_with(&bytes[..bytes.len() - cut], &ReaderSettings::default()).is_err());
    }
}

/// `{ a: 1, a: 2 }` written by hand; the writer never produces duplicates.
fn duplicate_bytes() -> Vec<u8> {
    let mut body = Vec::new();
    for value in [1i32, 2] {
        body.push(0x10);
        body.extend_from_slice(b"a\0");
        body.extend_from_slice(&value.to_le_bytes());
    }
    body.push(0);
    let mut bytes = ((body.len() + 4) as i32).to_le_bytes().to_vec();
    bytes.extend(body);
    bytes
}

#[test]
fn test_duplicate_names_last_wins_by_default() {
    let decoded = decode_document_with(&duplicate_bytes(), &ReaderSettings::default()).unwrap();
    assert_eq!(decoded, doc! { "a" => 2 });
}

#[test]
fn test_duplicate_names_rejected_on_request() {
    let settings = ReaderSettings::builder()
        .duplicate_element_policy(DuplicateElementPolicy::Reject)
        .build();
    let err = decode_document_with(&duplicate_bytes(), &settings).unwrap_err();
    assert!(err.is_format_error());
}

#[test]
fn test_oversized_document_rejected() {
    let document = doc! { "payload" => "x".repeat(64) };
    let settings = WriterSettings {
        max_document_size: 32,
        ..WriterSettings::default()
    };
    let err = encode_document_with(&document, &settings).unwrap_err();
    assert!(matches!(err, BsonError::DocumentTooLarge { .. }));
}
