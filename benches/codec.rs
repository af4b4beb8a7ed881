//! Benchmarks for the binary and extended JSON codecs.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use lodestar::bson::binary::{ReaderSettings, WriterSettings, decode_document_with, encode_document_with};
use lodestar::bson::json::{JsonWriterSettings, document_to_json};
use lodestar::bson::{Bson, DateTime, Document, ObjectId, doc};
use std::hint::black_box;

fn sample(fields: usize) -> Document {
    let mut document = doc! { "_id" => ObjectId::new(), "created" => DateTime::from_millis(1_700_000_000_000) };
    for i in 0..fields {
        let value = match i % 4 {
            0 => Bson::Int32(i as i32),
            1 => Bson::Double(i as f64 * 1.5),
            2 => Bson::String(format!("value-{i}")),
            _ => Bson::Document(doc! { "n" => i as i64, "flag" => i % 2 == 0 }),
        };
        document.insert(format!("field{i}"), value);
    }
    document
}

/// Benchmark binary encoding and decoding.
fn bench_binary(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary");
    for fields in [10, 100, 1000] {
        let document = sample(fields);
        let bytes = encode_document_with(&document, &WriterSettings::default()).unwrap_or_default();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", fields), &document, |b, document| {
            b.iter(|| black_box(encode_document_with(document, &WriterSettings::default())))
        });
        group.bench_with_input(BenchmarkId::new("decode", fields), &bytes, |b, bytes| {
            b.iter(|| black_box(decode_document_with(bytes, &ReaderSettings::default())))
        });
    }
    group.finish();
}

/// Benchmark extended JSON output and parsing.
fn bench_json(c: &mut Criterion) {
    let mut group = c.benchmark_group("json");
    let document = sample(100);
    let canonical = JsonWriterSettings::canonical();
    let text = document_to_json(&document, &canonical);

    group.bench_function("write_canonical_100", |b| {
        b.iter(|| black_box(document_to_json(&document, &canonical)))
    });
    group.bench_function("write_relaxed_100", |b| {
        b.iter(|| black_box(document_to_json(&document, &JsonWriterSettings::relaxed())))
    });
    group.bench_function("parse_canonical_100", |b| b.iter(|| black_box(Document::from_json(&text))));
    group.finish();
}

criterion_group!(benches, bench_binary, bench_json);
criterion_main!(benches);
