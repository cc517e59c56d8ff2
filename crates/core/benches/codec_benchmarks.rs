//! Codec throughput for the cache hot path (flatten + unflatten of one record).

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;

use tether_core::FieldType;
use tether_core::codec::{decode, encode};

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_encode");

    let cases = [
        ("string", FieldType::String, json!("Ada Lovelace")),
        ("number", FieldType::Number, json!(1234567)),
        ("date", FieldType::Date, json!(1_700_000_000_123i64)),
        ("array", FieldType::Array, json!(["g1", "g2", "g3", "g4"])),
        (
            "object",
            FieldType::Object,
            json!({"street": "Main", "no": 7, "tags": ["a", "b"]}),
        ),
    ];

    for (name, field_type, value) in cases {
        group.bench_with_input(BenchmarkId::from_parameter(name), &value, |b, v| {
            b.iter(|| encode(black_box(field_type), black_box(v)))
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_decode");

    let cases = [
        ("number", FieldType::Number, "1234567"),
        ("date", FieldType::Date, "2023-11-14T22:13:20.123Z"),
        ("array", FieldType::Array, r#"["g1","g2","g3","g4"]"#),
        (
            "object",
            FieldType::Object,
            r#"{"street":"Main","no":7,"tags":["a","b"]}"#,
        ),
    ];

    for (name, field_type, raw) in cases {
        group.bench_with_input(BenchmarkId::from_parameter(name), &raw, |b, r| {
            b.iter(|| decode(black_box(field_type), black_box(r)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
