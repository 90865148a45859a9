//! Codec Benchmarks
//!
//! ## Value Shapes
//!
//! - `scalar`: a single small integer
//! - `package`: a project config mapping with nested sets and sequences,
//!   the typical shape stored per key
//! - `deep`: 500 levels of nested sequences (exercises the iterative
//!   decoder's stack)
//!
//! ## Running
//!
//! ```bash
//! cargo bench --bench codec
//! cargo bench --bench codec -- "decode"  # specific group
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use depot::{decode, encode, Mapping, Sequence, Set, Value};

fn package() -> Value {
    let mut versions = Mapping::new();
    for minor in 0..50 {
        let mut release = Mapping::new();
        release.insert("requires_python", ">=3.8").unwrap();
        release
            .insert("sha256", Value::Bytes(vec![minor as u8; 32]))
            .unwrap();
        release.insert("size", 1_048_576 + minor).unwrap();
        versions.insert(format!("1.{minor}.0"), release).unwrap();
    }
    let tags: Set = ["web", "http", "async"].into_iter().map(Value::from).collect();
    let mut project = Mapping::new();
    project.insert("name", "pkg1").unwrap();
    project.insert("tags", tags).unwrap();
    project.insert("versions", versions).unwrap();
    Value::Map(project)
}

fn deep(levels: usize) -> Value {
    let mut value = Value::Null;
    for _ in 0..levels {
        value = Value::Seq(Sequence::from_vec(vec![value]));
    }
    value
}

fn shapes() -> Vec<(&'static str, Value)> {
    vec![
        ("scalar", Value::Int(42)),
        ("package", package()),
        ("deep", deep(500)),
    ]
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for (name, value) in shapes() {
        let len = encode(&value).unwrap().len();
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &value, |b, v| {
            b.iter(|| encode(black_box(v)).unwrap())
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for (name, value) in shapes() {
        let bytes = encode(&value).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &bytes, |b, bytes| {
            b.iter(|| decode(black_box(bytes)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
