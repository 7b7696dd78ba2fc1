//! Layout computation and buffer access benchmarks
//!
//! Measures the per-call cost of struct layout derivation and typed field
//! access, the two hot paths under reconciler-driven property updates.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use callbridge::{FloatWidth, IntWidth, NativeBuffer, StructLayout, TypeDesc, Value};

fn mixed_fields() -> Vec<TypeDesc> {
    vec![
        TypeDesc::Integer {
            width: IntWidth::W8,
            signed: false,
        },
        TypeDesc::Integer {
            width: IntWidth::W32,
            signed: true,
        },
        TypeDesc::Float {
            width: FloatWidth::W64,
        },
        TypeDesc::Boolean,
        TypeDesc::Integer {
            width: IntWidth::W64,
            signed: false,
        },
    ]
}

fn bench_layout_compute(c: &mut Criterion) {
    let fields = mixed_fields();
    c.bench_function("layout_compute_mixed", |b| {
        b.iter(|| StructLayout::compute(black_box(&fields)).unwrap())
    });
}

fn bench_buffer_access(c: &mut Criterion) {
    let fields = mixed_fields();
    let layout = StructLayout::compute(&fields).unwrap();
    let buf = NativeBuffer::alloc(layout.size(), "Bench", None).unwrap();

    c.bench_function("buffer_write_read_f64", |b| {
        let desc = TypeDesc::Float {
            width: FloatWidth::W64,
        };
        let offset = layout.offsets()[2];
        b.iter(|| {
            buf.write(&desc, offset, black_box(&Value::Float(1.25))).unwrap();
            black_box(buf.read(&desc, offset).unwrap())
        })
    });

    c.bench_function("buffer_write_read_u8", |b| {
        let desc = TypeDesc::Integer {
            width: IntWidth::W8,
            signed: false,
        };
        b.iter(|| {
            buf.write(&desc, 0, black_box(&Value::Int(200))).unwrap();
            black_box(buf.read(&desc, 0).unwrap())
        })
    });
}

criterion_group!(benches, bench_layout_compute, bench_buffer_access);
criterion_main!(benches);
