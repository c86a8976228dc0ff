//! Append-path benchmarks: raw buffer appends and encoded ingest.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use stratadb::{new_encoder, Buffer, Encoder, EncodingSpec, DEFAULT_PAGE_SIZE};

fn bench_raw_append(c: &mut Criterion) {
    const TOTAL: usize = 1 << 20;
    const CHUNK: usize = 4096;
    let chunk = vec![0xA5u8; CHUNK];

    let mut group = c.benchmark_group("buffer");
    group.throughput(Throughput::Bytes(TOTAL as u64));
    group.bench_function("append_1mib", |b| {
        b.iter(|| {
            let mut buf = Buffer::with_capacity(TOTAL, DEFAULT_PAGE_SIZE, 0);
            for _ in 0..(TOTAL / CHUNK) {
                buf.append(black_box(&chunk)).unwrap();
            }
            black_box(buf.used())
        })
    });
    group.finish();
}

fn bench_encoded_append(c: &mut Criterion) {
    const ELEMS: usize = 64 * 1024;
    let values: Vec<u8> = (0..ELEMS as i64)
        .flat_map(|v| (v % 10_000).to_ne_bytes())
        .collect();

    let mut group = c.benchmark_group("encoder");
    group.throughput(Throughput::Elements(ELEMS as u64));
    group.bench_function("narrow_i64_to_i16", |b| {
        b.iter(|| {
            let mut encoder = new_encoder(EncodingSpec::I64ToI16);
            let mut buf = Buffer::with_capacity(ELEMS * 2, DEFAULT_PAGE_SIZE, 0);
            let mut src: &[u8] = black_box(&values);
            let md = encoder.append_data(&mut buf, &mut src, ELEMS).unwrap();
            black_box(md)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_raw_append, bench_encoded_append);
criterion_main!(benches);
