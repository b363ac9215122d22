//! Benchmarks for frame encoding and decoding

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use galileo_transfer_protocol::{FrameDecoder, Request};

fn bench_write_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_frame");

    for size in [64usize, 512, 4096].iter() {
        let data: Vec<u8> = (0..*size).map(|i| (i % 256) as u8).collect();

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &data, |b, data| {
            b.iter(|| {
                Request::Write {
                    block: 7,
                    offset: 7 * 4096,
                    data,
                }
                .encode(42)
            });
        });

        let encoded = Request::Write {
            block: 7,
            offset: 7 * 4096,
            data: &data,
        }
        .encode(42)
        .unwrap_or_default();
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, bytes| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new();
                decoder.push(bytes);
                decoder.next_frame()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_write_frames);
criterion_main!(benches);
