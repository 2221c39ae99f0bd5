//! Throughput of the adaptive resampler hot loop (one output batch).

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dsp::converter::BATCH;
use dsp::AdaptiveFfir;

fn adaptive_batch(c: &mut Criterion) {
    let mut ffir = AdaptiveFfir::adaptive().expect("table construction");
    let input: Vec<i32> = (0..2 * BATCH).map(|i| (i as i32) * 1_000_000).collect();
    let mut out = [0i32; BATCH];

    c.bench_function("adaptive_ffir_batch", |b| {
        b.iter(|| {
            let (produced, consumed) = ffir.process(black_box(&input), black_box(&mut out));
            black_box((produced, consumed))
        });
    });
}

criterion_group!(benches, adaptive_batch);
criterion_main!(benches);
