//! Benchmarks for request correlation and envelope framing

use anchor_infer::inference::envelope::{decode, encode};
use anchor_infer::inference::{RequestCorrelator, WorkerEnvelope};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;

fn bench_register_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("correlator_register_resolve");

    for backlog in [0usize, 100, 10_000].iter() {
        let correlator = RequestCorrelator::new();
        // Keep `backlog` unrelated requests pending during the measurement.
        let parked: Vec<_> = (0..*backlog)
            .map(|_| correlator.register_generate(Duration::from_secs(3600), None))
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(backlog), backlog, |b, _| {
            b.iter(|| {
                let pending = correlator.register_generate(Duration::from_secs(60), None);
                let envelope =
                    WorkerEnvelope::generate_complete(pending.id(), Ok("done".to_string()));
                black_box(correlator.resolve(envelope))
            });
        });
        drop(parked);
    }
    group.finish();
}

fn bench_fragment_delivery(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragment_delivery");

    let correlator = RequestCorrelator::new();
    let pending = correlator.register_generate(
        Duration::from_secs(3600),
        Some(Arc::new(|fragment: &str, _: &str| {
            black_box(fragment.len());
        })),
    );
    let id = pending.id();

    group.bench_function("registered", |b| {
        b.iter(|| correlator.deliver_fragment(black_box(id), "token ", "accumulated token "))
    });

    let unknown = anchor_infer::inference::RequestId(u64::MAX);
    group.bench_function("unknown_request", |b| {
        b.iter(|| correlator.deliver_fragment(black_box(unknown), "token ", "accumulated token "))
    });
    group.finish();
}

fn bench_envelope_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_framing");

    for size in [16usize, 1024, 16 * 1024].iter() {
        let accumulated = "x".repeat(*size);
        let envelope = WorkerEnvelope::Fragment {
            request_id: anchor_infer::inference::RequestId(7),
            fragment_text: "x".to_string(),
            accumulated_text: accumulated,
        };
        let frame = encode(&envelope).expect("bench: encode");

        group.bench_with_input(BenchmarkId::new("encode", size), &envelope, |b, envelope| {
            b.iter(|| encode(black_box(envelope)))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &frame, |b, frame| {
            b.iter(|| decode::<WorkerEnvelope>(black_box(frame)))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_register_resolve,
    bench_fragment_delivery,
    bench_envelope_framing
);
criterion_main!(benches);
