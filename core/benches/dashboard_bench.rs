// Dashboard hot-path benchmarks.
//
// Covers the layout engine at common terminal sizes, log ring-buffer churn,
// and a full frame render of the idle dashboard.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use valkit_core::dashboard::layout::compute;
use valkit_core::dashboard::{default_rows, App, ComponentId, DashboardOptions, Msg};
use valkit_core::ringbuf::{RingBuffer, SharedRingBuffer};

fn bench_layout(c: &mut Criterion) {
    let rows = default_rows();
    let min_width = |_: ComponentId| Some(20u16);
    let mut group = c.benchmark_group("layout/compute");

    for (width, height) in [(80u16, 24u16), (140, 45), (240, 70), (30, 20)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{width}x{height}")),
            &(width, height),
            |b, &(w, h)| b.iter(|| compute(&rows, w, h, &min_width)),
        );
    }
    group.finish();
}

fn bench_ring_buffer(c: &mut Criterion) {
    let lines: Vec<String> = (0..2_000)
        .map(|i| format!("I[2026-10-16|12:00:00.000] committed state module=state height={i} num_txs=3"))
        .collect();

    let mut group = c.benchmark_group("ringbuf");
    group.throughput(Throughput::Elements(lines.len() as u64));
    group.bench_function("push_2000_into_500", |b| {
        b.iter(|| {
            let mut buf = RingBuffer::new(500);
            for line in &lines {
                buf.push(line.as_str());
            }
            buf
        });
    });

    let shared = SharedRingBuffer::new(500);
    shared.extend(lines.iter().cloned());
    group.bench_function("shared_get_all_500", |b| {
        b.iter(|| shared.get_all());
    });
    group.finish();
}

fn bench_idle_frame(c: &mut Criterion) {
    let mut app = App::new(DashboardOptions::default(), SharedRingBuffer::new(500));
    app.update(Msg::WindowSize {
        width: 140,
        height: 45,
    });

    c.bench_function("dashboard/idle_frame_140x45", |b| {
        b.iter(|| app.view().to_text());
    });
}

criterion_group!(benches, bench_layout, bench_ring_buffer, bench_idle_frame);
criterion_main!(benches);
