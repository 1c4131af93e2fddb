use criterion::{black_box, criterion_group, criterion_main, Criterion};
use step_capture::prelude::*;

fn criterion_benchmark(c: &mut Criterion) {
    // Color image of 1024x768 pixels, 12288 blocks per channel
    let geometry = Geometry::new(1024, 768, 3, ChannelOrder::RowInterleaved).unwrap();
    let counts = (0..geometry.total_blocks() as u32).map(|block| block % 97);
    let trace = EventTrace::from_block_counts(counts);
    let text = trace.to_string();

    let mut group = c.benchmark_group("capture_performance");
    group.warm_up_time(std::time::Duration::from_secs(1));
    group.measurement_time(std::time::Duration::from_secs(10));
    group.sample_size(20);
    group.bench_function("aggregate trace", |b| {
        b.iter(|| {
            let mut tracker = BlockTracker::new(geometry);
            trace.replay(&mut tracker);
            black_box(tracker.finish().unwrap());
        })
    });
    group.bench_function("replay capture", |b| {
        let mut capture = Capture::new(TraceReplay::new(geometry), Passive, geometry);
        b.iter(|| {
            black_box(
                capture
                    .run(text.as_bytes(), geometry.output_size())
                    .unwrap(),
            );
        })
    });
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
