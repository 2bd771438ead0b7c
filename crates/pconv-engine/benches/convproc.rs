//! Convolution engine benchmarks
//!
//! Cost of one `process()` call for typical reverb setups, with the
//! background levels kept in lockstep so every iteration does full work.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use pconv_engine::{ConvConfig, Convproc, PartitionSchedule, Sample, SchedPolicy, WaitPolicy};

const SAMPLE_RATE: f64 = 48000.0;

fn generate_response(len: usize) -> Vec<Sample> {
    (0..len)
        .map(|i| {
            let t = i as f64 / SAMPLE_RATE;
            (2.0 * std::f64::consts::PI * 1234.5 * t).sin() * (-6.9 * t).exp()
        })
        .collect()
}

fn started_engine(ninp: usize, nout: usize, maxsize: usize, quantum: usize) -> Convproc {
    let config = ConvConfig {
        ninp,
        nout,
        maxsize,
        quantum,
        minpart: quantum.max(64),
        maxpart: 8192,
        wait: WaitPolicy::Block,
        ..ConvConfig::default()
    };
    let mut proc = Convproc::from_config(&config).unwrap();
    let ir = generate_response(maxsize);
    for out in 0..nout {
        proc.impdata_create(out % ninp, out, 1, &ir, 0, ir.len()).unwrap();
    }
    proc.start_process(0, SchedPolicy::Other).unwrap();
    proc
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROCESS BENCHMARKS
// ═══════════════════════════════════════════════════════════════════════════════

fn bench_process_mono(c: &mut Criterion) {
    let mut group = c.benchmark_group("Convproc mono 2s");

    for &quantum in &[64usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::new("quantum", quantum), &quantum, |b, &q| {
            let mut proc = started_engine(1, 1, 96000, q);
            b.iter(|| {
                proc.inpdata(0).fill(black_box(0.25));
                black_box(proc.process());
                black_box(proc.outdata(0)[0])
            });
        });
    }

    group.finish();
}

fn bench_process_stereo(c: &mut Criterion) {
    let mut group = c.benchmark_group("Convproc true stereo 2s");

    group.bench_function("quantum 256", |b| {
        let mut proc = started_engine(2, 2, 96000, 256);
        b.iter(|| {
            proc.inpdata(0).fill(black_box(0.25));
            proc.inpdata(1).fill(black_box(-0.25));
            black_box(proc.process());
            black_box(proc.outdata(1)[0])
        });
    });

    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════════
// SETUP BENCHMARKS
// ═══════════════════════════════════════════════════════════════════════════════

fn bench_schedule(c: &mut Criterion) {
    let config = ConvConfig {
        ninp: 8,
        nout: 8,
        maxsize: 480000,
        ..ConvConfig::default()
    };
    c.bench_function("PartitionSchedule::plan 8x8 10s", |b| {
        b.iter(|| PartitionSchedule::plan(black_box(&config)).unwrap())
    });
}

fn bench_impdata_load(c: &mut Criterion) {
    let ir = generate_response(96000);
    c.bench_function("impdata_create 2s", |b| {
        b.iter(|| {
            let mut proc = Convproc::new();
            proc.configure(1, 1, 96000, 256, 256, 8192, 1.0).unwrap();
            proc.impdata_create(0, 0, 1, black_box(&ir), 0, ir.len()).unwrap();
            proc
        })
    });
}

criterion_group!(
    benches,
    bench_process_mono,
    bench_process_stereo,
    bench_schedule,
    bench_impdata_load
);
criterion_main!(benches);
