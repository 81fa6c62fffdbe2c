//! Benchmarks for the tick path
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use qdaq::filter::LookupTable;
use qdaq::{Channel, ComputationRegistry, Filter, Job, Loop, SourceType};
use std::sync::Arc;

fn plant_loop() -> (Arc<Loop>, Arc<Loop>) {
    let registry = ComputationRegistry::new();
    let root = Loop::root("qdaq").unwrap();
    let l = Loop::with_period_ms("loop", 1).unwrap();
    root.append_child(&l).unwrap();

    let u = Channel::new("u").unwrap();
    let y = Channel::new("y").unwrap();
    let y1 = Channel::new("y1").unwrap();

    let sys = Filter::with_module("sys", "sys", &registry).unwrap();
    sys.configure("tau", 0.5).unwrap();
    sys.set_inputs(vec![u.clone()]).unwrap();
    sys.set_outputs(vec![y.clone()]).unwrap();

    let pid = Filter::with_module("pid", "pid", &registry).unwrap();
    pid.configure("kp", 2.0).unwrap();
    pid.configure("ki", 1.0).unwrap();
    pid.configure("setpoint", 1.0).unwrap();
    pid.set_inputs(vec![y.clone()]).unwrap();
    pid.set_outputs(vec![u.clone()]).unwrap();

    let ip = Filter::with_module("ip", "table", &registry).unwrap();
    ip.configure("points", "0:0, 1:10, 2:15").unwrap();
    ip.set_inputs(vec![y.clone()]).unwrap();
    ip.set_outputs(vec![y1.clone()]).unwrap();

    for node in [u, y, y1] {
        l.append_child(node).unwrap();
    }
    l.append_child(sys).unwrap();
    l.append_child(pid).unwrap();
    l.append_child(ip).unwrap();
    l.create_loop_engine().unwrap();
    (root, l)
}

fn bench_control_loop_tick(c: &mut Criterion) {
    let (_root, l) = plant_loop();
    c.bench_function("control_loop_tick", |b| {
        b.iter(|| black_box(l.step().unwrap()));
    });
}

fn bench_source_channels(c: &mut Criterion) {
    let mut group = c.benchmark_group("source_channels");

    for size in [10, 100, 1000].iter() {
        let root = Loop::root("qdaq").unwrap();
        let l = Loop::with_period_ms("loop", 1).unwrap();
        root.append_child(&l).unwrap();
        for i in 0..*size {
            let source = if i % 2 == 0 {
                SourceType::Clock
            } else {
                SourceType::uniform()
            };
            l.append_child(Channel::with_source(format!("ch{}", i), source).unwrap())
                .unwrap();
        }
        l.create_loop_engine().unwrap();

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(l.step().unwrap()));
        });
    }

    group.finish();
}

fn bench_job_tick(c: &mut Criterion) {
    let root = Loop::root("qdaq").unwrap();
    let l = Loop::with_period_ms("loop", 1).unwrap();
    root.append_child(&l).unwrap();
    l.append_child(Channel::with_source("x", SourceType::uniform()).unwrap())
        .unwrap();
    l.append_child(Channel::new("y").unwrap()).unwrap();
    l.append_child(
        Job::with_script(
            "job",
            r#"set("qdaq.loop.y", sqrt(get("qdaq.loop.x")) * 2.0 + dt());"#,
        )
        .unwrap(),
    )
    .unwrap();
    l.create_loop_engine().unwrap();

    c.bench_function("job_tick", |b| {
        b.iter(|| black_box(l.step().unwrap()));
    });
}

fn bench_table_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_lookup");

    for rows in [16, 256, 4096].iter() {
        let points: Vec<(f64, f64)> = (0..*rows).map(|i| (i as f64, (i * i) as f64)).collect();
        let table = LookupTable::new(points, "bench").unwrap();
        let span = (*rows - 1) as f64;

        group.bench_with_input(BenchmarkId::from_parameter(rows), rows, |b, _| {
            let mut x = 0.0;
            b.iter(|| {
                x = (x + 0.37) % span;
                black_box(table.lookup(black_box(x)))
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_control_loop_tick,
    bench_source_channels,
    bench_job_tick,
    bench_table_lookup
);
criterion_main!(benches);
