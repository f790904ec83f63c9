use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use maat_core::{Maatine, Runtime, RuntimeOptions, Value};

fn maatine() -> Maatine {
    let rt = Runtime::new(RuntimeOptions {
        seed: Some(1),
        ..RuntimeOptions::default()
    })
    .unwrap();
    Maatine::new(rt).unwrap()
}

fn bench_alloc_garbage(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_garbage");

    for count in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("ranges", count), &count, |b, &count| {
            let mut ma = maatine();
            b.iter(|| {
                for i in 0..count {
                    black_box(ma.new_range(i as f64, 0.0).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_minor_with_survivors(c: &mut Criterion) {
    c.bench_function("minor_half_survive", |b| {
        let mut ma = maatine();
        b.iter(|| {
            let keep = ma.new_array(false).unwrap();
            let mark = ma.protect(keep);
            for i in 0..2_000 {
                let r = ma.new_range(i as f64, 1.0).unwrap();
                if i % 2 == 0 {
                    ma.array_push(keep, r).unwrap();
                }
            }
            ma.collect_minor();
            ma.release(mark);
        });
    });
}

fn bench_interned_strings(c: &mut Criterion) {
    let names: Vec<String> = (0..64).map(|i| format!("field-{}", i)).collect();

    c.bench_function("intern_repeated", |b| {
        let mut ma = maatine();
        b.iter(|| {
            for name in &names {
                let v: Value = ma.new_str(black_box(name)).unwrap();
                black_box(v);
            }
        });
    });
}

criterion_group!(
    benches,
    bench_alloc_garbage,
    bench_minor_with_survivors,
    bench_interned_strings
);
criterion_main!(benches);
