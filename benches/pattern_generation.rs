use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use shredspace::pattern::{generate, PatternKind};

fn pattern_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("pattern_generation");
    for size in [4 * 1024, 64 * 1024, 1024 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        for kind in [PatternKind::ZERO, PatternKind::ONES, PatternKind::Random] {
            group.bench_with_input(BenchmarkId::new(kind.to_string(), size), &size, |b, &size| {
                b.iter(|| generate(black_box(kind), 0, size))
            });
        }
    }
    group.finish();
}

criterion_group!(benches, pattern_generation);
criterion_main!(benches);
