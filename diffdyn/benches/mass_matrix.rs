use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use diffdyn::{test_utils::*, *};

fn mass_matrix_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("Mass Matrix");

    for links in [4, 8, 16, 32, 64] {
        let mut skel = make_chain("chain", links);
        randomize_state(&mut skel, links as u64);
        let q = skel.positions();

        // Every iteration invalidates the cache so the recursive algorithms run.
        group.bench_function(BenchmarkId::new("M", links), |b| {
            b.iter_batched(
                || {
                    let mut skel = skel.clone();
                    skel.set_positions(&(&q * 0.5)).unwrap();
                    skel
                },
                |skel| {
                    let m = skel.mass_matrix().clone();
                    black_box(m)
                },
                BatchSize::SmallInput,
            )
        });

        group.bench_function(BenchmarkId::new("Minv", links), |b| {
            b.iter_batched(
                || {
                    let mut skel = skel.clone();
                    skel.set_positions(&(&q * 0.5)).unwrap();
                    skel
                },
                |skel| {
                    let m = skel.inv_mass_matrix().clone();
                    black_box(m)
                },
                BatchSize::SmallInput,
            )
        });

        group.bench_function(BenchmarkId::new("Cached M", links), |b| {
            let _ = skel.mass_matrix();
            b.iter(|| black_box(skel.mass_matrix()[(0, 0)]))
        });
    }

    group.finish();
}

fn step_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("World Step");

    for links in [4, 16, 64] {
        group.bench_function(BenchmarkId::new("Chain", links), |b| {
            let mut world = World::new();
            world.add_skeleton(make_chain("chain", links)).unwrap();
            b.iter(|| world.step(false).is_ok())
        });
    }

    group.finish();
}

criterion_group!(benches, mass_matrix_bench, step_bench);
criterion_main!(benches);
