//! Box tree benchmarks

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use mdbox::{load_tree, save_tree, BoxController, BoxExtents, BoxTree, LeanRecord, LoadOptions};
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use tempfile::tempdir;

fn records(n: usize) -> Vec<LeanRecord> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    (0..n)
        .map(|_| LeanRecord::new(1.0, 1.0, &[rng.gen::<f32>(), rng.gen::<f32>(), rng.gen::<f32>()]))
        .collect()
}

fn new_tree() -> BoxTree<LeanRecord> {
    let controller = BoxController::builder(3)
        .split_threshold(500)
        .build()
        .unwrap();
    BoxTree::new(controller, BoxExtents::uniform(3, 0.0, 1.0)).unwrap()
}

fn bench_add_and_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("BoxTree Add+Split");

    for size in [10_000, 100_000].iter() {
        let input = records(*size);
        for threads in [1, 4] {
            group.bench_with_input(
                BenchmarkId::new(format!("threads_{}", threads), size),
                &input,
                |b, input| {
                    b.iter_with_setup(
                        || (new_tree(), input.clone()),
                        |(mut tree, input)| {
                            tree.add_records(input).unwrap();
                            tree.split_all_if_needed_with(threads).unwrap();
                            black_box(tree.num_boxes())
                        },
                    );
                },
            );
        }
    }

    group.finish();
}

fn bench_save_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("BoxTree Save/Load");

    let dir = tempdir().unwrap();
    let path = dir.path().join("bench.mdbox");
    let mut tree = new_tree();
    tree.add_records(records(50_000)).unwrap();
    tree.split_all_if_needed_with(4).unwrap();

    group.bench_function("save_50k", |b| {
        b.iter(|| black_box(save_tree(&mut tree, &path, false).unwrap()));
    });

    group.bench_function("load_50k", |b| {
        b.iter(|| black_box(load_tree::<LeanRecord>(&path, LoadOptions::default()).unwrap().total_records));
    });

    group.bench_function("load_structure_only_50k", |b| {
        b.iter(|| {
            let options = LoadOptions::default().structure_only(true);
            black_box(load_tree::<LeanRecord>(&path, options).unwrap().tree.num_boxes())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_add_and_split, bench_save_load);
criterion_main!(benches);
