use mdbox::{load_tree, save_tree, BoxResult, LeanRecord, LoadOptions};
use mdbox_int_test::test_util::{create_test_context, seeded_rng, uniform_lean_records, unit_tree};

fn main() -> BoxResult<()> {
    println!("Starting stress test...");
    let ctx = create_test_context()?;
    let path = ctx.file("stress.mdbox");

    let count = 1_000_000;
    let batches = 20;
    let mut rng = seeded_rng(42);
    let mut tree = unit_tree::<LeanRecord>(3, 2, 2000)?;

    let start = std::time::Instant::now();
    for _ in 0..batches {
        let chunks = (0..8)
            .map(|_| uniform_lean_records(&mut rng, count / batches / 8, 3, 0.0, 1.0))
            .collect();
        tree.add_records_parallel(chunks, 8)?;
        if tree.controller().should_split(tree.num_leaves()) {
            tree.split_all_if_needed()?;
        }
    }
    tree.split_all_if_needed()?;
    println!(
        "Inserted {} records into {} boxes in {:?}",
        tree.total_records(),
        tree.num_boxes(),
        start.elapsed()
    );

    let start = std::time::Instant::now();
    let report = save_tree(&mut tree, &path, true)?;
    println!("Saved {} records in {:?}", report.total_records, start.elapsed());

    let start = std::time::Instant::now();
    for _ in 0..batches {
        tree.add_records(uniform_lean_records(&mut rng, 1000, 3, 0.4, 0.6))?;
    }
    tree.split_all_if_needed()?;
    let report = save_tree(&mut tree, &path, true)?;
    println!(
        "Incremental save of {} records ({} free blocks) in {:?}",
        report.total_records,
        report.free_blocks,
        start.elapsed()
    );
    drop(tree);

    let start = std::time::Instant::now();
    let loaded = load_tree::<LeanRecord>(&path, LoadOptions::default())?;
    println!(
        "Loaded {} records in {:?}",
        loaded.total_records,
        start.elapsed()
    );

    let start = std::time::Instant::now();
    let backed = load_tree::<LeanRecord>(&path, LoadOptions::default().file_backed(true))?;
    println!(
        "Opened {} boxes file-backed in {:?}",
        backed.tree.num_boxes(),
        start.elapsed()
    );
    Ok(())
}
