use mdbox::{
    load_tree, merge_files, merge_trees, save_tree, BoxController, BoxExtents, BoxTree,
    BoxTreeError, FullRecord, LeanRecord, LoadOptions, MergeOptions, Record, RunInfo,
};
use mdbox_int_test::test_util::{
    cleanup, create_test_context, run_test, seeded_rng, uniform_full_records, unit_tree,
};

#[ctor::ctor]
fn init() {
    colog::init();
}

fn full_tree(seed: u64, n: usize, runs: u16) -> mdbox::BoxResult<BoxTree<FullRecord>> {
    let mut tree = unit_tree::<FullRecord>(2, 2, 64)?;
    for r in 0..runs {
        tree.add_run(RunInfo::new(format!("seed{}_run{}", seed, r)).with_property("seed", seed.to_string()));
    }
    let mut rng = seeded_rng(seed);
    tree.add_records(uniform_full_records(&mut rng, n, 2, runs))?;
    tree.split_all_if_needed_with(2)?;
    Ok(tree)
}

#[test]
fn test_merge_trees_conserves_signal_and_runs() {
    run_test(
        create_test_context,
        |_ctx| {
            let sources = vec![full_tree(1, 700, 2)?, full_tree(2, 300, 1)?, full_tree(3, 1000, 4)?];
            let signal: f64 = sources.iter().map(|t| t.total_signal()).sum();

            let options = MergeOptions {
                threads: 3,
                ..MergeOptions::default()
            };
            let mut merged = merge_trees(sources, &options)?;
            assert_eq!(merged.total_records(), 2000);
            assert!((merged.total_signal() - signal).abs() < 1e-6);
            assert_eq!(merged.run_count(), 7);
            assert_eq!(merged.runs()[2].name, "seed2_run0");
            assert_eq!(merged.runs()[3].property("seed"), Some("3"));
            merged.check_structure()?;

            let mut per_run = [0u64; 7];
            for id in merged.leaf_ids() {
                for record in merged.leaf_records(id)? {
                    per_run[record.run_index().unwrap() as usize] += 1;
                }
            }
            assert_eq!(per_run.iter().sum::<u64>(), 2000);
            assert_eq!(per_run[0] + per_run[1], 700);
            assert_eq!(per_run[2], 300);
            assert!(per_run[3..].iter().all(|&c| c == 250));
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_merge_files_pages_destination() {
    run_test(
        create_test_context,
        |ctx| {
            let inputs: Vec<_> = (0..3u64)
                .map(|i| ctx.file(&format!("input_{}.mdbox", i)))
                .collect();
            let mut signal = 0.0;
            for (i, path) in inputs.iter().enumerate() {
                let mut tree = full_tree(10 + i as u64, 400 + 100 * i, 1)?;
                signal += tree.total_signal();
                save_tree(&mut tree, path, false)?;
            }

            let output = ctx.file("merged.mdbox");
            let options = MergeOptions {
                threads: 2,
                write_buffer_size: 2048,
            };
            let report = merge_files::<FullRecord, _>(&inputs, &output, &options)?;
            assert_eq!(report.total_records, 1500);

            let loaded = load_tree::<FullRecord>(&output, LoadOptions::default().nd(2))?;
            assert_eq!(loaded.total_records, 1500);
            assert_eq!(loaded.tree.run_count(), 3);
            assert!((loaded.tree.total_signal() - signal).abs() < 1e-6);
            loaded.tree.check_structure()?;

            for input in &inputs {
                let source = load_tree::<FullRecord>(input, LoadOptions::default())?;
                assert!(source.total_records >= 400);
            }
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_merge_rejects_mismatched_inputs() {
    run_test(
        create_test_context,
        |ctx| {
            let two_d = ctx.file("two_d.mdbox");
            let three_d = ctx.file("three_d.mdbox");
            save_tree(&mut full_tree(5, 100, 1)?, &two_d, false)?;

            let controller = BoxController::builder(3).build()?;
            let mut tree = BoxTree::<FullRecord>::new(controller, BoxExtents::uniform(3, 0.0, 1.0))?;
            tree.add_record(FullRecord::new(1.0, 1.0, 0, 0, &[0.5, 0.5, 0.5]))?;
            save_tree(&mut tree, &three_d, false)?;

            let options = MergeOptions::default();
            let result = merge_files::<FullRecord, _>(&[&two_d, &three_d], ctx.file("out.mdbox"), &options);
            assert!(matches!(result, Err(BoxTreeError::FormatMismatch(_))));

            let result = merge_files::<LeanRecord, _>(&[&two_d], ctx.file("lean.mdbox"), &options);
            assert!(matches!(result, Err(BoxTreeError::FormatMismatch(_))));

            let result = merge_files::<FullRecord, _>(&[&two_d], &two_d, &options);
            assert!(matches!(result, Err(BoxTreeError::InvalidOperation(_))));
            Ok(())
        },
        cleanup,
    )
}
