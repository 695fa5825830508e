//! Merging several box trees into one.
//!
//! The destination spans the union of the sources' extents and uses the
//! first source's split policy. Run indices are kept unique by shifting each
//! source's records by the number of runs of the sources before it; the run
//! tables are concatenated in the same order.

use std::path::Path;

use crate::errors::{BoxResult, BoxTreeError};
use crate::persistence::{self, LoadOptions, SaveReport};
use crate::record::Record;
use crate::tree::BoxTree;

/// Options for [`merge_trees`] and [`merge_files`]
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Workers used by split passes
    pub threads: usize,
    /// Write budget of the destination's page cache in [`merge_files`]
    pub write_buffer_size: u64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            write_buffer_size: crate::constants::DEFAULT_WRITE_BUFFER_BYTES,
        }
    }
}

fn check_sources<R: Record>(sources: &[BoxTree<R>]) -> BoxResult<()> {
    let Some(first) = sources.first() else {
        return Err(BoxTreeError::InvalidOperation(
            "nothing to merge: no source trees".into(),
        ));
    };
    if let Some((i, other)) = sources
        .iter()
        .enumerate()
        .find(|(_, s)| s.nd() != first.nd())
    {
        return Err(BoxTreeError::FormatMismatch(format!(
            "source {} has {} dimensions, source 0 has {}",
            i,
            other.nd(),
            first.nd()
        )));
    }
    let mut offset: u16 = 0;
    for (i, source) in sources.iter().enumerate().skip(1) {
        offset = run_offset_after(offset, &sources[i - 1])
            .ok_or_else(|| too_many_runs(i, source))?;
    }
    Ok(())
}

/// Run offset of the source following `source`
fn run_offset_after<R: Record>(offset: u16, source: &BoxTree<R>) -> Option<u16> {
    u16::try_from(source.runs().len())
        .ok()
        .and_then(|runs| offset.checked_add(runs))
}

fn too_many_runs<R: Record>(i: usize, source: &BoxTree<R>) -> BoxTreeError {
    BoxTreeError::InvalidOperation(format!(
        "run indices of source {} ({} runs) would not fit 16 bits after the runs before it",
        i,
        source.runs().len()
    ))
}

fn new_destination<R: Record>(sources: &[BoxTree<R>]) -> BoxResult<BoxTree<R>> {
    let mut extents = sources[0].extents().clone();
    for source in &sources[1..] {
        extents = extents.union(source.extents())?;
    }
    BoxTree::new(sources[0].controller().clone_policy(), extents)
}

/// Moves every record of `sources` into `dest`, releasing source leaves as
/// they are copied
fn merge_into<R: Record>(
    dest: &mut BoxTree<R>,
    sources: Vec<BoxTree<R>>,
    threads: usize,
) -> BoxResult<()> {
    let num_sources = sources.len();
    let mut run_offset: u16 = 0;
    for (i, mut source) in sources.into_iter().enumerate() {
        let mut copied = 0u64;
        for id in source.leaf_ids() {
            let mut records = source.take_leaf_records(id)?;
            if records.is_empty() {
                continue;
            }
            if run_offset > 0 {
                for record in &mut records {
                    record.offset_run_index(run_offset);
                }
            }
            copied += records.len() as u64;
            dest.add_records(records)?;
            if dest.controller().should_split(dest.num_leaves()) {
                dest.split_all_if_needed_with(threads)?;
            }
        }

        for run in source.runs() {
            dest.add_run(run.clone());
        }
        if i + 1 < num_sources {
            run_offset = run_offset_after(run_offset, &source)
                .ok_or_else(|| too_many_runs(i + 1, &source))?;
        }
        log::debug!("Merged {} records from source {}", copied, i);
    }

    dest.split_all_if_needed_with(threads)?;
    dest.refresh_cache();
    Ok(())
}

/// Merges in-memory or file-backed trees into a new in-memory tree
pub fn merge_trees<R: Record>(
    sources: Vec<BoxTree<R>>,
    options: &MergeOptions,
) -> BoxResult<BoxTree<R>> {
    check_sources(&sources)?;
    let mut dest = new_destination(&sources)?;
    merge_into(&mut dest, sources, options.threads)?;
    log::info!(
        "Merged trees into {} boxes holding {} records",
        dest.num_boxes(),
        dest.total_records()
    );
    Ok(dest)
}

/// Merges saved trees into a new container at `output`.
///
/// Inputs are opened file-backed and the destination pages to `output`
/// while it grows, so the merge does not need every record in memory.
pub fn merge_files<R: Record, P: AsRef<Path>>(
    inputs: &[P],
    output: impl AsRef<Path>,
    options: &MergeOptions,
) -> BoxResult<SaveReport> {
    let output = output.as_ref();
    if inputs.iter().any(|p| p.as_ref() == output) {
        return Err(BoxTreeError::InvalidOperation(format!(
            "merge output {:?} is also an input",
            output
        )));
    }

    let mut sources = Vec::with_capacity(inputs.len());
    let mut nd = None;
    for input in inputs {
        let mut load = LoadOptions::default().file_backed(true);
        load.nd = nd;
        let loaded = persistence::load_tree::<R>(input, load)?;
        nd = Some(loaded.tree.nd());
        sources.push(loaded.tree);
    }
    check_sources(&sources)?;

    let mut dest = new_destination(&sources)?;
    persistence::save_tree(&mut dest, output, true)?;
    if let Some(cache) = dest.controller().page_cache() {
        cache.set_write_buffer_size(options.write_buffer_size);
    }
    merge_into(&mut dest, sources, options.threads)?;

    let report = persistence::save_tree(&mut dest, output, true)?;
    log::info!(
        "Merged {} files into {:?}: {} boxes, {} records",
        inputs.len(),
        output,
        report.num_boxes,
        report.total_records
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::BoxController;
    use crate::extents::BoxExtents;
    use crate::record::{FullRecord, LeanRecord};
    use crate::run_info::RunInfo;
    use tempfile::tempdir;

    fn full_tree(min: f64, max: f64, n: usize, runs: usize) -> BoxTree<FullRecord> {
        let controller = BoxController::builder(2)
            .split_threshold(40)
            .build()
            .unwrap();
        let mut tree = BoxTree::new(controller, BoxExtents::uniform(2, min, max)).unwrap();
        for r in 0..runs {
            tree.add_run(RunInfo::new(format!("run{}", r)));
        }
        let step = (max - min) / n as f64;
        let records = (0..n).map(|i| {
            let x = (min + step * i as f64) as f32;
            FullRecord::new(1.0, 1.0, (i % runs.max(1)) as u16, i as i32, &[x, x])
        });
        tree.add_records(records).unwrap();
        tree.split_all_if_needed_with(2).unwrap();
        tree
    }

    #[test]
    fn test_merge_conserves_records_and_offsets_runs() {
        let a = full_tree(0.0, 1.0, 100, 2);
        let b = full_tree(0.5, 2.0, 150, 3);
        let merged = merge_trees(vec![a, b], &MergeOptions::default()).unwrap();

        assert_eq!(merged.total_records(), 250);
        assert_eq!(merged.run_count(), 5);
        assert_eq!(merged.extents().bounds(), &[(0.0, 2.0), (0.0, 2.0)]);
        assert!((merged.total_signal() - 250.0).abs() < 1e-9);
        merged.check_structure().unwrap();

        let mut merged = merged;
        let mut max_run = 0;
        for id in merged.leaf_ids() {
            for record in merged.leaf_records(id).unwrap() {
                max_run = max_run.max(record.run_index);
            }
        }
        assert_eq!(max_run, 4);
    }

    #[test]
    fn test_merge_rejects_mixed_dimensionality() {
        let a = BoxTree::<LeanRecord>::new(
            BoxController::builder(2).build().unwrap(),
            BoxExtents::uniform(2, 0.0, 1.0),
        )
        .unwrap();
        let b = BoxTree::<LeanRecord>::new(
            BoxController::builder(3).build().unwrap(),
            BoxExtents::uniform(3, 0.0, 1.0),
        )
        .unwrap();
        assert!(matches!(
            merge_trees(vec![a, b], &MergeOptions::default()),
            Err(BoxTreeError::FormatMismatch(_))
        ));
        assert!(merge_trees::<LeanRecord>(Vec::new(), &MergeOptions::default()).is_err());
    }

    #[test]
    fn test_merge_rejects_run_index_overflow() {
        let mut a = full_tree(0.0, 1.0, 10, 1);
        let b = full_tree(0.0, 1.0, 10, 1);
        for r in 1..=u16::MAX as usize {
            a.add_run(RunInfo::new(format!("extra{}", r)));
        }
        assert_eq!(a.runs().len(), u16::MAX as usize + 1);
        assert!(matches!(
            merge_trees(vec![a, b], &MergeOptions::default()),
            Err(BoxTreeError::InvalidOperation(_))
        ));

        // The last source's own runs may fill the index space
        let mut c = full_tree(0.0, 1.0, 10, 1);
        let d = full_tree(0.0, 1.0, 10, 1);
        for r in 1..(u16::MAX as usize) {
            c.add_run(RunInfo::new(format!("extra{}", r)));
        }
        assert!(check_sources(&[c, d]).is_ok());
    }

    #[test]
    fn test_merge_files() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.mdbox");
        let b = dir.path().join("b.mdbox");
        let out = dir.path().join("merged.mdbox");
        persistence::save_tree(&mut full_tree(0.0, 1.0, 120, 1), &a, false).unwrap();
        persistence::save_tree(&mut full_tree(0.0, 1.0, 80, 2), &b, false).unwrap();

        let options = MergeOptions {
            threads: 2,
            write_buffer_size: 4096,
        };
        let report = merge_files::<FullRecord, _>(&[&a, &b], &out, &options).unwrap();
        assert_eq!(report.total_records, 200);

        let loaded = persistence::load_tree::<FullRecord>(&out, LoadOptions::default()).unwrap();
        assert_eq!(loaded.tree.total_records(), 200);
        assert_eq!(loaded.tree.run_count(), 3);
        assert!(merge_files::<FullRecord, _>(&[&a, &out], &out, &options).is_err());
        assert!(matches!(
            merge_files::<LeanRecord, _>(&[&a, &b], dir.path().join("lean.mdbox"), &options),
            Err(BoxTreeError::FormatMismatch(_))
        ));
    }
}
