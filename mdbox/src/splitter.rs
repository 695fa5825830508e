//! Worker pool that splits over-threshold leaves in parallel.
//!
//! Each job is a leaf already detached from the tree arena, so no two
//! workers can ever touch the same leaf. A worker splits its leaf and keeps
//! splitting the resulting children while they stay over threshold. The
//! nodes it produces are sent back for the tree to splice in by ID.

use crossbeam_channel::unbounded;

use crate::controller::BoxController;
use crate::node::{LeafBox, Node};
use crate::record::Record;

/// Splits every leaf that needs it and returns the resulting nodes.
///
/// The output holds one node per input leaf (a grid box if it was split, the
/// leaf itself otherwise) plus every descendant created. Order is
/// unspecified; IDs are unique.
pub fn split_leaves<R: Record>(
    controller: &BoxController,
    leaves: Vec<LeafBox<R>>,
    threads: usize,
) -> Vec<Node<R>> {
    if threads <= 1 || leaves.len() <= 1 {
        let mut out = Vec::new();
        for leaf in leaves {
            split_subtree(controller, leaf, &mut out);
        }
        return out;
    }

    let (job_tx, job_rx) = unbounded::<LeafBox<R>>();
    let (result_tx, result_rx) = unbounded::<Vec<Node<R>>>();
    let workers = threads.min(leaves.len());
    for leaf in leaves {
        // Receivers live until the scope below ends
        let _ = job_tx.send(leaf);
    }
    drop(job_tx);

    std::thread::scope(|s| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            s.spawn(move || {
                while let Ok(leaf) = job_rx.recv() {
                    let mut out = Vec::new();
                    split_subtree(controller, leaf, &mut out);
                    if result_tx.send(out).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    log::debug!("Split pass finished on {} worker threads", workers);
    result_rx.into_iter().flatten().collect()
}

/// Splits `leaf` recursively while it is over threshold and below max depth
pub fn split_subtree<R: Record>(
    controller: &BoxController,
    leaf: LeafBox<R>,
    out: &mut Vec<Node<R>>,
) {
    if !leaf.should_split(controller) {
        out.push(Node::Leaf(leaf));
        return;
    }
    let (grid, children) = leaf.split(controller);
    out.push(Node::Internal(grid));
    for child in children {
        split_subtree(controller, child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extents::BoxExtents;
    use crate::record::LeanRecord;
    use rand::Rng;

    fn filled_leaf(controller: &BoxController, n: usize, rng: &mut impl Rng) -> LeafBox<LeanRecord> {
        let id = controller.allocate_ids(1);
        controller.increment_box_count(1);
        let mut leaf = LeafBox::new(id, 1, BoxExtents::uniform(2, 0.0, 1.0));
        for _ in 0..n {
            leaf.add_record(LeanRecord::new(1.0, 1.0, &[rng.gen::<f32>(), rng.gen::<f32>()]));
        }
        leaf
    }

    fn count(nodes: &[Node<LeanRecord>]) -> u64 {
        nodes
            .iter()
            .filter_map(Node::as_leaf)
            .map(LeafBox::num_records)
            .sum()
    }

    #[test]
    fn test_recursive_split_conserves_records() {
        let controller = BoxController::builder(2)
            .split_threshold(10)
            .max_depth(6)
            .build()
            .unwrap();
        let mut rng = rand::thread_rng();
        let leaf = filled_leaf(&controller, 200, &mut rng);

        let nodes = split_leaves(&controller, vec![leaf], 1);
        assert_eq!(count(&nodes), 200);
        assert_eq!(nodes.len() as u64, controller.total_boxes());
        assert!(nodes
            .iter()
            .filter_map(Node::as_leaf)
            .all(|l| l.num_records() <= 10 || l.depth() == 6));
    }

    #[test]
    fn test_parallel_split_unique_contiguous_ids() {
        let controller = BoxController::builder(2)
            .split_threshold(20)
            .max_depth(8)
            .build()
            .unwrap();
        let mut rng = rand::thread_rng();
        let leaves: Vec<_> = (0..6)
            .map(|_| filled_leaf(&controller, 150, &mut rng))
            .collect();

        let nodes = split_leaves(&controller, leaves, 4);
        assert_eq!(count(&nodes), 900);

        let mut ids: Vec<u64> = nodes.iter().map(Node::id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..controller.next_id()).collect::<Vec<_>>());

        for grid in nodes.iter().filter_map(Node::as_grid) {
            assert_eq!(grid.num_children(), 4);
        }
    }

    #[test]
    fn test_leaf_below_threshold_passes_through() {
        let controller = BoxController::builder(2).split_threshold(100).build().unwrap();
        let mut rng = rand::thread_rng();
        let leaf = filled_leaf(&controller, 5, &mut rng);
        let nodes = split_leaves(&controller, vec![leaf], 2);
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].is_leaf());
    }
}
