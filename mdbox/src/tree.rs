//! The box tree: an arena of nodes indexed by their dense ID.
//!
//! Box `0` is the root. A grid box refers to its children by a contiguous ID
//! range, so every relation is an index lookup. When the controller carries
//! a page cache the tree is file-backed: leaves with unsaved records are
//! queued in the cache, and the oldest are written out and evicted from
//! memory once the write budget is exceeded.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::controller::BoxController;
use crate::disk_buffer::DiskBuffer;
use crate::errors::{BoxResult, BoxTreeError};
use crate::extents::BoxExtents;
use crate::node::{BoxId, FileRange, LeafBox, Node};
use crate::record::Record;
use crate::run_info::RunInfo;
use crate::splitter;

/// Summary of a tree's shape and memory use
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeStats {
    pub num_boxes: u64,
    pub num_leaves: u64,
    pub num_internal: u64,
    pub max_depth: u32,
    pub total_records: u64,
    pub records_in_memory: u64,
    pub dirty_leaves: u64,
    pub file_backed: bool,
}

/// Adaptive box tree holding records of type `R`
pub struct BoxTree<R: Record> {
    controller: BoxController,
    nodes: Vec<Node<R>>,
    runs: Vec<RunInfo>,
}

impl<R: Record> BoxTree<R> {
    /// Creates a tree with a single empty root leaf spanning `extents`.
    ///
    /// The controller must be fresh: the root takes ID 0.
    pub fn new(controller: BoxController, extents: BoxExtents) -> BoxResult<Self> {
        if extents.nd() != controller.nd() {
            return Err(BoxTreeError::InvalidOperation(format!(
                "extents have {} dimensions, controller has {}",
                extents.nd(),
                controller.nd()
            )));
        }
        if controller.next_id() != 0 {
            return Err(BoxTreeError::InvalidOperation(format!(
                "controller already allocated {} boxes",
                controller.next_id()
            )));
        }
        let root = controller.allocate_ids(1);
        controller.increment_box_count(1);
        Ok(Self {
            controller,
            nodes: vec![Node::Leaf(LeafBox::new(root, 0, extents))],
            runs: Vec::new(),
        })
    }

    /// Assembles a restored tree; node `i` must have ID `i`
    pub(crate) fn from_parts(
        controller: BoxController,
        nodes: Vec<Node<R>>,
        runs: Vec<RunInfo>,
    ) -> Self {
        Self {
            controller,
            nodes,
            runs,
        }
    }

    #[inline]
    pub fn controller(&self) -> &BoxController {
        &self.controller
    }

    #[inline]
    pub fn nd(&self) -> usize {
        self.controller.nd()
    }

    #[inline]
    pub fn num_boxes(&self) -> u64 {
        self.nodes.len() as u64
    }

    pub fn node(&self, id: BoxId) -> Option<&Node<R>> {
        self.nodes.get(id as usize)
    }

    pub fn nodes(&self) -> &[Node<R>] {
        &self.nodes
    }

    pub fn root(&self) -> &Node<R> {
        &self.nodes[0]
    }

    /// Number of leaves.
    ///
    /// Every split turns one leaf into `k` leaves and adds `k` boxes, so the
    /// count follows from the box count alone.
    pub fn num_leaves(&self) -> u64 {
        let k = self.controller.num_split_children();
        1 + (self.num_boxes() - 1) / k * (k - 1)
    }

    pub fn extents(&self) -> &BoxExtents {
        self.root().extents()
    }

    pub fn leaf_ids(&self) -> Vec<BoxId> {
        self.nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(Node::id)
            .collect()
    }

    pub fn is_file_backed(&self) -> bool {
        self.controller.is_file_backed()
    }

    fn leaf_mut(&mut self, id: BoxId) -> BoxResult<&mut LeafBox<R>> {
        self.nodes
            .get_mut(id as usize)
            .and_then(Node::as_leaf_mut)
            .ok_or_else(|| BoxTreeError::InvalidOperation(format!("box {} is not a leaf", id)))
    }

    fn leaf(&self, id: BoxId) -> BoxResult<&LeafBox<R>> {
        self.nodes
            .get(id as usize)
            .and_then(Node::as_leaf)
            .ok_or_else(|| BoxTreeError::InvalidOperation(format!("box {} is not a leaf", id)))
    }

    fn require_cache(&self) -> BoxResult<Arc<DiskBuffer>> {
        self.controller.page_cache().ok_or_else(|| {
            BoxTreeError::InvalidOperation("tree has no file backing".into())
        })
    }

    // ------------------------------------------------------------------
    // Adding records
    // ------------------------------------------------------------------

    /// The leaf whose extents receive `coords`
    pub fn find_leaf(&self, coords: &[f32]) -> BoxResult<BoxId> {
        self.check_coords(coords.len())?;
        Ok(self.route(coords))
    }

    /// Descends to the leaf for `coords`, which must have `nd` entries
    fn route(&self, coords: &[f32]) -> BoxId {
        let branching = self.controller.branching();
        let mut node = &self.nodes[0];
        while let Node::Internal(grid) = node {
            let k = grid.extents().child_index(coords, branching) as u64;
            node = &self.nodes[(grid.children().start + k) as usize];
        }
        node.id()
    }

    fn check_coords(&self, len: usize) -> BoxResult<()> {
        if len != self.nd() {
            return Err(BoxTreeError::InvalidOperation(format!(
                "record has {} coordinates, tree has {} dimensions",
                len,
                self.nd()
            )));
        }
        Ok(())
    }

    fn check_record(&self, record: &R) -> BoxResult<()> {
        self.check_coords(record.coords().len())
    }

    pub fn add_record(&mut self, record: R) -> BoxResult<()> {
        self.check_record(&record)?;
        let id = self.route(record.coords());
        self.leaf_mut(id)?.add_record(record);
        self.controller.add_records_count(1);
        self.queue_leaves(&[id])
    }

    /// Adds a batch; nothing is added unless every record fits the tree
    pub fn add_records(&mut self, records: impl IntoIterator<Item = R>) -> BoxResult<()> {
        let records: Vec<R> = records.into_iter().collect();
        for record in &records {
            self.check_record(record)?;
        }
        let mut touched = BTreeSet::new();
        let mut added = 0;
        for record in records {
            let id = self.route(record.coords());
            self.leaf_mut(id)?.add_record(record);
            touched.insert(id);
            added += 1;
        }
        self.controller.add_records_count(added);
        let touched: Vec<BoxId> = touched.into_iter().collect();
        self.queue_leaves(&touched)
    }

    /// Routes each chunk to its leaves on a worker thread, then appends.
    ///
    /// Routing only reads the tree, so chunks are processed concurrently;
    /// the records of a leaf keep their chunk order.
    pub fn add_records_parallel(&mut self, chunks: Vec<Vec<R>>, threads: usize) -> BoxResult<()> {
        if threads <= 1 || chunks.len() <= 1 {
            return self.add_records(chunks.into_iter().flatten());
        }

        let routed: Vec<BoxResult<Vec<(BoxId, R)>>> = {
            let tree = &*self;
            std::thread::scope(|s| {
                let handles: Vec<_> = chunks
                    .into_iter()
                    .map(|chunk| {
                        s.spawn(move || {
                            chunk
                                .into_iter()
                                .map(|record| -> BoxResult<(BoxId, R)> {
                                    tree.check_record(&record)?;
                                    Ok((tree.route(record.coords()), record))
                                })
                                .collect::<BoxResult<Vec<_>>>()
                        })
                    })
                    .collect();

                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                    .collect()
            })
        };

        let routed = routed.into_iter().collect::<BoxResult<Vec<_>>>()?;
        let mut touched = BTreeSet::new();
        let mut added = 0;
        for chunk in routed {
            for (id, record) in chunk {
                self.leaf_mut(id)?.add_record(record);
                touched.insert(id);
                added += 1;
            }
        }
        self.controller.add_records_count(added);
        let touched: Vec<BoxId> = touched.into_iter().collect();
        self.queue_leaves(&touched)
    }

    /// Queues changed leaves in the page cache and writes out whatever the
    /// cache evicts
    fn queue_leaves(&mut self, ids: &[BoxId]) -> BoxResult<()> {
        let Some(cache) = self.controller.page_cache() else {
            return Ok(());
        };
        let record_size = R::stored_size(self.nd());
        for &id in ids {
            let leaf = self.leaf(id)?;
            if !leaf.is_dirty() {
                continue;
            }
            let bytes = leaf.records().len() as u64 * record_size;
            for evicted in cache.to_write(id, bytes) {
                self.write_leaf(evicted, true)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Splitting
    // ------------------------------------------------------------------

    /// Splits leaf `id` once, whatever its record count
    pub fn split_box(&mut self, id: BoxId) -> BoxResult<()> {
        self.load_leaf(id)?;
        let (leaf, range) = self.claim_leaf(id)?;
        let (grid, children) = leaf.split(&self.controller);
        let mut nodes = Vec::with_capacity(children.len() + 1);
        nodes.push(Node::Internal(grid));
        nodes.extend(children.into_iter().map(Node::Leaf));
        self.commit(nodes)?;
        self.release_ranges(range)
    }

    /// Splits every over-threshold leaf, using all available cores
    pub fn split_all_if_needed(&mut self) -> BoxResult<usize> {
        let threads = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        self.split_all_if_needed_with(threads)
    }

    /// Splits every over-threshold leaf on `threads` workers and returns the
    /// number of leaves that were split.
    ///
    /// Children still over threshold are split in the same pass. Afterwards
    /// no leaf below max depth holds more records than the threshold.
    ///
    /// Every candidate is loaded before any is taken out of the arena, so a
    /// failed read leaves the tree as it was.
    pub fn split_all_if_needed_with(&mut self, threads: usize) -> BoxResult<usize> {
        let candidates: Vec<BoxId> = self
            .nodes
            .iter()
            .filter_map(Node::as_leaf)
            .filter(|leaf| leaf.should_split(&self.controller))
            .map(LeafBox::id)
            .collect();
        for &id in &candidates {
            self.load_leaf(id)?;
        }
        self.controller.reset_records_added();
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut leaves = Vec::with_capacity(candidates.len());
        let mut ranges = Vec::new();
        for &id in &candidates {
            let (leaf, range) = self.claim_leaf(id)?;
            leaves.push(leaf);
            ranges.extend(range);
        }
        let nodes = splitter::split_leaves(&self.controller, leaves, threads);
        self.commit(nodes)?;
        self.release_ranges(ranges)?;

        log::debug!(
            "Split {} leaves, tree now has {} boxes",
            candidates.len(),
            self.nodes.len()
        );
        Ok(candidates.len())
    }

    /// Takes a loaded leaf out of the arena for splitting.
    ///
    /// The stored block comes back with it and stays reserved until the
    /// caller releases it once the split is in place.
    fn claim_leaf(&mut self, id: BoxId) -> BoxResult<(LeafBox<R>, Option<FileRange>)> {
        let leaf = self.leaf_mut(id)?.detach();
        if let Some(cache) = self.controller.page_cache() {
            cache.remove_from_queue(id);
        }
        let range = leaf.file_range();
        Ok((leaf, range))
    }

    fn release_ranges(&self, ranges: impl IntoIterator<Item = FileRange>) -> BoxResult<()> {
        let Some(cache) = self.controller.page_cache() else {
            return Ok(());
        };
        for range in ranges {
            cache.release(range)?;
        }
        Ok(())
    }

    /// Puts split results into the arena: known IDs are replaced, new IDs
    /// must continue the arena without gaps
    fn commit(&mut self, mut nodes: Vec<Node<R>>) -> BoxResult<()> {
        nodes.sort_unstable_by_key(Node::id);
        let mut new_leaves = Vec::new();
        for node in nodes {
            let id = node.id() as usize;
            if node.as_leaf().is_some_and(|l| l.is_dirty()) {
                new_leaves.push(node.id());
            }
            if id < self.nodes.len() {
                self.nodes[id] = node;
            } else if id == self.nodes.len() {
                self.nodes.push(node);
            } else {
                return Err(BoxTreeError::InvalidOperation(format!(
                    "box {} would leave a gap after box {}",
                    id,
                    self.nodes.len() - 1
                )));
            }
        }
        self.queue_leaves(&new_leaves)
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    /// Recomputes cached signal and error bottom-up.
    ///
    /// Children always have higher IDs than their parent, so one pass in
    /// descending ID order sees every child before its parent.
    pub fn refresh_cache(&mut self) {
        for i in (0..self.nodes.len()).rev() {
            let children = match &mut self.nodes[i] {
                Node::Leaf(leaf) => {
                    leaf.refresh_cache();
                    continue;
                }
                Node::Internal(grid) => grid.children(),
            };
            let (signal, error_squared) = children
                .filter_map(|c| self.nodes.get(c as usize))
                .fold((0.0, 0.0), |(s, e), n| (s + n.signal(), e + n.error_squared()));
            if let Node::Internal(grid) = &mut self.nodes[i] {
                grid.set_cache(signal, error_squared);
            }
        }
    }

    pub fn total_records(&self) -> u64 {
        self.nodes
            .iter()
            .filter_map(Node::as_leaf)
            .map(LeafBox::num_records)
            .sum()
    }

    /// Sum of the leaves' signal; unlike the grid boxes' caches this never
    /// waits for [`Self::refresh_cache`]
    pub fn total_signal(&self) -> f64 {
        self.nodes
            .iter()
            .filter_map(Node::as_leaf)
            .map(LeafBox::signal)
            .sum()
    }

    // ------------------------------------------------------------------
    // Record access and paging
    // ------------------------------------------------------------------

    /// Reads a leaf's stored block into memory if it is not there yet
    pub fn load_leaf(&mut self, id: BoxId) -> BoxResult<()> {
        let leaf = self.leaf(id)?;
        let Some(range) = leaf.file_range().filter(|_| !leaf.is_loaded()) else {
            return Ok(());
        };
        let stored = self.require_cache()?.read_records(range)?;
        self.leaf_mut(id)?.set_loaded_records(stored);
        Ok(())
    }

    /// All records of a leaf, loading them when needed
    pub fn leaf_records(&mut self, id: BoxId) -> BoxResult<&[R]> {
        self.load_leaf(id)?;
        Ok(self.leaf(id)?.records())
    }

    /// Moves all records out of a leaf, leaving it empty and releasing its
    /// stored block
    pub fn take_leaf_records(&mut self, id: BoxId) -> BoxResult<Vec<R>> {
        self.load_leaf(id)?;
        let (records, range) = self.leaf_mut(id)?.take_records();
        if let Some(cache) = self.controller.page_cache() {
            cache.remove_from_queue(id);
            if let Some(range) = range {
                cache.release(range)?;
            }
        }
        Ok(records)
    }

    /// Writes a dirty leaf to its block, optionally evicting its records
    pub fn write_leaf(&mut self, id: BoxId, evict: bool) -> BoxResult<()> {
        let cache = self.require_cache()?;
        if self.leaf(id)?.is_dirty() {
            self.load_leaf(id)?;
            let leaf = self.leaf_mut(id)?;
            let range = cache.write_records(leaf.file_range(), leaf.records())?;
            leaf.mark_written(range);
        }
        cache.remove_from_queue(id);
        if evict {
            self.leaf_mut(id)?.clear_data_from_memory();
        }
        Ok(())
    }

    /// Writes every dirty leaf and persists the free-space table.
    ///
    /// Leaves that were only partly in memory are evicted again after the
    /// write. A tree without file backing has nothing to flush.
    pub fn flush_cache(&mut self) -> BoxResult<()> {
        let Some(cache) = self.controller.page_cache() else {
            return Ok(());
        };
        let mut ids = cache.drain_queue();
        ids.extend(
            self.nodes
                .iter()
                .filter_map(Node::as_leaf)
                .filter(|l| l.is_dirty())
                .map(LeafBox::id),
        );

        let mut written = 0;
        for id in ids {
            let leaf = self.leaf(id)?;
            if !leaf.is_dirty() {
                continue;
            }
            let evict = !leaf.is_loaded();
            self.write_leaf(id, evict)?;
            written += 1;
        }
        cache.sync()?;
        log::debug!("Flushed {} leaves to '{}'", written, cache.path().display());
        Ok(())
    }

    /// Drops the in-memory records of every clean stored leaf
    pub fn evict_clean_leaves(&mut self) -> usize {
        self.nodes
            .iter_mut()
            .filter_map(Node::as_leaf_mut)
            .map(LeafBox::clear_data_from_memory)
            .filter(|&evicted| evicted)
            .count()
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [Node<R>] {
        &mut self.nodes
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats {
            num_boxes: self.num_boxes(),
            file_backed: self.is_file_backed(),
            ..TreeStats::default()
        };
        for node in &self.nodes {
            stats.max_depth = stats.max_depth.max(node.depth());
            match node {
                Node::Leaf(leaf) => {
                    stats.num_leaves += 1;
                    stats.total_records += leaf.num_records();
                    stats.records_in_memory += leaf.records().len() as u64;
                    if leaf.is_dirty() {
                        stats.dirty_leaves += 1;
                    }
                }
                Node::Internal(_) => stats.num_internal += 1,
            }
        }
        stats
    }

    /// Verifies the arena shape: IDs match slots, box 0 is the root, every
    /// other box has exactly one parent one level up, and every grid box has
    /// a full contiguous child range.
    pub fn check_structure(&self) -> BoxResult<()> {
        let n = self.nodes.len() as u64;
        let expected_children = self.controller.num_split_children();
        let mut parent: Vec<Option<BoxId>> = vec![None; self.nodes.len()];

        for (i, node) in self.nodes.iter().enumerate() {
            if node.id() != i as u64 {
                return Err(structure_error(format!("slot {} holds box {}", i, node.id())));
            }
            let Node::Internal(grid) = node else {
                continue;
            };
            let children = grid.children();
            if grid.num_children() != expected_children || children.end > n || children.start == 0
            {
                return Err(structure_error(format!(
                    "box {} has child range {:?}, expected {} children within 1..{}",
                    i, children, expected_children, n
                )));
            }
            for c in children {
                if let Some(other) = parent[c as usize] {
                    return Err(structure_error(format!(
                        "box {} is a child of both {} and {}",
                        c, other, i
                    )));
                }
                parent[c as usize] = Some(i as u64);
                if self.nodes[c as usize].depth() != grid.depth() + 1 {
                    return Err(structure_error(format!(
                        "box {} at depth {} is a child of box {} at depth {}",
                        c,
                        self.nodes[c as usize].depth(),
                        i,
                        grid.depth()
                    )));
                }
            }
        }

        if let Some(root) = self.nodes.first() {
            if root.depth() != 0 {
                return Err(structure_error("box 0 is not at depth 0".into()));
            }
        }
        if let Some(orphan) = parent.iter().skip(1).position(Option::is_none) {
            return Err(structure_error(format!("box {} has no parent", orphan + 1)));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Run provenance
    // ------------------------------------------------------------------

    pub fn runs(&self) -> &[RunInfo] {
        &self.runs
    }

    /// Appends a run entry and returns its run index
    pub fn add_run(&mut self, run: RunInfo) -> u16 {
        self.runs.push(run);
        (self.runs.len() - 1) as u16
    }

    pub fn run_count(&self) -> u16 {
        self.runs.len() as u16
    }

    pub(crate) fn set_runs(&mut self, runs: Vec<RunInfo>) {
        self.runs = runs;
    }
}

fn structure_error(message: String) -> BoxTreeError {
    BoxTreeError::FormatMismatch(format!("inconsistent box structure: {}", message))
}

impl<R: Record> std::fmt::Debug for BoxTree<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxTree")
            .field("record_type", &R::KIND)
            .field("controller", &self.controller)
            .field("num_boxes", &self.nodes.len())
            .field("runs", &self.runs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerFile;
    use crate::record::LeanRecord;
    use crate::record_store;
    use rand::Rng;
    use tempfile::tempdir;

    fn tree(nd: usize, branching: u32, threshold: u64) -> BoxTree<LeanRecord> {
        let controller = BoxController::builder(nd)
            .branching(branching)
            .split_threshold(threshold)
            .build()
            .unwrap();
        BoxTree::new(controller, BoxExtents::uniform(nd, 0.0, 1.0)).unwrap()
    }

    fn random_records(n: usize, nd: usize) -> Vec<LeanRecord> {
        let mut rng = rand::thread_rng();
        (0..n)
            .map(|_| {
                let coords: Vec<f32> = (0..nd).map(|_| rng.gen::<f32>()).collect();
                LeanRecord::new(1.0, 2.0, &coords)
            })
            .collect()
    }

    fn attach_cache(tree: &BoxTree<LeanRecord>, dir: &std::path::Path, budget: u64) {
        let mut container = ContainerFile::create(dir.join("tree.mdbox")).unwrap();
        record_store::require_record_arrays::<LeanRecord>(&mut container, tree.nd()).unwrap();
        let cache = DiskBuffer::new(container, tree.nd(), &[], budget).unwrap();
        tree.controller().set_file_backing(Arc::new(cache));
    }

    #[test]
    fn test_new_tree_rejects_used_controller() {
        let controller = BoxController::builder(2).build().unwrap();
        controller.allocate_ids(1);
        assert!(BoxTree::<LeanRecord>::new(controller, BoxExtents::uniform(2, 0.0, 1.0)).is_err());

        let controller = BoxController::builder(2).build().unwrap();
        assert!(BoxTree::<LeanRecord>::new(controller, BoxExtents::uniform(3, 0.0, 1.0)).is_err());
    }

    #[test]
    fn test_split_all_distributes_records() {
        let mut tree = tree(2, 4, 100);
        tree.add_records(random_records(500, 2)).unwrap();
        assert_eq!(tree.split_all_if_needed_with(1).unwrap(), 1);

        assert!(!tree.root().is_leaf());
        assert_eq!(tree.root().as_grid().unwrap().children(), 1..17);
        assert_eq!(tree.num_boxes(), 17);
        assert_eq!(tree.num_leaves(), 16);
        assert_eq!(tree.total_records(), 500);
        tree.check_structure().unwrap();
    }

    #[test]
    fn test_split_box_and_find_leaf() {
        let mut tree = tree(1, 2, 1000);
        tree.split_box(0).unwrap();
        tree.split_box(2).unwrap();
        tree.check_structure().unwrap();
        assert_eq!(tree.num_boxes(), 5);
        assert_eq!(tree.find_leaf(&[0.1]).unwrap(), 1);
        assert_eq!(tree.find_leaf(&[0.6]).unwrap(), 3);
        assert_eq!(tree.find_leaf(&[0.9]).unwrap(), 4);
        assert!(matches!(
            tree.find_leaf(&[]),
            Err(BoxTreeError::InvalidOperation(_))
        ));
        assert!(tree.find_leaf(&[0.1, 0.2]).is_err());
        assert!(tree.split_box(0).is_err());
    }

    #[test]
    fn test_refresh_cache_sums_bottom_up() {
        let mut tree = tree(2, 2, 50);
        tree.add_records(random_records(400, 2)).unwrap();
        tree.split_all_if_needed_with(2).unwrap();
        tree.refresh_cache();
        assert!((tree.total_signal() - 400.0).abs() < 1e-9);
        assert!((tree.root().error_squared() - 800.0).abs() < 1e-9);
    }

    #[test]
    fn test_parallel_ingest_matches_serial() {
        let mut tree = tree(3, 2, 200);
        tree.split_box(0).unwrap();
        let chunks: Vec<Vec<LeanRecord>> = (0..4).map(|_| random_records(250, 3)).collect();
        tree.add_records_parallel(chunks, 4).unwrap();
        assert_eq!(tree.total_records(), 1000);
        tree.split_all_if_needed_with(4).unwrap();
        assert_eq!(tree.total_records(), 1000);
        tree.check_structure().unwrap();

        let bad = vec![vec![LeanRecord::new(1.0, 1.0, &[0.5])], random_records(3, 3)];
        assert!(tree.add_records_parallel(bad, 2).is_err());
    }

    #[test]
    fn test_check_structure_detects_broken_range() {
        let mut tree = tree(1, 2, 10);
        tree.split_box(0).unwrap();
        if let Node::Internal(grid) = &mut tree.nodes_mut()[0] {
            grid.set_children(1, 2);
        }
        assert!(matches!(
            tree.check_structure(),
            Err(BoxTreeError::FormatMismatch(_))
        ));
    }

    #[test]
    fn test_file_backed_tree_evicts_and_reloads() {
        let dir = tempdir().unwrap();
        let mut tree = tree(2, 2, 100);
        // Room for roughly one leaf's worth of records
        attach_cache(&tree, dir.path(), 50 * LeanRecord::stored_size(2));

        tree.add_records(random_records(300, 2)).unwrap();
        tree.split_all_if_needed_with(2).unwrap();
        tree.add_records(random_records(300, 2)).unwrap();
        tree.split_all_if_needed_with(2).unwrap();
        assert_eq!(tree.total_records(), 600);

        let stats = tree.stats();
        assert!(stats.records_in_memory < 600);

        tree.flush_cache().unwrap();
        assert_eq!(tree.stats().dirty_leaves, 0);
        assert_eq!(tree.total_records(), 600);
        assert!(tree.evict_clean_leaves() > 0);
        assert_eq!(tree.stats().records_in_memory, 0);

        let mut seen = 0;
        for id in tree.leaf_ids() {
            seen += tree.leaf_records(id).unwrap().len();
        }
        assert_eq!(seen, 600);
    }

    #[test]
    fn test_failed_split_keeps_every_record() {
        let dir = tempdir().unwrap();
        let mut tree = tree(1, 2, 1000);
        attach_cache(&tree, dir.path(), 1 << 20);
        tree.split_box(0).unwrap();
        tree.add_records((0..16).map(|i| LeanRecord::new(1.0, 1.0, &[i as f32 / 40.0])))
            .unwrap();
        tree.add_records((0..16).map(|i| LeanRecord::new(1.0, 1.0, &[0.6 + i as f32 / 40.0])))
            .unwrap();
        tree.flush_cache().unwrap();
        // Leaf 1 stays in memory, leaf 2 only on disk
        tree.write_leaf(2, true).unwrap();
        assert!(tree.leaf(1).unwrap().is_loaded());
        assert!(!tree.leaf(2).unwrap().is_loaded());

        let cache = tree.controller().page_cache().unwrap();
        let free_before = cache.free_space_blocks();
        let ranges_before: Vec<_> = tree
            .leaf_ids()
            .into_iter()
            .map(|id| tree.leaf(id).unwrap().file_range())
            .collect();
        let _container = cache.take_container().unwrap();

        tree.controller().set_split_threshold(10);
        assert!(tree.split_all_if_needed_with(1).is_err());
        assert_eq!(tree.num_boxes(), 3);
        assert_eq!(tree.total_records(), 32);
        assert_eq!(tree.leaf(1).unwrap().records().len(), 16);
        assert_eq!(tree.leaf(2).unwrap().num_records(), 16);
        assert_eq!(cache.free_space_blocks(), free_before);
        let ranges_after: Vec<_> = tree
            .leaf_ids()
            .into_iter()
            .map(|id| tree.leaf(id).unwrap().file_range())
            .collect();
        assert_eq!(ranges_after, ranges_before);
        tree.check_structure().unwrap();
    }

    #[test]
    fn test_batch_with_bad_record_adds_nothing() {
        let mut tree = tree(2, 2, 100);
        let mut records = random_records(20, 2);
        records.push(LeanRecord::new(1.0, 1.0, &[0.5]));
        assert!(tree.add_records(records).is_err());
        assert_eq!(tree.total_records(), 0);
        assert_eq!(tree.controller().records_added(), 0);
    }

    #[test]
    fn test_total_signal_is_current_without_refresh() {
        let mut tree = tree(2, 2, 1000);
        tree.split_box(0).unwrap();
        tree.add_records((0..50).map(|i| LeanRecord::new(1.0, 1.0, &[i as f32 / 50.0, 0.3])))
            .unwrap();
        tree.split_all_if_needed_with(1).unwrap();
        assert!((tree.total_signal() - 50.0).abs() < 1e-9);
        assert_eq!(tree.total_records(), 50);
    }

    #[test]
    fn test_take_leaf_records_releases_range() {
        let dir = tempdir().unwrap();
        let mut tree = tree(1, 2, 1000);
        attach_cache(&tree, dir.path(), 1 << 20);
        tree.add_records(random_records(10, 1)).unwrap();
        tree.flush_cache().unwrap();
        let range = tree.root().as_leaf().unwrap().file_range().unwrap();

        let records = tree.take_leaf_records(0).unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(tree.total_records(), 0);
        let cache = tree.controller().page_cache().unwrap();
        assert_eq!(cache.free_space_blocks(), vec![(range.offset, range.count)]);
    }

    #[test]
    fn test_runs() {
        let mut tree = tree(1, 2, 10);
        assert_eq!(tree.run_count(), 0);
        assert_eq!(tree.add_run(RunInfo::new("a")), 0);
        assert_eq!(tree.add_run(RunInfo::new("b")), 1);
        assert_eq!(tree.run_count(), 2);
    }
}
