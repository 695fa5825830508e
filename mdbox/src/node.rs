//! Nodes of a box tree: leaves holding records and grid boxes holding a
//! contiguous range of children.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::controller::BoxController;
use crate::extents::BoxExtents;
use crate::record::Record;

/// Dense ordinal identifier of a box; 0 is the root
pub type BoxId = u64;

/// A leaf's block of records in the container's record area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRange {
    pub offset: u64,
    pub count: u64,
}

impl FileRange {
    pub fn new(offset: u64, count: u64) -> Self {
        Self { offset, count }
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.count
    }

    pub fn overlaps(&self, other: &FileRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// A box that directly owns records.
///
/// A file-backed leaf may hold only part of its records in memory. Until its
/// stored block is loaded, `records` holds just the records added since, and
/// the stored ones are counted through `file_range`.
#[derive(Debug, Clone)]
pub struct LeafBox<R> {
    id: BoxId,
    depth: u32,
    extents: BoxExtents,
    signal: f64,
    error_squared: f64,
    inverse_volume: f64,
    records: Vec<R>,
    file_range: Option<FileRange>,
    loaded: bool,
    dirty: bool,
}

impl<R: Record> LeafBox<R> {
    pub fn new(id: BoxId, depth: u32, extents: BoxExtents) -> Self {
        let inverse_volume = extents.inverse_volume();
        Self {
            id,
            depth,
            extents,
            signal: 0.0,
            error_squared: 0.0,
            inverse_volume,
            records: Vec::new(),
            file_range: None,
            loaded: false,
            dirty: false,
        }
    }

    /// A leaf whose records live in the container and are read on demand
    pub(crate) fn with_file_range(mut self, range: Option<FileRange>) -> Self {
        self.file_range = range.filter(|r| r.count > 0);
        self.loaded = false;
        self
    }

    #[inline]
    pub fn id(&self) -> BoxId {
        self.id
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[inline]
    pub fn extents(&self) -> &BoxExtents {
        &self.extents
    }

    #[inline]
    pub fn signal(&self) -> f64 {
        self.signal
    }

    #[inline]
    pub fn error_squared(&self) -> f64 {
        self.error_squared
    }

    #[inline]
    pub fn inverse_volume(&self) -> f64 {
        self.inverse_volume
    }

    #[inline]
    pub fn file_range(&self) -> Option<FileRange> {
        self.file_range
    }

    /// Whether the in-memory records differ from the stored block
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether every record of the leaf is in memory
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.file_range.is_none() || self.loaded
    }

    pub fn num_records(&self) -> u64 {
        match self.file_range {
            Some(range) if !self.loaded => range.count + self.records.len() as u64,
            _ => self.records.len() as u64,
        }
    }

    /// Records currently held in memory
    #[inline]
    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn add_record(&mut self, record: R) {
        self.signal += record.signal() as f64;
        self.error_squared += record.error_squared() as f64;
        self.records.push(record);
        self.dirty = true;
    }

    pub fn add_records(&mut self, records: impl IntoIterator<Item = R>) {
        for record in records {
            self.add_record(record);
        }
    }

    /// Sets cached aggregates, as stored in a container
    pub(crate) fn set_cache(&mut self, signal: f64, error_squared: f64) {
        self.signal = signal;
        self.error_squared = error_squared;
    }

    /// Recomputes the cached aggregates from the records.
    ///
    /// A leaf that is not loaded keeps its running totals.
    pub fn refresh_cache(&mut self) {
        if !self.is_loaded() {
            return;
        }
        let (signal, error_squared) = self.records.iter().fold((0.0, 0.0), |(s, e), r| {
            (s + r.signal() as f64, e + r.error_squared() as f64)
        });
        self.signal = signal;
        self.error_squared = error_squared;
    }

    /// Puts the stored block in front of the records added since it was
    /// written, making the leaf fully loaded
    pub(crate) fn set_loaded_records(&mut self, mut stored: Vec<R>) {
        stored.append(&mut self.records);
        self.records = stored;
        self.loaded = true;
    }

    /// Replaces the records of a leaf without file backing
    pub(crate) fn set_records(&mut self, records: Vec<R>) {
        self.dirty = !records.is_empty();
        self.records = records;
        self.file_range = None;
        self.loaded = true;
        self.refresh_cache();
    }

    /// Keeps the loaded records in memory only, dropping the stored block
    /// marker without releasing it
    pub(crate) fn forget_file_range(&mut self) {
        self.file_range = None;
        self.loaded = true;
        self.dirty = !self.records.is_empty();
    }

    /// The leaf's in-memory records now live at `range` (none when empty)
    pub(crate) fn mark_written(&mut self, range: Option<FileRange>) {
        self.file_range = range;
        self.loaded = true;
        self.dirty = false;
    }

    /// Drops the in-memory copy of records that are safely stored.
    ///
    /// Returns false, keeping the records, when the leaf has unsaved changes
    /// or no stored block.
    pub fn clear_data_from_memory(&mut self) -> bool {
        if self.dirty || self.file_range.is_none() {
            return false;
        }
        self.records = Vec::new();
        self.loaded = false;
        true
    }

    /// Moves all records out, leaving an empty leaf without a stored block.
    ///
    /// The leaf must be loaded; the stored block becomes the caller's to release.
    pub(crate) fn take_records(&mut self) -> (Vec<R>, Option<FileRange>) {
        let records = std::mem::take(&mut self.records);
        let range = self.file_range.take();
        self.signal = 0.0;
        self.error_squared = 0.0;
        self.loaded = false;
        self.dirty = true;
        (records, range)
    }

    /// Moves the leaf out, leaving an empty leaf with the same identity behind
    pub(crate) fn detach(&mut self) -> LeafBox<R> {
        let placeholder = LeafBox::new(self.id, self.depth, self.extents.clone());
        std::mem::replace(self, placeholder)
    }

    /// Whether the leaf is over the split threshold and may still be divided
    pub fn should_split(&self, controller: &BoxController) -> bool {
        self.depth < controller.max_depth() && self.num_records() > controller.split_threshold()
    }

    /// Divides the leaf into `Π branching` children.
    ///
    /// The leaf's ID passes to the returned grid box; the children get the
    /// next contiguous block of IDs, numbered with dimension 0 varying
    /// fastest. Every record goes to the child containing it, or the nearest
    /// one when it lies outside the leaf. The leaf must be loaded; its stored
    /// block, if any, is the caller's to release.
    pub fn split(self, controller: &BoxController) -> (GridBox, Vec<LeafBox<R>>) {
        let branching = controller.branching();
        let num_children = controller.num_split_children();
        let first = controller.allocate_ids(num_children);
        controller.increment_box_count(num_children);

        let mut children: Vec<LeafBox<R>> = self
            .extents
            .subdivide(branching)
            .into_iter()
            .enumerate()
            .map(|(k, extents)| LeafBox::new(first + k as u64, self.depth + 1, extents))
            .collect();

        let degenerate = children.iter().filter(|c| c.extents.is_degenerate()).count();
        if degenerate > 0 {
            log::warn!(
                "Split of box {} produced {} zero-volume children",
                self.id,
                degenerate
            );
        }

        for record in self.records {
            let k = self.extents.child_index(record.coords(), branching);
            children[k].add_record(record);
        }
        for child in &mut children {
            child.refresh_cache();
        }

        let mut grid = GridBox::new(self.id, self.depth, self.extents);
        grid.set_children(first, first + num_children);
        grid.set_cache(self.signal, self.error_squared);
        grid.inverse_volume = self.inverse_volume;
        (grid, children)
    }
}

/// A box owning the contiguous child range `[first_child, last_child_exclusive)`
#[derive(Debug, Clone)]
pub struct GridBox {
    id: BoxId,
    depth: u32,
    extents: BoxExtents,
    signal: f64,
    error_squared: f64,
    inverse_volume: f64,
    first_child: BoxId,
    last_child_exclusive: BoxId,
}

impl GridBox {
    pub fn new(id: BoxId, depth: u32, extents: BoxExtents) -> Self {
        let inverse_volume = extents.inverse_volume();
        Self {
            id,
            depth,
            extents,
            signal: 0.0,
            error_squared: 0.0,
            inverse_volume,
            first_child: 0,
            last_child_exclusive: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> BoxId {
        self.id
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[inline]
    pub fn extents(&self) -> &BoxExtents {
        &self.extents
    }

    #[inline]
    pub fn signal(&self) -> f64 {
        self.signal
    }

    #[inline]
    pub fn error_squared(&self) -> f64 {
        self.error_squared
    }

    #[inline]
    pub fn inverse_volume(&self) -> f64 {
        self.inverse_volume
    }

    pub fn set_children(&mut self, first: BoxId, last_exclusive: BoxId) {
        self.first_child = first;
        self.last_child_exclusive = last_exclusive;
    }

    #[inline]
    pub fn children(&self) -> Range<BoxId> {
        self.first_child..self.last_child_exclusive
    }

    #[inline]
    pub fn num_children(&self) -> u64 {
        self.last_child_exclusive - self.first_child
    }

    pub(crate) fn set_cache(&mut self, signal: f64, error_squared: f64) {
        self.signal = signal;
        self.error_squared = error_squared;
    }
}

/// A node of the tree arena
#[derive(Debug, Clone)]
pub enum Node<R> {
    Leaf(LeafBox<R>),
    Internal(GridBox),
}

impl<R: Record> Node<R> {
    pub fn id(&self) -> BoxId {
        match self {
            Node::Leaf(leaf) => leaf.id(),
            Node::Internal(grid) => grid.id(),
        }
    }

    pub fn depth(&self) -> u32 {
        match self {
            Node::Leaf(leaf) => leaf.depth(),
            Node::Internal(grid) => grid.depth(),
        }
    }

    pub fn extents(&self) -> &BoxExtents {
        match self {
            Node::Leaf(leaf) => leaf.extents(),
            Node::Internal(grid) => grid.extents(),
        }
    }

    pub fn signal(&self) -> f64 {
        match self {
            Node::Leaf(leaf) => leaf.signal(),
            Node::Internal(grid) => grid.signal(),
        }
    }

    pub fn error_squared(&self) -> f64 {
        match self {
            Node::Leaf(leaf) => leaf.error_squared(),
            Node::Internal(grid) => grid.error_squared(),
        }
    }

    pub fn inverse_volume(&self) -> f64 {
        match self {
            Node::Leaf(leaf) => leaf.inverse_volume(),
            Node::Internal(grid) => grid.inverse_volume(),
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn as_leaf(&self) -> Option<&LeafBox<R>> {
        match self {
            Node::Leaf(leaf) => Some(leaf),
            Node::Internal(_) => None,
        }
    }

    pub fn as_leaf_mut(&mut self) -> Option<&mut LeafBox<R>> {
        match self {
            Node::Leaf(leaf) => Some(leaf),
            Node::Internal(_) => None,
        }
    }

    pub fn as_grid(&self) -> Option<&GridBox> {
        match self {
            Node::Leaf(_) => None,
            Node::Internal(grid) => Some(grid),
        }
    }
}
