//! Tree-wide policy and allocation state shared by every node of a tree.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::constants::{
    DEFAULT_BRANCHING, DEFAULT_MAX_DEPTH, DEFAULT_SPLIT_THRESHOLD, MAX_DIMENSIONS,
};
use crate::disk_buffer::DiskBuffer;
use crate::errors::{BoxResult, BoxTreeError};

/// Shared configuration and counters of one box tree.
///
/// A cloneable, thread-safe holder using the PIMPL pattern with
/// `Arc<BoxControllerInner>`. Clones share the same counters, so the
/// splitter's worker tasks can allocate box IDs concurrently.
///
/// Characteristics:
/// - Fixed after construction: dimensionality and branching factors
/// - Atomic: split threshold, max depth, ID allocator, box and record counters
/// - Optional page cache (`DiskBuffer`) when the tree is file-backed
///
/// Usage: Create via [`BoxControllerBuilder`], or restore from the textual
/// descriptor stored in a container with [`BoxController::from_descriptor`].
#[derive(Clone)]
pub struct BoxController {
    inner: Arc<BoxControllerInner>,
}

impl BoxController {
    /// Starts building a controller for `nd` dimensions
    pub fn builder(nd: usize) -> BoxControllerBuilder {
        BoxControllerBuilder::new(nd)
    }

    #[inline]
    pub fn nd(&self) -> usize {
        self.inner.branching.len()
    }

    /// Number of equal intervals a split creates along `dim`
    #[inline]
    pub fn branching_factor(&self, dim: usize) -> u32 {
        self.inner.branching[dim]
    }

    #[inline]
    pub fn branching(&self) -> &[u32] {
        &self.inner.branching
    }

    /// Number of children one split creates: the product of all branching factors
    #[inline]
    pub fn num_split_children(&self) -> u64 {
        self.inner.branching.iter().map(|&b| b as u64).product()
    }

    #[inline]
    pub fn split_threshold(&self) -> u64 {
        self.inner.split_threshold.load(Ordering::Relaxed)
    }

    pub fn set_split_threshold(&self, threshold: u64) {
        self.inner
            .split_threshold
            .store(threshold.max(1), Ordering::Relaxed);
    }

    #[inline]
    pub fn max_depth(&self) -> u32 {
        self.inner.max_depth.load(Ordering::Relaxed)
    }

    pub fn set_max_depth(&self, max_depth: u32) {
        self.inner.max_depth.store(max_depth, Ordering::Relaxed);
    }

    /// Reserves `count` contiguous box IDs and returns the first.
    ///
    /// Each call gets its own block even when called from several threads.
    #[inline]
    pub fn allocate_ids(&self, count: u64) -> u64 {
        self.inner.next_id.fetch_add(count, Ordering::SeqCst)
    }

    /// The ID the next allocation will start at
    #[inline]
    pub fn next_id(&self) -> u64 {
        self.inner.next_id.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn increment_box_count(&self, count: u64) {
        self.inner.total_boxes.fetch_add(count, Ordering::SeqCst);
    }

    #[inline]
    pub fn total_boxes(&self) -> u64 {
        self.inner.total_boxes.load(Ordering::SeqCst)
    }

    /// Resets the allocator and box count to match a restored tree
    pub fn reset_numbering(&self, next_id: u64, total_boxes: u64) {
        self.inner.next_id.store(next_id, Ordering::SeqCst);
        self.inner.total_boxes.store(total_boxes, Ordering::SeqCst);
    }

    /// Records appended since the last split pass
    #[inline]
    pub fn records_added(&self) -> u64 {
        self.inner.records_added.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn add_records_count(&self, count: u64) {
        self.inner.records_added.fetch_add(count, Ordering::Relaxed);
    }

    pub fn reset_records_added(&self) {
        self.inner.records_added.store(0, Ordering::Relaxed);
    }

    /// Whether enough records arrived since the last split pass to make one
    /// worthwhile.
    ///
    /// A pass is due once at least one threshold's worth of records has been
    /// added and the additions amount to half a threshold per leaf.
    pub fn should_split(&self, num_leaves: u64) -> bool {
        let added = self.records_added();
        let threshold = self.split_threshold();
        added >= threshold && added.saturating_mul(2) >= threshold.saturating_mul(num_leaves)
    }

    /// Attaches the page cache of a file-backed tree
    pub fn set_file_backing(&self, buffer: Arc<DiskBuffer>) {
        *self.inner.page_cache.write() = Some(buffer);
    }

    /// Detaches the page cache, returning it
    pub fn clear_file_backing(&self) -> Option<Arc<DiskBuffer>> {
        self.inner.page_cache.write().take()
    }

    pub fn page_cache(&self) -> Option<Arc<DiskBuffer>> {
        self.inner.page_cache.read().clone()
    }

    pub fn is_file_backed(&self) -> bool {
        self.inner.page_cache.read().is_some()
    }

    /// A new controller with the same policy but fresh counters and no backing
    pub fn clone_policy(&self) -> BoxController {
        BoxController {
            inner: Arc::new(BoxControllerInner::new(
                self.inner.branching.clone(),
                self.split_threshold(),
                self.max_depth(),
            )),
        }
    }

    /// JSON descriptor stored in the `box_controller` attribute
    pub fn to_descriptor(&self) -> BoxResult<String> {
        let descriptor = ControllerDescriptor {
            nd: self.nd(),
            branching: self.inner.branching.to_vec(),
            split_threshold: self.split_threshold(),
            max_depth: self.max_depth(),
            max_id: self.next_id(),
            num_boxes: self.total_boxes(),
        };
        Ok(serde_json::to_string(&descriptor)?)
    }

    /// Restores a controller from its descriptor, counters included
    pub fn from_descriptor(text: &str) -> BoxResult<BoxController> {
        let descriptor = ControllerDescriptor::parse(text)?;
        let controller = BoxControllerBuilder::new(descriptor.nd)
            .branching_per_dim(descriptor.branching)
            .split_threshold(descriptor.split_threshold)
            .max_depth(descriptor.max_depth)
            .build()?;
        controller.reset_numbering(descriptor.max_id, descriptor.num_boxes);
        Ok(controller)
    }
}

impl std::fmt::Debug for BoxController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxController")
            .field("branching", &self.inner.branching)
            .field("split_threshold", &self.split_threshold())
            .field("max_depth", &self.max_depth())
            .field("next_id", &self.next_id())
            .field("total_boxes", &self.total_boxes())
            .field("file_backed", &self.is_file_backed())
            .finish()
    }
}

struct BoxControllerInner {
    branching: SmallVec<[u32; 4]>,
    split_threshold: AtomicU64,
    max_depth: AtomicU32,
    next_id: AtomicU64,
    total_boxes: AtomicU64,
    records_added: AtomicU64,
    page_cache: RwLock<Option<Arc<DiskBuffer>>>,
}

impl BoxControllerInner {
    fn new(branching: SmallVec<[u32; 4]>, split_threshold: u64, max_depth: u32) -> Self {
        Self {
            branching,
            split_threshold: AtomicU64::new(split_threshold),
            max_depth: AtomicU32::new(max_depth),
            next_id: AtomicU64::new(0),
            total_boxes: AtomicU64::new(0),
            records_added: AtomicU64::new(0),
            page_cache: RwLock::new(None),
        }
    }
}

/// Serialized form of a controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerDescriptor {
    pub nd: usize,
    pub branching: Vec<u32>,
    pub split_threshold: u64,
    pub max_depth: u32,
    pub max_id: u64,
    pub num_boxes: u64,
}

impl ControllerDescriptor {
    pub fn parse(text: &str) -> BoxResult<Self> {
        serde_json::from_str(text).map_err(|e| {
            BoxTreeError::FormatMismatch(format!("unreadable box controller descriptor: {}", e))
        })
    }
}

/// Fluent builder for [`BoxController`].
pub struct BoxControllerBuilder {
    nd: usize,
    branching: Vec<u32>,
    split_threshold: u64,
    max_depth: u32,
}

impl BoxControllerBuilder {
    /// Starts from the default policy for `nd` dimensions:
    /// - Branching: 2 in every dimension
    /// - Split threshold: 1000 records
    /// - Max depth: 20
    pub fn new(nd: usize) -> Self {
        Self {
            nd,
            branching: vec![DEFAULT_BRANCHING; nd],
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Same branching factor in every dimension
    pub fn branching(mut self, branching: u32) -> Self {
        self.branching = vec![branching; self.nd];
        self
    }

    pub fn branching_per_dim(mut self, branching: Vec<u32>) -> Self {
        self.branching = branching;
        self
    }

    pub fn split_threshold(mut self, split_threshold: u64) -> Self {
        self.split_threshold = split_threshold;
        self
    }

    pub fn max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn build(self) -> BoxResult<BoxController> {
        if self.nd == 0 || self.nd > MAX_DIMENSIONS {
            return Err(BoxTreeError::InvalidOperation(format!(
                "dimensionality must be between 1 and {}, got {}",
                MAX_DIMENSIONS, self.nd
            )));
        }
        if self.branching.len() != self.nd {
            return Err(BoxTreeError::InvalidOperation(format!(
                "{} branching factors given for {} dimensions",
                self.branching.len(),
                self.nd
            )));
        }
        if let Some(&b) = self.branching.iter().find(|&&b| b < 2) {
            return Err(BoxTreeError::InvalidOperation(format!(
                "branching factor must be at least 2, got {}",
                b
            )));
        }
        if self.split_threshold == 0 {
            return Err(BoxTreeError::InvalidOperation(
                "split threshold must be at least 1".into(),
            ));
        }

        Ok(BoxController {
            inner: Arc::new(BoxControllerInner::new(
                SmallVec::from_vec(self.branching),
                self.split_threshold,
                self.max_depth,
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_builder_defaults() {
        let controller = BoxController::builder(3).build().unwrap();
        assert_eq!(controller.nd(), 3);
        assert_eq!(controller.branching(), &[2, 2, 2]);
        assert_eq!(controller.num_split_children(), 8);
        assert_eq!(controller.split_threshold(), DEFAULT_SPLIT_THRESHOLD);
        assert_eq!(controller.max_depth(), DEFAULT_MAX_DEPTH);
        assert!(!controller.is_file_backed());
    }

    #[test]
    fn test_builder_validation() {
        assert!(BoxController::builder(0).build().is_err());
        assert!(BoxController::builder(MAX_DIMENSIONS + 1).build().is_err());
        assert!(BoxController::builder(2).branching(1).build().is_err());
        assert!(BoxController::builder(2)
            .branching_per_dim(vec![2, 3, 4])
            .build()
            .is_err());
        assert!(BoxController::builder(2).split_threshold(0).build().is_err());
    }

    #[test]
    fn test_allocate_ids_contiguous_across_threads() {
        let controller = BoxController::builder(2).build().unwrap();
        let firsts: Vec<u64> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let c = controller.clone();
                    s.spawn(move || c.allocate_ids(4))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut sorted = firsts.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..8).map(|i| i * 4).collect::<Vec<_>>());
        assert_eq!(controller.next_id(), 32);
    }

    #[test]
    fn test_descriptor_round_trip() {
        let controller = BoxController::builder(2)
            .branching_per_dim(vec![3, 5])
            .split_threshold(250)
            .max_depth(7)
            .build()
            .unwrap();
        controller.allocate_ids(16);
        controller.increment_box_count(16);

        let text = controller.to_descriptor().unwrap();
        let restored = BoxController::from_descriptor(&text).unwrap();
        assert_eq!(restored.branching(), &[3, 5]);
        assert_eq!(restored.split_threshold(), 250);
        assert_eq!(restored.max_depth(), 7);
        assert_eq!(restored.next_id(), 16);
        assert_eq!(restored.total_boxes(), 16);

        assert!(matches!(
            BoxController::from_descriptor("{not json"),
            Err(BoxTreeError::FormatMismatch(_))
        ));
    }

    #[test]
    fn test_should_split_heuristic() {
        let controller = BoxController::builder(1).split_threshold(100).build().unwrap();
        controller.add_records_count(99);
        assert!(!controller.should_split(1));
        controller.add_records_count(1);
        assert!(controller.should_split(1));
        assert!(controller.should_split(2));
        assert!(!controller.should_split(3));
        controller.reset_records_added();
        assert!(!controller.should_split(1));
    }

    #[test]
    fn test_clone_policy_has_fresh_counters() {
        let controller = BoxController::builder(2).branching(4).build().unwrap();
        controller.allocate_ids(10);
        let copy = controller.clone_policy();
        assert_eq!(copy.branching(), &[4, 4]);
        assert_eq!(copy.next_id(), 0);
        assert_eq!(controller.clone().next_id(), 10);
    }
}
