//! # mdbox - Adaptive Box Tree for Multidimensional Events
//!
//! This crate stores an unbounded number of point-like records (signal,
//! squared error, N-dimensional coordinates and optional provenance) in a
//! recursively splitting tree of boxes, and pages leaf contents to and from
//! a single container file while the tree is built, merged or grown.
//!
//! ## Features
//!
//! - **Adaptive Splitting**: Leaves over the split threshold are divided into
//!   `Π branching` equal sub-boxes, up to a maximum depth
//! - **Arena Layout**: Nodes indexed by dense IDs; children form contiguous ID ranges
//! - **Parallel Splitter**: Over-threshold leaves split on a scoped worker pool
//! - **Disk Paging**: Write-back cache with a byte budget and best-fit free-space reuse
//! - **Incremental Saves**: Only dirty leaves rewritten; arrays extended in place
//! - **Merging**: Trees combined with unique run indices
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mdbox::{save_tree, load_tree, BoxController, BoxExtents, BoxTree, LeanRecord, LoadOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = BoxController::builder(2)
//!     .branching(4)
//!     .split_threshold(100)
//!     .build()?;
//! let mut tree = BoxTree::new(controller, BoxExtents::uniform(2, 0.0, 1.0))?;
//!
//! tree.add_record(LeanRecord::new(1.0, 1.0, &[0.25, 0.75]))?;
//! tree.split_all_if_needed()?;
//!
//! save_tree(&mut tree, "events.mdbox", false)?;
//! let loaded = load_tree::<LeanRecord>("events.mdbox", LoadOptions::default().nd(2))?;
//! assert_eq!(loaded.total_records, 1);
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub mod container;
pub mod controller;
pub mod disk_buffer;
pub mod errors;
pub mod extents;
pub mod flat_tree;
pub mod free_space;
pub mod merge;
pub mod node;
pub mod persistence;
pub mod record;
mod record_store;
pub mod run_info;
pub mod splitter;
pub mod tree;

pub use controller::{BoxController, BoxControllerBuilder, ControllerDescriptor};
pub use disk_buffer::{DiskBuffer, DiskBufferStats};
pub use errors::{BoxResult, BoxTreeError};
pub use extents::{BoxExtents, Bounds};
pub use flat_tree::{BoxStructure, BoxType};
pub use free_space::{FreeBlock, FreeSpaceMap};
pub use merge::{merge_files, merge_trees, MergeOptions};
pub use node::{BoxId, FileRange, GridBox, LeafBox, Node};
pub use persistence::{load_tree, save_tree, LoadOptions, LoadedTree, SaveReport};
pub use record::{FullRecord, LeanRecord, Record, RecordKind};
pub use run_info::RunInfo;
pub use tree::{BoxTree, TreeStats};
