//! Constants for the box tree and its container file.

/// Default number of records a leaf may hold before it is split
pub const DEFAULT_SPLIT_THRESHOLD: u64 = 1000;

/// Default maximum depth of the tree (the root is depth 0)
pub const DEFAULT_MAX_DEPTH: u32 = 20;

/// Default number of subdivisions per dimension when a leaf splits
pub const DEFAULT_BRANCHING: u32 = 2;

/// Largest supported dimensionality
pub const MAX_DIMENSIONS: usize = 9;

/// Default write-back budget of the disk buffer (64MB of record payload)
pub const DEFAULT_WRITE_BUFFER_BYTES: u64 = 64 * 1024 * 1024;

/// Volumes below this are treated as degenerate; their inverse volume is 1
pub const VOLUME_EPSILON: f64 = 1e-30;

/// Relative tolerance when comparing a stored inverse volume to a recomputed one
pub const INVERSE_VOLUME_TOLERANCE: f64 = 1e-5;

/// Magic number for file format identification
pub const MAGIC: u32 = 0x5842_444D; // "MDBX"

/// File format version
pub const VERSION: u32 = 1;

/// Size of the superblock at offset 0
pub const SUPERBLOCK_SIZE: u64 = 512;

/// Rows per chunk for box structure arrays
pub const BOX_CHUNK_ROWS: u64 = 4096;

/// Rows per chunk for record payload arrays
pub const RECORD_CHUNK_ROWS: u64 = 16384;

// Group, attribute and array names of the container layout.

pub const WORKSPACE_GROUP: &str = "event_workspace";
pub const BOX_STRUCTURE_GROUP: &str = "event_workspace/box_structure";
pub const EVENT_DATA_GROUP: &str = "event_workspace/event_data";
pub const EXPERIMENT_INFO_GROUP: &str = "event_workspace/experiment_info";

pub const ATTR_RECORD_TYPE: &str = "record_type";
pub const ATTR_ND: &str = "nd";
pub const ATTR_BOX_CONTROLLER: &str = "box_controller";
pub const ATTR_FREE_SPACE_COUNT: &str = "free_space_count";
pub const ATTR_RUN_COUNT: &str = "run_count";

pub const BOX_TYPE: &str = "box_type";
pub const DEPTH: &str = "depth";
pub const INVERSE_VOLUME: &str = "inverse_volume";
pub const EXTENTS: &str = "extents";
pub const BOX_CHILDREN: &str = "box_children";
pub const BOX_SIGNAL_ERRORSQUARED: &str = "box_signal_errorsquared";
pub const BOX_EVENT_INDEX: &str = "box_event_index";

pub const SIGNAL: &str = "signal";
pub const ERROR_SQUARED: &str = "error_squared";
pub const COORDINATES: &str = "coordinates";
pub const RUN_INDEX: &str = "run_index";
pub const DETECTOR_ID: &str = "detector_id";
pub const FREE_SPACE_BLOCKS: &str = "free_space_blocks";
