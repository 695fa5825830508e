//! Structured container file.
//!
//! A single binary file organised as named groups, each carrying string
//! attributes and extensible typed arrays:
//! - Superblock at offset 0 pointing to a checksummed catalog
//! - Array rows in fixed-size chunks that never move once allocated
//! - Arrays grow by appending chunks and are never shrunk

pub mod container_storage;
pub mod container_types;

pub use container_storage::{AccessMode, ContainerFile};
pub use container_types::{ArrayInfo, DataType, Element};
