//! Core types of the structured container file.
//!
//! This module defines:
//! - The superblock stored at offset 0
//! - The catalog describing groups, attributes and arrays
//! - Element types that can be stored in typed arrays

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::{MAGIC, VERSION};
use crate::errors::{BoxResult, BoxTreeError};

// ============================================================================
// Element Types
// ============================================================================

/// Scalar type of a typed array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    I32,
    U16,
    U64,
    F32,
    F64,
}

impl DataType {
    /// Width of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            DataType::U16 => 2,
            DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::F64 => 8,
        }
    }
}

/// A scalar that can be stored little-endian in a typed array.
pub trait Element: Copy + Default + Send + Sync + 'static {
    const DTYPE: DataType;

    fn write_le(self, out: &mut Vec<u8>);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($t:ty, $dtype:expr) => {
        impl Element for $t {
            const DTYPE: DataType = $dtype;

            #[inline]
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                <$t>::from_le_bytes(buf)
            }
        }
    };
}

impl_element!(i32, DataType::I32);
impl_element!(u16, DataType::U16);
impl_element!(u64, DataType::U64);
impl_element!(f32, DataType::F32);
impl_element!(f64, DataType::F64);

// ============================================================================
// Catalog
// ============================================================================

/// Layout of one extensible typed array.
///
/// Rows are stored in fixed-size chunks. A chunk is placed at the end of the
/// file when first needed and never moves afterwards, so rows can always be
/// overwritten in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayInfo {
    pub dtype: DataType,
    pub columns: u64,
    pub rows: u64,
    pub chunk_rows: u64,
    /// File offset of each allocated chunk
    pub chunks: Vec<u64>,
}

impl ArrayInfo {
    pub fn new(dtype: DataType, columns: u64, chunk_rows: u64) -> Self {
        Self {
            dtype,
            columns,
            rows: 0,
            chunk_rows,
            chunks: Vec::new(),
        }
    }

    /// Bytes occupied by one row
    pub fn row_bytes(&self) -> u64 {
        self.columns * self.dtype.size() as u64
    }

    /// Bytes occupied by one chunk
    pub fn chunk_bytes(&self) -> u64 {
        self.chunk_rows * self.row_bytes()
    }

    /// Number of rows the allocated chunks can hold
    pub fn capacity(&self) -> u64 {
        self.chunks.len() as u64 * self.chunk_rows
    }
}

/// A named group holding string attributes and typed arrays
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub attributes: BTreeMap<String, String>,
    pub arrays: BTreeMap<String, ArrayInfo>,
}

/// Everything the container knows about its contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub groups: BTreeMap<String, GroupEntry>,
}

impl Catalog {
    pub fn encode(&self) -> BoxResult<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::legacy())?)
    }

    pub fn decode(bytes: &[u8]) -> BoxResult<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
            .map(|(catalog, _)| catalog)
            .map_err(BoxTreeError::from)
    }
}

// ============================================================================
// Superblock
// ============================================================================

/// Fixed-size block at the start of the container file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: u32,
    pub version: u32,
    pub catalog_offset: u64,
    pub catalog_len: u64,
    pub catalog_capacity: u64,
    pub catalog_checksum: u32,
}

impl Superblock {
    pub fn new() -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            catalog_offset: 0,
            catalog_len: 0,
            catalog_capacity: 0,
            catalog_checksum: 0,
        }
    }

    pub fn validate(&self) -> BoxResult<()> {
        if self.magic != MAGIC {
            return Err(BoxTreeError::FormatMismatch(
                "Invalid container format (bad magic)".into(),
            ));
        }
        if self.version != VERSION {
            return Err(BoxTreeError::FormatMismatch(format!(
                "Unsupported container version {} (expected {})",
                self.version, VERSION
            )));
        }
        Ok(())
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC32-MPEG2 over the given bytes
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    const POLY: u32 = 0x04C11DB7;

    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x80000000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }

    crc ^ 0xFFFFFFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_le_encoding() {
        let mut buf = Vec::new();
        (-7i32).write_le(&mut buf);
        1.5f64.write_le(&mut buf);
        42u16.write_le(&mut buf);
        assert_eq!(buf.len(), 4 + 8 + 2);
        assert_eq!(i32::read_le(&buf[0..4]), -7);
        assert_eq!(f64::read_le(&buf[4..12]), 1.5);
        assert_eq!(u16::read_le(&buf[12..14]), 42);
    }

    #[test]
    fn test_array_info_sizes() {
        let mut info = ArrayInfo::new(DataType::F64, 4, 100);
        assert_eq!(info.row_bytes(), 32);
        assert_eq!(info.chunk_bytes(), 3200);
        assert_eq!(info.capacity(), 0);
        info.chunks.push(512);
        assert_eq!(info.capacity(), 100);
    }

    #[test]
    fn test_catalog_encode_decode() {
        let mut catalog = Catalog::default();
        let group = catalog.groups.entry("g".to_string()).or_default();
        group.attributes.insert("nd".into(), "3".into());
        group
            .arrays
            .insert("a".into(), ArrayInfo::new(DataType::U64, 2, 8));

        let bytes = catalog.encode().unwrap();
        assert_eq!(Catalog::decode(&bytes).unwrap(), catalog);
    }

    #[test]
    fn test_superblock_validate() {
        assert!(Superblock::new().validate().is_ok());

        let mut bad = Superblock::new();
        bad.magic = 1;
        assert!(matches!(bad.validate(), Err(BoxTreeError::FormatMismatch(_))));

        let mut future = Superblock::new();
        future.version = VERSION + 1;
        assert!(future.validate().is_err());
    }

    #[test]
    fn test_crc32_detects_change() {
        let a = crc32(b"box_structure");
        let b = crc32(b"box_structurf");
        assert_ne!(a, b);
        assert_eq!(a, crc32(b"box_structure"));
    }
}
