//! Disk layer of the structured container file.
//!
//! A container holds named groups. Each group carries string attributes and
//! extensible typed arrays. Array rows live in fixed-size chunks appended at
//! the end of the file; the catalog describing them is rewritten on `flush`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::container_types::{crc32, ArrayInfo, Catalog, Element, GroupEntry, Superblock};
use crate::constants::SUPERBLOCK_SIZE;
use crate::errors::{BoxResult, BoxTreeError};

/// How a container was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// An open container file.
///
/// A container is owned by exactly one component at a time. Writes are only
/// durable after [`ContainerFile::flush`]; dropping a writable container with
/// unsaved catalog changes flushes it on a best-effort basis.
pub struct ContainerFile {
    file: File,
    path: PathBuf,
    mode: AccessMode,
    superblock: Superblock,
    catalog: Catalog,
    end_of_file: u64,
    catalog_dirty: bool,
}

impl ContainerFile {
    /// Create a new, empty container, truncating any existing file
    pub fn create(path: impl AsRef<Path>) -> BoxResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                BoxTreeError::FileAccess(format!(
                    "cannot create container '{}': {}",
                    path.display(),
                    e
                ))
            })?;

        let mut container = Self {
            file,
            path: path.to_path_buf(),
            mode: AccessMode::ReadWrite,
            superblock: Superblock::new(),
            catalog: Catalog::default(),
            end_of_file: SUPERBLOCK_SIZE,
            catalog_dirty: true,
        };
        container.file.set_len(SUPERBLOCK_SIZE)?;
        container.flush()?;
        log::debug!("Created container at {:?}", container.path);
        Ok(container)
    }

    /// Open an existing container
    pub fn open(path: impl AsRef<Path>, mode: AccessMode) -> BoxResult<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(mode == AccessMode::ReadWrite)
            .open(path)
            .map_err(|e| {
                BoxTreeError::FileAccess(format!(
                    "cannot open container '{}': {}",
                    path.display(),
                    e
                ))
            })?;

        let end_of_file = file.metadata()?.len();
        if end_of_file < SUPERBLOCK_SIZE {
            return Err(BoxTreeError::FormatMismatch(format!(
                "container '{}' is too small ({} bytes)",
                path.display(),
                end_of_file
            )));
        }

        let mut buffer = vec![0u8; SUPERBLOCK_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buffer)?;
        let superblock: Superblock =
            bincode::serde::decode_from_slice(&buffer, bincode::config::legacy())
                .map(|(sb, _)| sb)?;
        superblock.validate()?;

        if superblock.catalog_offset + superblock.catalog_len > end_of_file {
            return Err(BoxTreeError::FormatMismatch(format!(
                "catalog of '{}' extends past end of file",
                path.display()
            )));
        }
        let mut catalog_bytes = vec![0u8; superblock.catalog_len as usize];
        file.seek(SeekFrom::Start(superblock.catalog_offset))?;
        file.read_exact(&mut catalog_bytes)?;

        let checksum = crc32(&catalog_bytes);
        if checksum != superblock.catalog_checksum {
            return Err(BoxTreeError::FormatMismatch(format!(
                "catalog checksum mismatch - possible corruption (expected: {:x}, got: {:x})",
                superblock.catalog_checksum, checksum
            )));
        }
        let catalog = Catalog::decode(&catalog_bytes)?;

        log::debug!("Opened container at {:?} ({:?})", path, mode);
        Ok(Self {
            file,
            path: path.to_path_buf(),
            mode,
            superblock,
            catalog,
            end_of_file,
            catalog_dirty: false,
        })
    }

    /// Open the container read-write, creating it when it does not exist
    pub fn open_or_create(path: impl AsRef<Path>) -> BoxResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path, AccessMode::ReadWrite)
        } else {
            Self::create(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_writable(&self) -> bool {
        self.mode == AccessMode::ReadWrite
    }

    fn check_writable(&self) -> BoxResult<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(BoxTreeError::FileAccess(format!(
                "container '{}' is open read-only",
                self.path.display()
            )))
        }
    }

    // ------------------------------------------------------------------
    // Groups and attributes
    // ------------------------------------------------------------------

    pub fn has_group(&self, group: &str) -> bool {
        self.catalog.groups.contains_key(group)
    }

    /// Create a group if it does not exist yet
    pub fn require_group(&mut self, group: &str) -> BoxResult<()> {
        if !self.has_group(group) {
            self.check_writable()?;
            self.catalog
                .groups
                .insert(group.to_string(), GroupEntry::default());
            self.catalog_dirty = true;
        }
        Ok(())
    }

    fn group(&self, group: &str) -> BoxResult<&GroupEntry> {
        self.catalog.groups.get(group).ok_or_else(|| {
            BoxTreeError::FormatMismatch(format!(
                "group '{}' not found in '{}'",
                group,
                self.path.display()
            ))
        })
    }

    fn group_mut(&mut self, group: &str) -> BoxResult<&mut GroupEntry> {
        self.check_writable()?;
        let path = self.path.display().to_string();
        self.catalog.groups.get_mut(group).ok_or_else(|| {
            BoxTreeError::FormatMismatch(format!("group '{}' not found in '{}'", group, path))
        })
    }

    pub fn set_attribute(&mut self, group: &str, key: &str, value: impl Into<String>) -> BoxResult<()> {
        let value = value.into();
        let entry = self.group_mut(group)?;
        if entry.attributes.get(key) != Some(&value) {
            entry.attributes.insert(key.to_string(), value);
            self.catalog_dirty = true;
        }
        Ok(())
    }

    pub fn attribute(&self, group: &str, key: &str) -> Option<&str> {
        self.catalog
            .groups
            .get(group)
            .and_then(|g| g.attributes.get(key))
            .map(String::as_str)
    }

    /// Fetch an attribute that must exist
    pub fn required_attribute(&self, group: &str, key: &str) -> BoxResult<&str> {
        self.attribute(group, key).ok_or_else(|| {
            BoxTreeError::FormatMismatch(format!(
                "attribute '{}' missing from group '{}'",
                key, group
            ))
        })
    }

    // ------------------------------------------------------------------
    // Arrays
    // ------------------------------------------------------------------

    pub fn array_info(&self, group: &str, name: &str) -> Option<&ArrayInfo> {
        self.catalog
            .groups
            .get(group)
            .and_then(|g| g.arrays.get(name))
    }

    /// Number of rows of an array that must exist
    pub fn array_rows(&self, group: &str, name: &str) -> BoxResult<u64> {
        self.existing_array(group, name).map(|info| info.rows)
    }

    fn existing_array(&self, group: &str, name: &str) -> BoxResult<&ArrayInfo> {
        self.group(group)?.arrays.get(name).ok_or_else(|| {
            BoxTreeError::FormatMismatch(format!("array '{}/{}' not found", group, name))
        })
    }

    /// Create an extensible array, or check that an existing one has the
    /// requested element type and column count.
    pub fn require_array<T: Element>(
        &mut self,
        group: &str,
        name: &str,
        columns: u64,
        chunk_rows: u64,
    ) -> BoxResult<()> {
        if let Some(info) = self.array_info(group, name) {
            if info.dtype != T::DTYPE || info.columns != columns {
                return Err(BoxTreeError::FormatMismatch(format!(
                    "array '{}/{}' is {:?}[{}], expected {:?}[{}]",
                    group, name, info.dtype, info.columns, T::DTYPE, columns
                )));
            }
            return Ok(());
        }

        if columns == 0 || chunk_rows == 0 {
            return Err(BoxTreeError::InvalidOperation(format!(
                "array '{}/{}' needs at least one column and one row per chunk",
                group, name
            )));
        }
        let entry = self.group_mut(group)?;
        entry
            .arrays
            .insert(name.to_string(), ArrayInfo::new(T::DTYPE, columns, chunk_rows));
        self.catalog_dirty = true;
        Ok(())
    }

    fn typed_array<T: Element>(&self, group: &str, name: &str) -> BoxResult<ArrayInfo> {
        let info = self.existing_array(group, name)?;
        if info.dtype != T::DTYPE {
            return Err(BoxTreeError::FormatMismatch(format!(
                "array '{}/{}' holds {:?}, requested {:?}",
                group, name, info.dtype, T::DTYPE
            )));
        }
        Ok(info.clone())
    }

    /// Write whole rows starting at `start_row`, extending the array as needed.
    /// `data.len()` must be a multiple of the array's column count.
    pub fn write_rows<T: Element>(
        &mut self,
        group: &str,
        name: &str,
        start_row: u64,
        data: &[T],
    ) -> BoxResult<()> {
        self.check_writable()?;
        let mut info = self.typed_array::<T>(group, name)?;
        if data.len() as u64 % info.columns != 0 {
            return Err(BoxTreeError::InvalidOperation(format!(
                "{} values do not form whole rows of '{}/{}' ({} columns)",
                data.len(),
                group,
                name,
                info.columns
            )));
        }
        let num_rows = data.len() as u64 / info.columns;
        if num_rows == 0 {
            return Ok(());
        }
        let end_row = start_row + num_rows;

        while info.capacity() < end_row {
            let offset = self.end_of_file;
            let chunk_bytes = info.chunk_bytes();
            self.file.set_len(offset + chunk_bytes)?;
            self.end_of_file += chunk_bytes;
            info.chunks.push(offset);
        }

        let columns = info.columns as usize;
        let mut row = start_row;
        let mut cursor = 0usize;
        let mut bytes = Vec::new();
        while row < end_row {
            let chunk = (row / info.chunk_rows) as usize;
            let row_in_chunk = row % info.chunk_rows;
            let rows_here = (info.chunk_rows - row_in_chunk).min(end_row - row);
            let values = rows_here as usize * columns;

            bytes.clear();
            bytes.reserve(values * info.dtype.size());
            for &value in &data[cursor..cursor + values] {
                value.write_le(&mut bytes);
            }
            let offset = info.chunks[chunk] + row_in_chunk * info.row_bytes();
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&bytes)?;

            row += rows_here;
            cursor += values;
        }

        info.rows = info.rows.max(end_row);
        let entry = self.group_mut(group)?;
        entry.arrays.insert(name.to_string(), info);
        self.catalog_dirty = true;
        Ok(())
    }

    /// Read `num_rows` whole rows starting at `start_row`
    pub fn read_rows<T: Element>(
        &mut self,
        group: &str,
        name: &str,
        start_row: u64,
        num_rows: u64,
    ) -> BoxResult<Vec<T>> {
        let info = self.typed_array::<T>(group, name)?;
        let end_row = start_row + num_rows;
        if end_row > info.rows {
            return Err(BoxTreeError::FormatMismatch(format!(
                "read of rows {}..{} from '{}/{}' exceeds its {} rows",
                start_row, end_row, group, name, info.rows
            )));
        }

        let columns = info.columns as usize;
        let width = info.dtype.size();
        let mut out = Vec::with_capacity(num_rows as usize * columns);
        let mut bytes = Vec::new();
        let mut row = start_row;
        while row < end_row {
            let chunk = (row / info.chunk_rows) as usize;
            let row_in_chunk = row % info.chunk_rows;
            let rows_here = (info.chunk_rows - row_in_chunk).min(end_row - row);

            bytes.resize((rows_here * info.row_bytes()) as usize, 0);
            let offset = info.chunks[chunk] + row_in_chunk * info.row_bytes();
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut bytes)?;
            out.extend(bytes.chunks_exact(width).map(T::read_le));

            row += rows_here;
        }
        Ok(out)
    }

    /// Read every row of an array
    pub fn read_all<T: Element>(&mut self, group: &str, name: &str) -> BoxResult<Vec<T>> {
        let rows = self.array_rows(group, name)?;
        self.read_rows(group, name, 0, rows)
    }

    // ------------------------------------------------------------------
    // Durability
    // ------------------------------------------------------------------

    /// Write the catalog and superblock if they changed, then sync
    pub fn flush(&mut self) -> BoxResult<()> {
        if !self.is_writable() {
            return Ok(());
        }
        if self.catalog_dirty {
            let bytes = self.catalog.encode()?;
            let len = bytes.len() as u64;

            if self.superblock.catalog_offset == 0 || len > self.superblock.catalog_capacity {
                let capacity = (len * 2).max(4096);
                self.superblock.catalog_offset = self.end_of_file;
                self.superblock.catalog_capacity = capacity;
                self.end_of_file += capacity;
                self.file.set_len(self.end_of_file)?;
            }

            self.file
                .seek(SeekFrom::Start(self.superblock.catalog_offset))?;
            self.file.write_all(&bytes)?;

            self.superblock.catalog_len = len;
            self.superblock.catalog_checksum = crc32(&bytes);
            let mut header =
                bincode::serde::encode_to_vec(&self.superblock, bincode::config::legacy())?;
            header.resize(SUPERBLOCK_SIZE as usize, 0);
            self.file.seek(SeekFrom::Start(0))?;
            self.file.write_all(&header)?;
            self.catalog_dirty = false;
        }
        self.file.sync_data()?;
        Ok(())
    }

    /// Flush and release the file handle
    pub fn close(mut self) -> BoxResult<()> {
        self.flush()
    }
}

impl Drop for ContainerFile {
    fn drop(&mut self) {
        if self.is_writable() && self.catalog_dirty {
            if let Err(e) = self.flush() {
                log::warn!("Failed to flush container {:?} on drop: {}", self.path, e);
            }
        }
    }
}
