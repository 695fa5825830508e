//! Write-back page cache for leaf record blocks.
//!
//! The buffer owns the open container of a file-backed tree. Leaves with
//! unsaved changes are queued here in FIFO order together with their payload
//! size. When the queued bytes exceed the write budget, the oldest entries
//! are handed back to the tree for writing and eviction from memory.
//!
//! Record space is managed here as well: a write takes the smallest free
//! block that fits, or appends at the end of the record area. The leaf's old
//! range is only returned to the free pool once the new write succeeded, so
//! a failed write never damages previously flushed data.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::container::ContainerFile;
use crate::errors::{BoxResult, BoxTreeError};
use crate::free_space::{FreeBlock, FreeSpaceMap};
use crate::node::{BoxId, FileRange};
use crate::record::Record;
use crate::record_store;

/// Statistics about disk buffer activity
#[derive(Debug, Clone, Default)]
pub struct DiskBufferStats {
    pub writes: u64,
    pub reads: u64,
    pub records_written: u64,
    pub records_read: u64,
    pub queued_leaves: u64,
    pub queued_bytes: u64,
    pub free_blocks: u64,
    pub free_records: u64,
    pub record_area_length: u64,
}

struct DiskBufferStatistics {
    writes: AtomicU64,
    reads: AtomicU64,
    records_written: AtomicU64,
    records_read: AtomicU64,
}

impl DiskBufferStatistics {
    fn new() -> Self {
        Self {
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            records_read: AtomicU64::new(0),
        }
    }
}

struct DiskBufferInner {
    container: Option<ContainerFile>,
    /// Queue order (front = oldest)
    write_queue: VecDeque<BoxId>,
    /// Payload size of each queued leaf
    queued: HashMap<BoxId, u64>,
    queued_bytes: u64,
    write_buffer_size: u64,
    free_space: FreeSpaceMap,
    /// End of the record area, in records
    record_area_length: u64,
}

impl DiskBufferInner {
    fn container(&mut self) -> BoxResult<&mut ContainerFile> {
        self.container
            .as_mut()
            .ok_or_else(|| BoxTreeError::InvalidOperation("disk buffer is closed".into()))
    }

    /// Reserve `count` records, preferring free space
    fn reserve(&mut self, count: u64) -> FileRange {
        match self.free_space.allocate(count) {
            Some(offset) => FileRange::new(offset, count),
            None => {
                let offset = self.record_area_length;
                self.record_area_length += count;
                FileRange::new(offset, count)
            }
        }
    }

    /// Undo a reservation whose write failed
    fn unreserve(&mut self, range: FileRange) -> BoxResult<()> {
        if range.offset + range.count == self.record_area_length {
            self.record_area_length = range.offset;
            Ok(())
        } else {
            self.free_space.release(range.offset, range.count)
        }
    }

    fn dequeue(&mut self, id: BoxId) {
        if let Some(bytes) = self.queued.remove(&id) {
            self.queued_bytes -= bytes;
            self.write_queue.retain(|&queued| queued != id);
        }
    }
}

/// Write-back cache and record-space allocator of a file-backed tree.
///
/// All mutable state sits behind one mutex, so the buffer can be shared by
/// every task working on the tree.
pub struct DiskBuffer {
    inner: Mutex<DiskBufferInner>,
    stats: DiskBufferStatistics,
    nd: usize,
    path: PathBuf,
}

impl DiskBuffer {
    /// Take ownership of an open container whose record arrays exist
    pub(crate) fn new(
        container: ContainerFile,
        nd: usize,
        free_blocks: &[FreeBlock],
        write_buffer_size: u64,
    ) -> BoxResult<Self> {
        let record_area_length = record_store::record_area_length(&container);
        let free_space = FreeSpaceMap::from_blocks(free_blocks)?;
        if let Some(&(offset, length)) = free_blocks.last() {
            if offset + length > record_area_length {
                return Err(BoxTreeError::FormatMismatch(format!(
                    "free block ({}, {}) lies past the record area ({} records)",
                    offset, length, record_area_length
                )));
            }
        }

        let path = container.path().to_path_buf();
        Ok(Self {
            inner: Mutex::new(DiskBufferInner {
                container: Some(container),
                write_queue: VecDeque::new(),
                queued: HashMap::new(),
                queued_bytes: 0,
                write_buffer_size,
                free_space,
                record_area_length,
            }),
            stats: DiskBufferStatistics::new(),
            nd,
            path,
        })
    }

    /// Path of the backing container
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn nd(&self) -> usize {
        self.nd
    }

    pub fn set_write_buffer_size(&self, bytes: u64) {
        self.inner.lock().write_buffer_size = bytes;
    }

    pub fn write_buffer_size(&self) -> u64 {
        self.inner.lock().write_buffer_size
    }

    /// Queue a leaf that has unsaved changes.
    ///
    /// Queuing an already queued leaf updates its size but keeps its place.
    /// Returns the leaves that must be written and evicted now to bring the
    /// queue back within the write budget, oldest first.
    pub fn to_write(&self, id: BoxId, bytes: u64) -> Vec<BoxId> {
        let mut inner = self.inner.lock();
        match inner.queued.insert(id, bytes) {
            Some(previous) => {
                inner.queued_bytes = inner.queued_bytes - previous + bytes;
            }
            None => {
                inner.write_queue.push_back(id);
                inner.queued_bytes += bytes;
            }
        }

        let mut evicted = Vec::new();
        while inner.queued_bytes > inner.write_buffer_size {
            let Some(oldest) = inner.write_queue.pop_front() else {
                break;
            };
            if let Some(size) = inner.queued.remove(&oldest) {
                inner.queued_bytes -= size;
            }
            evicted.push(oldest);
        }
        evicted
    }

    /// Drop a leaf from the queue (it was written or no longer exists)
    pub fn remove_from_queue(&self, id: BoxId) {
        self.inner.lock().dequeue(id);
    }

    /// Empty the queue, returning its leaves oldest first
    pub fn drain_queue(&self) -> Vec<BoxId> {
        let mut inner = self.inner.lock();
        inner.queued.clear();
        inner.queued_bytes = 0;
        inner.write_queue.drain(..).collect()
    }

    pub fn is_queued(&self, id: BoxId) -> bool {
        self.inner.lock().queued.contains_key(&id)
    }

    /// Write a leaf's full record block.
    ///
    /// Space is reserved without touching `old`; `old` is freed only after
    /// the write succeeded. An empty block frees `old` and returns `None`.
    pub fn write_records<R: Record>(
        &self,
        old: Option<FileRange>,
        records: &[R],
    ) -> BoxResult<Option<FileRange>> {
        let mut inner = self.inner.lock();
        inner.container()?;

        if records.is_empty() {
            if let Some(old) = old {
                inner.free_space.release(old.offset, old.count)?;
            }
            return Ok(None);
        }

        let range = inner.reserve(records.len() as u64);
        let nd = self.nd;
        let result = inner
            .container()
            .and_then(|c| record_store::write_records(c, nd, range.offset, records));
        if let Err(e) = result {
            log::warn!(
                "Write of {} records at {} failed, releasing reservation: {}",
                range.count,
                range.offset,
                e
            );
            inner.unreserve(range)?;
            return Err(e);
        }

        if let Some(old) = old {
            inner.free_space.release(old.offset, old.count)?;
        }
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .records_written
            .fetch_add(range.count, Ordering::Relaxed);
        Ok(Some(range))
    }

    /// Read a leaf's record block
    pub fn read_records<R: Record>(&self, range: FileRange) -> BoxResult<Vec<R>> {
        let mut inner = self.inner.lock();
        let nd = self.nd;
        let records = record_store::read_records(inner.container()?, nd, range.offset, range.count)?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .records_read
            .fetch_add(range.count, Ordering::Relaxed);
        Ok(records)
    }

    /// Return a range whose leaf no longer exists to the free pool
    pub fn release(&self, range: FileRange) -> BoxResult<()> {
        self.inner.lock().free_space.release(range.offset, range.count)
    }

    /// Current free blocks ordered by offset
    pub fn free_space_blocks(&self) -> Vec<FreeBlock> {
        self.inner.lock().free_space.blocks()
    }

    /// End of the record area, in records
    pub fn record_area_length(&self) -> u64 {
        self.inner.lock().record_area_length
    }

    /// Run `f` against the owned container
    pub fn with_container<T>(
        &self,
        f: impl FnOnce(&mut ContainerFile) -> BoxResult<T>,
    ) -> BoxResult<T> {
        let mut inner = self.inner.lock();
        f(inner.container()?)
    }

    /// Persist the free-space table and flush the container.
    ///
    /// Leaves still queued are not written here; the tree drains the queue
    /// first (see `BoxTree::flush_cache`).
    pub fn sync(&self) -> BoxResult<()> {
        let mut inner = self.inner.lock();
        let blocks = inner.free_space.blocks();
        let container = inner.container()?;
        record_store::write_free_space(container, &blocks)?;
        container.flush()
    }

    /// Flush and hand the container back to the caller
    pub fn take_container(&self) -> BoxResult<ContainerFile> {
        self.sync()?;
        let mut inner = self.inner.lock();
        inner.write_queue.clear();
        inner.queued.clear();
        inner.queued_bytes = 0;
        inner
            .container
            .take()
            .ok_or_else(|| BoxTreeError::InvalidOperation("disk buffer is closed".into()))
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().container.is_some()
    }

    pub fn stats(&self) -> DiskBufferStats {
        let inner = self.inner.lock();
        DiskBufferStats {
            writes: self.stats.writes.load(Ordering::Relaxed),
            reads: self.stats.reads.load(Ordering::Relaxed),
            records_written: self.stats.records_written.load(Ordering::Relaxed),
            records_read: self.stats.records_read.load(Ordering::Relaxed),
            queued_leaves: inner.write_queue.len() as u64,
            queued_bytes: inner.queued_bytes,
            free_blocks: inner.free_space.len() as u64,
            free_records: inner.free_space.total_free(),
            record_area_length: inner.record_area_length,
        }
    }
}
