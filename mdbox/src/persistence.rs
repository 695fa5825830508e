//! Saving and loading box trees to and from a container file.
//!
//! Layout of a saved tree:
//! - `event_workspace`: attributes `record_type` and `nd`
//! - `event_workspace/box_structure`: the flat structure and the controller descriptor
//! - `event_workspace/event_data`: record payload arrays and the free-space table
//! - `event_workspace/experiment_info`: run provenance
//!
//! A tree that is file-backed by the target file is saved incrementally:
//! only dirty leaves are written, the structure arrays are overwritten in
//! place and the free-space table is written last. Any other save writes a
//! fresh container.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::constants::{ATTR_ND, ATTR_RECORD_TYPE, DEFAULT_WRITE_BUFFER_BYTES, WORKSPACE_GROUP};
use crate::container::{AccessMode, ContainerFile};
use crate::controller::BoxController;
use crate::disk_buffer::DiskBuffer;
use crate::errors::{BoxResult, BoxTreeError};
use crate::flat_tree::BoxStructure;
use crate::node::{BoxId, Node};
use crate::record::{Record, RecordKind};
use crate::record_store;
use crate::run_info;
use crate::tree::BoxTree;

/// Options for [`load_tree`]
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Expected dimensionality; `None` adopts the stored one
    pub nd: Option<usize>,
    /// Keep the file open and read leaf records on demand
    pub file_backed: bool,
    /// Restore the topology only, without records or aggregates
    pub structure_only: bool,
    /// Write budget of the page cache of a file-backed tree
    pub write_buffer_size: u64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            nd: None,
            file_backed: false,
            structure_only: false,
            write_buffer_size: DEFAULT_WRITE_BUFFER_BYTES,
        }
    }
}

impl LoadOptions {
    pub fn nd(mut self, nd: usize) -> Self {
        self.nd = Some(nd);
        self
    }

    pub fn file_backed(mut self, file_backed: bool) -> Self {
        self.file_backed = file_backed;
        self
    }

    pub fn structure_only(mut self, structure_only: bool) -> Self {
        self.structure_only = structure_only;
        self
    }

    pub fn write_buffer_size(mut self, bytes: u64) -> Self {
        self.write_buffer_size = bytes;
        self
    }
}

/// A loaded tree and the number of records its structure declares
pub struct LoadedTree<R: Record> {
    pub tree: BoxTree<R>,
    pub total_records: u64,
}

/// Outcome of [`save_tree`]
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReport {
    pub path: PathBuf,
    pub incremental: bool,
    pub num_boxes: u64,
    pub total_records: u64,
    pub free_blocks: usize,
}

/// Dimensionality declared by an existing container, if any
pub fn stored_nd(container: &ContainerFile) -> BoxResult<Option<usize>> {
    container
        .attribute(WORKSPACE_GROUP, ATTR_ND)
        .map(|value| {
            value.parse::<usize>().map_err(|_| {
                BoxTreeError::FormatMismatch(format!(
                    "attribute '{}' of '{}' is not a dimensionality: {}",
                    ATTR_ND, WORKSPACE_GROUP, value
                ))
            })
        })
        .transpose()
}

fn write_workspace_header<R: Record>(container: &mut ContainerFile, nd: usize) -> BoxResult<()> {
    container.require_group(WORKSPACE_GROUP)?;
    container.set_attribute(WORKSPACE_GROUP, ATTR_RECORD_TYPE, R::KIND.tag())?;
    container.set_attribute(WORKSPACE_GROUP, ATTR_ND, nd.to_string())
}

/// Checks the stored record type and dimensionality and returns the latter
fn check_workspace_header<R: Record>(
    container: &ContainerFile,
    expected_nd: Option<usize>,
) -> BoxResult<usize> {
    let tag = container.required_attribute(WORKSPACE_GROUP, ATTR_RECORD_TYPE)?;
    match RecordKind::from_tag(tag) {
        Some(kind) if kind == R::KIND => {}
        _ => {
            return Err(BoxTreeError::FormatMismatch(format!(
                "container '{}' holds '{}' records, expected '{}'",
                container.path().display(),
                tag,
                R::KIND
            )))
        }
    }

    let nd = stored_nd(container)?.ok_or_else(|| {
        BoxTreeError::FormatMismatch(format!(
            "attribute '{}' missing from group '{}'",
            ATTR_ND, WORKSPACE_GROUP
        ))
    })?;
    if let Some(expected) = expected_nd {
        if expected != nd {
            return Err(BoxTreeError::FormatMismatch(format!(
                "container '{}' holds {}-dimensional records, expected {}",
                container.path().display(),
                nd,
                expected
            )));
        }
    }
    Ok(nd)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Saves a tree to `path`.
///
/// When the tree is file-backed by `path` the save is incremental. Otherwise
/// the container is written from scratch; an existing container declaring
/// a different dimensionality is refused. With `keep_file_backed` the tree
/// is file-backed by `path` afterwards.
pub fn save_tree<R: Record>(
    tree: &mut BoxTree<R>,
    path: impl AsRef<Path>,
    keep_file_backed: bool,
) -> BoxResult<SaveReport> {
    let path = path.as_ref();
    if let Some(cache) = tree.controller().page_cache() {
        if same_file(cache.path(), path) {
            return save_incremental(tree, cache, keep_file_backed);
        }
    }
    save_new(tree, path, keep_file_backed)
}

fn save_incremental<R: Record>(
    tree: &mut BoxTree<R>,
    cache: Arc<DiskBuffer>,
    keep_file_backed: bool,
) -> BoxResult<SaveReport> {
    log::debug!("Updating existing box tree at {:?}", cache.path());
    tree.flush_cache()?;
    let structure = BoxStructure::init_flat_structure(tree)?;
    let runs = tree.runs();
    cache.with_container(|container| {
        structure.save_box_structure(container)?;
        run_info::save_runs(container, runs)
    })?;
    // Free-space table goes last
    cache.sync()?;

    let report = SaveReport {
        path: cache.path().to_path_buf(),
        incremental: true,
        num_boxes: tree.num_boxes(),
        total_records: tree.total_records(),
        free_blocks: cache.free_space_blocks().len(),
    };
    if !keep_file_backed {
        release_backing(tree, &cache)?;
    }
    log::info!(
        "Saved {} boxes and {} records incrementally to {:?}",
        report.num_boxes,
        report.total_records,
        report.path
    );
    Ok(report)
}

fn save_new<R: Record>(
    tree: &mut BoxTree<R>,
    path: &Path,
    keep_file_backed: bool,
) -> BoxResult<SaveReport> {
    let nd = tree.nd();
    if path.exists() {
        match ContainerFile::open(path, AccessMode::ReadOnly) {
            Ok(existing) => {
                if let Some(stored) = stored_nd(&existing)? {
                    if stored != nd {
                        return Err(BoxTreeError::ConfigMismatch(format!(
                            "container '{}' holds {}-dimensional records, tree has {}",
                            path.display(),
                            stored,
                            nd
                        )));
                    }
                }
            }
            Err(e) => log::warn!("Overwriting unreadable file {:?}: {}", path, e),
        }
    }

    log::debug!("Creating box tree file at {:?}", path);
    let mut container = ContainerFile::create(path)?;
    write_workspace_header::<R>(&mut container, nd)?;
    record_store::require_record_arrays::<R>(&mut container, nd)?;

    let mut structure = BoxStructure::init_flat_structure(tree)?;
    let total_records = structure.set_boxes_file_positions(tree, false);

    // Leaves only read in for this save are evicted again afterwards
    let mut reloaded: Vec<BoxId> = Vec::new();
    for id in tree.leaf_ids() {
        let range = structure.event_range(id as usize);
        if range.count == 0 {
            continue;
        }
        if tree
            .node(id)
            .and_then(Node::as_leaf)
            .is_some_and(|leaf| !leaf.is_loaded())
        {
            reloaded.push(id);
        }
        let records = tree.leaf_records(id)?;
        record_store::write_records(&mut container, nd, range.offset, records)?;
    }

    structure.save_box_structure(&mut container)?;
    run_info::save_runs(&mut container, tree.runs())?;
    record_store::write_free_space(&mut container, &[])?;
    container.flush()?;

    if keep_file_backed {
        let write_buffer_size = match tree.controller().clear_file_backing() {
            Some(old) => old.write_buffer_size(),
            None => DEFAULT_WRITE_BUFFER_BYTES,
        };
        structure.set_boxes_file_positions(tree, true);
        let cache = DiskBuffer::new(container, nd, &[], write_buffer_size)?;
        tree.controller().set_file_backing(Arc::new(cache));
    } else {
        container.close()?;
    }
    for id in reloaded {
        if let Some(leaf) = tree.nodes_mut()[id as usize].as_leaf_mut() {
            leaf.clear_data_from_memory();
        }
    }

    let report = SaveReport {
        path: path.to_path_buf(),
        incremental: false,
        num_boxes: tree.num_boxes(),
        total_records,
        free_blocks: 0,
    };
    log::info!(
        "Saved {} boxes and {} records to {:?}",
        report.num_boxes,
        report.total_records,
        report.path
    );
    Ok(report)
}

/// Detaches a tree from its file, bringing every record into memory first
fn release_backing<R: Record>(tree: &mut BoxTree<R>, cache: &Arc<DiskBuffer>) -> BoxResult<()> {
    for id in tree.leaf_ids() {
        tree.load_leaf(id)?;
        if let Some(leaf) = tree.nodes_mut()[id as usize].as_leaf_mut() {
            leaf.forget_file_range();
        }
    }
    tree.controller().clear_file_backing();
    cache.take_container()?.close()
}

/// Loads a tree saved by [`save_tree`].
///
/// The record type and dimensionality are checked before anything else is
/// read. No tree is returned unless the whole structure is consistent and,
/// for an eager load, every leaf's records could be read.
pub fn load_tree<R: Record>(
    path: impl AsRef<Path>,
    options: LoadOptions,
) -> BoxResult<LoadedTree<R>> {
    let path = path.as_ref();
    log::debug!("Opening existing box tree at {:?}", path);
    let mode = if options.file_backed {
        AccessMode::ReadWrite
    } else {
        AccessMode::ReadOnly
    };
    let mut container = ContainerFile::open(path, mode)?;
    let nd = check_workspace_header::<R>(&container, options.nd)?;

    let structure = BoxStructure::load_box_structure(&mut container, options.structure_only)?;
    if structure.nd != nd {
        return Err(BoxTreeError::FormatMismatch(format!(
            "box structure of '{}' is {}-dimensional, workspace declares {}",
            path.display(),
            structure.nd,
            nd
        )));
    }
    let controller = BoxController::from_descriptor(&structure.controller_descriptor)?;
    let runs = run_info::load_runs(&container)?;

    if options.structure_only {
        let (mut tree, _) = structure.restore_tree::<R>(controller, false, true)?;
        tree.set_runs(runs);
        return Ok(LoadedTree {
            tree,
            total_records: 0,
        });
    }

    let record_area = record_store::record_area_length(&container);
    for i in 0..structure.num_boxes() {
        let range = structure.event_range(i);
        if range.count > 0 && range.end() > record_area {
            return Err(BoxTreeError::FormatMismatch(format!(
                "box {} stores records [{}, {}) past the record area of {} records",
                i,
                range.offset,
                range.end(),
                record_area
            )));
        }
    }

    let (mut tree, total_records) =
        structure.restore_tree::<R>(controller.clone(), options.file_backed, false)?;
    tree.set_runs(runs);

    if options.file_backed {
        let free_blocks = record_store::read_free_space(&mut container)?;
        let cache = DiskBuffer::new(container, nd, &free_blocks, options.write_buffer_size)?;
        controller.set_file_backing(Arc::new(cache));
    } else {
        for id in tree.leaf_ids() {
            let range = structure.event_range(id as usize);
            let records = record_store::read_records(&mut container, nd, range.offset, range.count)?;
            if let Some(leaf) = tree.nodes_mut()[id as usize].as_leaf_mut() {
                leaf.set_records(records);
            }
        }
        tree.refresh_cache();
    }

    log::info!(
        "Loaded {} boxes and {} records from {:?}",
        tree.num_boxes(),
        total_records,
        path
    );
    Ok(LoadedTree {
        tree,
        total_records,
    })
}
