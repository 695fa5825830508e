//! Flat, parallel-array form of a box tree.
//!
//! Slot `i` of every array describes box `i`; boxes are never renumbered.
//! This is the only form in which a tree's structure is written to or read
//! from a container:
//! - `box_type`: 0 none, 1 leaf, 2 grid box
//! - `box_children`: inclusive first and last child, `-1` for leaves
//! - `box_event_index`: offset and count of a leaf's records
//! - `box_signal_errorsquared`: cached aggregates

use crate::constants::{
    ATTR_BOX_CONTROLLER, BOX_CHILDREN, BOX_CHUNK_ROWS, BOX_EVENT_INDEX, BOX_SIGNAL_ERRORSQUARED,
    BOX_STRUCTURE_GROUP, BOX_TYPE, DEPTH, EXTENTS, INVERSE_VOLUME, INVERSE_VOLUME_TOLERANCE,
};
use crate::container::{ContainerFile, Element};
use crate::controller::{BoxController, ControllerDescriptor};
use crate::errors::{BoxResult, BoxTreeError};
use crate::extents::BoxExtents;
use crate::node::{FileRange, GridBox, LeafBox, Node};
use crate::record::Record;
use crate::tree::BoxTree;

/// Kind of a box slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BoxType {
    None = 0,
    Leaf = 1,
    Internal = 2,
}

impl BoxType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(BoxType::None),
            1 => Some(BoxType::Leaf),
            2 => Some(BoxType::Internal),
            _ => None,
        }
    }
}

/// A tree's structure as parallel arrays
#[derive(Debug, Clone, PartialEq)]
pub struct BoxStructure {
    pub nd: usize,
    pub controller_descriptor: String,
    pub box_type: Vec<BoxType>,
    pub depth: Vec<i32>,
    pub inverse_volume: Vec<f64>,
    /// `[min0, max0, min1, max1, …]` per box
    pub extents: Vec<f64>,
    /// Inclusive `[first, last]` per box
    pub box_children: Vec<i32>,
    pub box_signal_errorsquared: Vec<f64>,
    pub box_event_index: Vec<u64>,
}

impl BoxStructure {
    /// Flattens a tree, refreshing its cached aggregates first.
    ///
    /// Leaves keep their stored range when they have one; leaves that were
    /// never stored get offset 0 until [`Self::set_boxes_file_positions`]
    /// assigns one.
    pub fn init_flat_structure<R: Record>(tree: &mut BoxTree<R>) -> BoxResult<Self> {
        tree.refresh_cache();
        let controller = tree.controller();
        let n = tree.num_boxes();
        if controller.total_boxes() != n || controller.next_id() != n {
            return Err(BoxTreeError::InvalidOperation(format!(
                "controller counts {} boxes (next ID {}) but the tree holds {}",
                controller.total_boxes(),
                controller.next_id(),
                n
            )));
        }

        let nd = tree.nd();
        let n = n as usize;
        let mut structure = BoxStructure {
            nd,
            controller_descriptor: controller.to_descriptor()?,
            box_type: Vec::with_capacity(n),
            depth: Vec::with_capacity(n),
            inverse_volume: Vec::with_capacity(n),
            extents: Vec::with_capacity(n * nd * 2),
            box_children: Vec::with_capacity(n * 2),
            box_signal_errorsquared: Vec::with_capacity(n * 2),
            box_event_index: Vec::with_capacity(n * 2),
        };

        for node in tree.nodes() {
            structure.depth.push(to_stored_index(DEPTH, node.depth() as u64)?);
            structure.inverse_volume.push(node.inverse_volume());
            node.extents().write_flat(&mut structure.extents);
            structure.box_signal_errorsquared.push(node.signal());
            structure.box_signal_errorsquared.push(node.error_squared());
            match node {
                Node::Leaf(leaf) => {
                    structure.box_type.push(BoxType::Leaf);
                    structure.box_children.extend_from_slice(&[-1, -1]);
                    let offset = leaf.file_range().map(|r| r.offset).unwrap_or(0);
                    structure.box_event_index.push(offset);
                    structure.box_event_index.push(leaf.num_records());
                }
                Node::Internal(grid) => {
                    structure.box_type.push(BoxType::Internal);
                    let children = grid.children();
                    structure.box_children.push(to_stored_index(BOX_CHILDREN, children.start)?);
                    structure.box_children.push(to_stored_index(BOX_CHILDREN, children.end - 1)?);
                    structure.box_event_index.extend_from_slice(&[0, 0]);
                }
            }
        }
        Ok(structure)
    }

    #[inline]
    pub fn num_boxes(&self) -> usize {
        self.box_type.len()
    }

    /// Stored range of box `i`'s records
    pub fn event_range(&self, i: usize) -> FileRange {
        FileRange::new(self.box_event_index[i * 2], self.box_event_index[i * 2 + 1])
    }

    /// Lays the leaves' records out back to back in ID order and returns the
    /// total record count.
    ///
    /// With `assign_file_backing` the leaves also take these ranges as their
    /// stored blocks and become clean; the caller must have written (or be
    /// about to write) every leaf's records at the assigned position.
    pub fn set_boxes_file_positions<R: Record>(
        &mut self,
        tree: &mut BoxTree<R>,
        assign_file_backing: bool,
    ) -> u64 {
        let mut position = 0u64;
        for node in tree.nodes_mut() {
            let Node::Leaf(leaf) = node else {
                continue;
            };
            let i = leaf.id() as usize;
            let count = leaf.num_records();
            self.box_event_index[i * 2] = position;
            self.box_event_index[i * 2 + 1] = count;
            if assign_file_backing {
                let range = (count > 0).then(|| FileRange::new(position, count));
                leaf.mark_written(range);
            }
            position += count;
        }
        position
    }

    /// Writes every array and the controller descriptor to `box_structure`.
    ///
    /// Existing arrays are overwritten in place and extended when the tree
    /// grew; they are never shrunk.
    pub fn save_box_structure(&self, container: &mut ContainerFile) -> BoxResult<()> {
        container.require_group(BOX_STRUCTURE_GROUP)?;
        let n = self.num_boxes() as u64;
        let box_type: Vec<i32> = self.box_type.iter().map(|&t| t as i32).collect();

        write_array(container, BOX_TYPE, n, 1, &box_type)?;
        write_array(container, DEPTH, n, 1, &self.depth)?;
        write_array(container, INVERSE_VOLUME, n, 1, &self.inverse_volume)?;
        write_array(container, EXTENTS, n, self.nd as u64 * 2, &self.extents)?;
        write_array(container, BOX_CHILDREN, n, 2, &self.box_children)?;
        write_array(
            container,
            BOX_SIGNAL_ERRORSQUARED,
            n,
            2,
            &self.box_signal_errorsquared,
        )?;
        write_array(container, BOX_EVENT_INDEX, n, 2, &self.box_event_index)?;
        container.set_attribute(
            BOX_STRUCTURE_GROUP,
            ATTR_BOX_CONTROLLER,
            self.controller_descriptor.as_str(),
        )
    }

    /// Reads the flat structure back.
    ///
    /// With `only_structure` the aggregates and record ranges are not read
    /// and come back as zeros. Every array must hold exactly one row per
    /// box counted by the stored descriptor.
    pub fn load_box_structure(
        container: &mut ContainerFile,
        only_structure: bool,
    ) -> BoxResult<Self> {
        let controller_descriptor = container
            .required_attribute(BOX_STRUCTURE_GROUP, ATTR_BOX_CONTROLLER)?
            .to_string();
        let descriptor = ControllerDescriptor::parse(&controller_descriptor)?;
        let n = descriptor.num_boxes;
        let nd = descriptor.nd;

        let box_type = read_array::<i32>(container, BOX_TYPE, n, 1)?
            .into_iter()
            .enumerate()
            .map(|(i, t)| {
                BoxType::from_i32(t).ok_or_else(|| {
                    BoxTreeError::FormatMismatch(format!(
                        "array '{}/{}' has unknown box type {} at slot {}",
                        BOX_STRUCTURE_GROUP, BOX_TYPE, t, i
                    ))
                })
            })
            .collect::<BoxResult<Vec<_>>>()?;
        let depth = read_array::<i32>(container, DEPTH, n, 1)?;
        let inverse_volume = read_array::<f64>(container, INVERSE_VOLUME, n, 1)?;
        let extents = read_array::<f64>(container, EXTENTS, n, nd as u64 * 2)?;
        let box_children = read_array::<i32>(container, BOX_CHILDREN, n, 2)?;

        let (box_signal_errorsquared, box_event_index) = if only_structure {
            (vec![0.0; n as usize * 2], vec![0; n as usize * 2])
        } else {
            (
                read_array::<f64>(container, BOX_SIGNAL_ERRORSQUARED, n, 2)?,
                read_array::<u64>(container, BOX_EVENT_INDEX, n, 2)?,
            )
        };

        Ok(BoxStructure {
            nd,
            controller_descriptor,
            box_type,
            depth,
            inverse_volume,
            extents,
            box_children,
            box_signal_errorsquared,
            box_event_index,
        })
    }

    /// Rebuilds the node arena and returns it with the total record count.
    ///
    /// With `file_backed` leaves keep their stored range as a marker and
    /// read records on demand; otherwise they come back empty and the
    /// caller fills them. `structure_only` ignores aggregates and ranges.
    /// Nothing is returned unless the whole structure is consistent.
    pub fn restore_tree<R: Record>(
        &self,
        controller: BoxController,
        file_backed: bool,
        structure_only: bool,
    ) -> BoxResult<(BoxTree<R>, u64)> {
        if controller.nd() != self.nd {
            return Err(BoxTreeError::FormatMismatch(format!(
                "box structure has {} dimensions, controller has {}",
                self.nd,
                controller.nd()
            )));
        }

        let n = self.num_boxes();
        let row = self.nd * 2;
        self.check_lengths()?;
        let mut nodes = Vec::with_capacity(n);
        let mut total_records = 0u64;
        let mut volume_mismatches = 0usize;
        let mut first_mismatch = 0usize;

        for i in 0..n {
            let depth = u32::try_from(self.depth[i]).map_err(|_| {
                BoxTreeError::FormatMismatch(format!(
                    "array '{}/{}' has negative depth {} at slot {}",
                    BOX_STRUCTURE_GROUP, DEPTH, self.depth[i], i
                ))
            })?;
            let extents = BoxExtents::from_flat(&self.extents[i * row..(i + 1) * row])?;
            let inverse_volume = extents.inverse_volume();
            if !close_enough(self.inverse_volume[i], inverse_volume) {
                if volume_mismatches == 0 {
                    first_mismatch = i;
                }
                volume_mismatches += 1;
            }
            let signal = self.box_signal_errorsquared[i * 2];
            let error_squared = self.box_signal_errorsquared[i * 2 + 1];
            let (first, last) = (self.box_children[i * 2], self.box_children[i * 2 + 1]);

            let node = match self.box_type[i] {
                BoxType::None => {
                    return Err(BoxTreeError::FormatMismatch(format!(
                        "array '{}/{}' has an empty slot {}",
                        BOX_STRUCTURE_GROUP, BOX_TYPE, i
                    )));
                }
                BoxType::Leaf => {
                    if first != -1 || last != -1 {
                        return Err(children_error(i, first, last, n));
                    }
                    let mut leaf = LeafBox::new(i as u64, depth, extents);
                    if !structure_only {
                        let range = self.event_range(i);
                        total_records += range.count;
                        if file_backed {
                            leaf = leaf.with_file_range(Some(range));
                            leaf.set_cache(signal, error_squared);
                        }
                    }
                    Node::Leaf(leaf)
                }
                BoxType::Internal => {
                    if first < 1 || last < first || last as usize >= n {
                        return Err(children_error(i, first, last, n));
                    }
                    let mut grid = GridBox::new(i as u64, depth, extents);
                    grid.set_children(first as u64, last as u64 + 1);
                    if !structure_only {
                        grid.set_cache(signal, error_squared);
                    }
                    Node::Internal(grid)
                }
            };
            nodes.push(node);
        }

        if volume_mismatches > 0 {
            log::warn!(
                "{} boxes store an inverse volume that disagrees with their extents \
                 (first: box {}), using the recomputed values",
                volume_mismatches,
                first_mismatch
            );
        }

        controller.reset_numbering(n as u64, n as u64);
        let tree = BoxTree::from_parts(controller, nodes, Vec::new());
        tree.check_structure()?;
        Ok((tree, total_records))
    }

    /// Every array must hold one row per entry of `box_type`
    fn check_lengths(&self) -> BoxResult<()> {
        let n = self.num_boxes();
        let arrays = [
            (DEPTH, self.depth.len(), 1),
            (INVERSE_VOLUME, self.inverse_volume.len(), 1),
            (EXTENTS, self.extents.len(), self.nd * 2),
            (BOX_CHILDREN, self.box_children.len(), 2),
            (BOX_SIGNAL_ERRORSQUARED, self.box_signal_errorsquared.len(), 2),
            (BOX_EVENT_INDEX, self.box_event_index.len(), 2),
        ];
        for (name, len, columns) in arrays {
            if len != n * columns {
                return Err(BoxTreeError::array_length(
                    BOX_STRUCTURE_GROUP,
                    name,
                    n as u64,
                    (len / columns) as u64,
                ));
            }
        }
        Ok(())
    }
}

/// Depths and child IDs are stored as 32-bit signed integers
fn to_stored_index(array: &str, value: u64) -> BoxResult<i32> {
    i32::try_from(value).map_err(|_| {
        BoxTreeError::InvalidOperation(format!(
            "value {} does not fit array '{}/{}'",
            value, BOX_STRUCTURE_GROUP, array
        ))
    })
}

fn close_enough(stored: f64, computed: f64) -> bool {
    let scale = stored.abs().max(computed.abs());
    scale == 0.0 || (stored - computed).abs() <= INVERSE_VOLUME_TOLERANCE * scale
}

fn children_error(i: usize, first: i32, last: i32, n: usize) -> BoxTreeError {
    BoxTreeError::FormatMismatch(format!(
        "array '{}/{}' has invalid child range [{}, {}] at slot {} of {}",
        BOX_STRUCTURE_GROUP, BOX_CHILDREN, first, last, i, n
    ))
}

fn write_array<T: Element>(
    container: &mut ContainerFile,
    name: &str,
    rows: u64,
    columns: u64,
    data: &[T],
) -> BoxResult<()> {
    container.require_array::<T>(BOX_STRUCTURE_GROUP, name, columns, BOX_CHUNK_ROWS)?;
    let existing = container.array_rows(BOX_STRUCTURE_GROUP, name)?;
    if existing > rows {
        return Err(BoxTreeError::InvalidOperation(format!(
            "array '{}/{}' holds {} rows, cannot shrink to {}",
            BOX_STRUCTURE_GROUP, name, existing, rows
        )));
    }
    container.write_rows(BOX_STRUCTURE_GROUP, name, 0, data)
}

fn read_array<T: Element>(
    container: &mut ContainerFile,
    name: &str,
    rows: u64,
    columns: u64,
) -> BoxResult<Vec<T>> {
    let info = container.array_info(BOX_STRUCTURE_GROUP, name).ok_or_else(|| {
        BoxTreeError::FormatMismatch(format!(
            "array '{}/{}' not found",
            BOX_STRUCTURE_GROUP, name
        ))
    })?;
    if info.columns != columns {
        return Err(BoxTreeError::FormatMismatch(format!(
            "array '{}/{}' has {} columns, expected {}",
            BOX_STRUCTURE_GROUP, name, info.columns, columns
        )));
    }
    if info.rows != rows {
        return Err(BoxTreeError::array_length(
            BOX_STRUCTURE_GROUP,
            name,
            rows,
            info.rows,
        ));
    }
    container.read_all(BOX_STRUCTURE_GROUP, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LeanRecord;
    use rand::Rng;
    use tempfile::tempdir;

    fn random_tree(nd: usize, records: usize) -> BoxTree<LeanRecord> {
        let controller = BoxController::builder(nd)
            .split_threshold(20)
            .max_depth(6)
            .build()
            .unwrap();
        let mut tree = BoxTree::new(controller, BoxExtents::uniform(nd, -1.0, 1.0)).unwrap();
        let mut rng = rand::thread_rng();
        let records: Vec<LeanRecord> = (0..records)
            .map(|_| {
                let coords: Vec<f32> = (0..nd).map(|_| rng.gen_range(-1.0..1.0)).collect();
                LeanRecord::new(rng.gen_range(0.0..2.0), 1.0, &coords)
            })
            .collect();
        tree.add_records(records).unwrap();
        tree.split_all_if_needed_with(2).unwrap();
        tree
    }

    #[test]
    fn test_flatten_and_restore_preserve_structure() {
        let mut tree = random_tree(2, 500);
        let mut structure = BoxStructure::init_flat_structure(&mut tree).unwrap();
        assert_eq!(structure.num_boxes() as u64, tree.num_boxes());
        let total = structure.set_boxes_file_positions(&mut tree, false);
        assert_eq!(total, 500);

        let controller = BoxController::from_descriptor(&structure.controller_descriptor).unwrap();
        let (restored, records) = structure
            .restore_tree::<LeanRecord>(controller, true, false)
            .unwrap();
        assert_eq!(records, 500);
        assert_eq!(restored.num_boxes(), tree.num_boxes());
        assert_eq!(restored.controller().total_boxes(), tree.num_boxes());
        for (a, b) in tree.nodes().iter().zip(restored.nodes()) {
            assert_eq!(a.is_leaf(), b.is_leaf());
            assert_eq!(a.depth(), b.depth());
            assert_eq!(a.extents(), b.extents());
            assert!((a.signal() - b.signal()).abs() < 1e-9);
            if let (Some(x), Some(y)) = (a.as_grid(), b.as_grid()) {
                assert_eq!(x.children(), y.children());
            }
        }
        assert_eq!(restored.total_records(), 500);
    }

    #[test]
    fn test_positions_are_contiguous_in_id_order() {
        let mut tree = random_tree(1, 200);
        let mut structure = BoxStructure::init_flat_structure(&mut tree).unwrap();
        structure.set_boxes_file_positions(&mut tree, false);

        let mut expected = 0;
        for leaf in tree.nodes().iter().filter_map(Node::as_leaf) {
            let range = structure.event_range(leaf.id() as usize);
            assert_eq!(range.offset, expected);
            expected += range.count;
        }
        assert_eq!(expected, 200);
    }

    #[test]
    fn test_save_and_load_structure() {
        let dir = tempdir().unwrap();
        let mut container = ContainerFile::create(dir.path().join("structure.mdbox")).unwrap();
        let mut tree = random_tree(3, 300);
        let mut structure = BoxStructure::init_flat_structure(&mut tree).unwrap();
        structure.set_boxes_file_positions(&mut tree, false);
        structure.save_box_structure(&mut container).unwrap();

        let loaded = BoxStructure::load_box_structure(&mut container, false).unwrap();
        assert_eq!(loaded, structure);

        let topology = BoxStructure::load_box_structure(&mut container, true).unwrap();
        assert_eq!(topology.box_children, structure.box_children);
        assert!(topology.box_event_index.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_length_mismatch_names_array() {
        let dir = tempdir().unwrap();
        let mut container = ContainerFile::create(dir.path().join("short.mdbox")).unwrap();
        let mut tree = random_tree(1, 100);
        let structure = BoxStructure::init_flat_structure(&mut tree).unwrap();
        structure.save_box_structure(&mut container).unwrap();

        // Grow one array past the others
        let extra = vec![1i32; 2];
        container
            .write_rows(BOX_STRUCTURE_GROUP, DEPTH, structure.num_boxes() as u64, &extra)
            .unwrap();
        match BoxStructure::load_box_structure(&mut container, false) {
            Err(BoxTreeError::FormatMismatch(message)) => assert!(message.contains("depth")),
            other => panic!("expected a format mismatch, got {:?}", other.map(|s| s.nd)),
        }
    }

    #[test]
    fn test_restore_rejects_bad_child_range_and_empty_slot() {
        let mut tree = random_tree(1, 100);
        let structure = BoxStructure::init_flat_structure(&mut tree).unwrap();
        let fresh = || BoxController::from_descriptor(&structure.controller_descriptor).unwrap();

        let mut broken = structure.clone();
        broken.box_children[1] = broken.num_boxes() as i32;
        assert!(matches!(
            broken.restore_tree::<LeanRecord>(fresh(), false, false),
            Err(BoxTreeError::FormatMismatch(_))
        ));

        let mut empty = structure.clone();
        let last = empty.num_boxes() - 1;
        empty.box_type[last] = BoxType::None;
        assert!(empty.restore_tree::<LeanRecord>(fresh(), false, false).is_err());

        let mut orphan = structure.clone();
        orphan.box_children[0] = 2;
        assert!(orphan.restore_tree::<LeanRecord>(fresh(), false, true).is_err());
    }

    #[test]
    fn test_restore_rejects_unequal_arrays() {
        let mut tree = random_tree(2, 60);
        let structure = BoxStructure::init_flat_structure(&mut tree).unwrap();
        let fresh = || BoxController::from_descriptor(&structure.controller_descriptor).unwrap();

        let mut short_depth = structure.clone();
        short_depth.depth.pop();
        match short_depth.restore_tree::<LeanRecord>(fresh(), false, false) {
            Err(BoxTreeError::FormatMismatch(message)) => assert!(message.contains(DEPTH)),
            other => panic!("expected a format mismatch, got {:?}", other.map(|(_, n)| n)),
        }

        let mut short_extents = structure.clone();
        short_extents.extents.truncate(structure.extents.len() - 4);
        match short_extents.restore_tree::<LeanRecord>(fresh(), false, false) {
            Err(BoxTreeError::FormatMismatch(message)) => assert!(message.contains(EXTENTS)),
            other => panic!("expected a format mismatch, got {:?}", other.map(|(_, n)| n)),
        }

        let mut long_index = structure.clone();
        long_index.box_event_index.extend_from_slice(&[0, 0]);
        assert!(matches!(
            long_index.restore_tree::<LeanRecord>(fresh(), true, false),
            Err(BoxTreeError::FormatMismatch(_))
        ));

        let mut short_children = structure.clone();
        short_children.box_children.pop();
        assert!(short_children
            .restore_tree::<LeanRecord>(fresh(), false, true)
            .is_err());
    }

    #[test]
    fn test_stored_index_rejects_overflow() {
        assert_eq!(to_stored_index(BOX_CHILDREN, 42).unwrap(), 42);
        assert_eq!(to_stored_index(DEPTH, i32::MAX as u64).unwrap(), i32::MAX);
        assert!(matches!(
            to_stored_index(BOX_CHILDREN, i32::MAX as u64 + 1),
            Err(BoxTreeError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_inverse_volume_mismatch_is_not_fatal() {
        let mut tree = random_tree(2, 50);
        let mut structure = BoxStructure::init_flat_structure(&mut tree).unwrap();
        structure.inverse_volume[0] *= 2.0;
        let controller = BoxController::from_descriptor(&structure.controller_descriptor).unwrap();
        let (restored, _) = structure
            .restore_tree::<LeanRecord>(controller, false, true)
            .unwrap();
        assert_eq!(restored.root().inverse_volume(), 0.25);
    }
}
