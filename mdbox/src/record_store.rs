//! Record payload arrays of the `event_data` group.
//!
//! Each record field is its own extensible array, so a leaf's block of
//! records is a row range `[offset, offset + count)` shared by all of them.

use crate::constants::{
    ATTR_FREE_SPACE_COUNT, COORDINATES, DETECTOR_ID, ERROR_SQUARED, EVENT_DATA_GROUP,
    FREE_SPACE_BLOCKS, RECORD_CHUNK_ROWS, RUN_INDEX, SIGNAL,
};
use crate::container::ContainerFile;
use crate::errors::{BoxResult, BoxTreeError};
use crate::free_space::FreeBlock;
use crate::record::{Record, RecordKind};

/// Create the payload arrays for records of type `R`
pub(crate) fn require_record_arrays<R: Record>(
    container: &mut ContainerFile,
    nd: usize,
) -> BoxResult<()> {
    container.require_group(EVENT_DATA_GROUP)?;
    container.require_array::<f32>(EVENT_DATA_GROUP, SIGNAL, 1, RECORD_CHUNK_ROWS)?;
    container.require_array::<f32>(EVENT_DATA_GROUP, ERROR_SQUARED, 1, RECORD_CHUNK_ROWS)?;
    container.require_array::<f32>(EVENT_DATA_GROUP, COORDINATES, nd as u64, RECORD_CHUNK_ROWS)?;
    if R::KIND == RecordKind::Full {
        container.require_array::<u16>(EVENT_DATA_GROUP, RUN_INDEX, 1, RECORD_CHUNK_ROWS)?;
        container.require_array::<i32>(EVENT_DATA_GROUP, DETECTOR_ID, 1, RECORD_CHUNK_ROWS)?;
    }
    container.require_array::<u64>(EVENT_DATA_GROUP, FREE_SPACE_BLOCKS, 2, 1024)?;
    Ok(())
}

/// Number of record rows in the container's record area
pub(crate) fn record_area_length(container: &ContainerFile) -> u64 {
    container
        .array_info(EVENT_DATA_GROUP, SIGNAL)
        .map(|info| info.rows)
        .unwrap_or(0)
}

/// Write `records` to rows starting at `offset`
pub(crate) fn write_records<R: Record>(
    container: &mut ContainerFile,
    nd: usize,
    offset: u64,
    records: &[R],
) -> BoxResult<()> {
    if records.is_empty() {
        return Ok(());
    }

    let mut signal = Vec::with_capacity(records.len());
    let mut error_squared = Vec::with_capacity(records.len());
    let mut coords = Vec::with_capacity(records.len() * nd);
    for record in records {
        if record.coords().len() != nd {
            return Err(BoxTreeError::InvalidOperation(format!(
                "record has {} coordinates, container stores {}",
                record.coords().len(),
                nd
            )));
        }
        signal.push(record.signal());
        error_squared.push(record.error_squared());
        coords.extend_from_slice(record.coords());
    }

    container.write_rows(EVENT_DATA_GROUP, SIGNAL, offset, &signal)?;
    container.write_rows(EVENT_DATA_GROUP, ERROR_SQUARED, offset, &error_squared)?;
    container.write_rows(EVENT_DATA_GROUP, COORDINATES, offset, &coords)?;

    if R::KIND == RecordKind::Full {
        let runs: Vec<u16> = records.iter().map(|r| r.run_index().unwrap_or(0)).collect();
        let detectors: Vec<i32> = records
            .iter()
            .map(|r| r.detector_id().unwrap_or(0))
            .collect();
        container.write_rows(EVENT_DATA_GROUP, RUN_INDEX, offset, &runs)?;
        container.write_rows(EVENT_DATA_GROUP, DETECTOR_ID, offset, &detectors)?;
    }
    Ok(())
}

/// Read `count` records starting at row `offset`
pub(crate) fn read_records<R: Record>(
    container: &mut ContainerFile,
    nd: usize,
    offset: u64,
    count: u64,
) -> BoxResult<Vec<R>> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let signal: Vec<f32> = container.read_rows(EVENT_DATA_GROUP, SIGNAL, offset, count)?;
    let error_squared: Vec<f32> =
        container.read_rows(EVENT_DATA_GROUP, ERROR_SQUARED, offset, count)?;
    let coords: Vec<f32> = container.read_rows(EVENT_DATA_GROUP, COORDINATES, offset, count)?;

    let (runs, detectors) = if R::KIND == RecordKind::Full {
        let runs: Vec<u16> = container.read_rows(EVENT_DATA_GROUP, RUN_INDEX, offset, count)?;
        let detectors: Vec<i32> =
            container.read_rows(EVENT_DATA_GROUP, DETECTOR_ID, offset, count)?;
        (runs, detectors)
    } else {
        (Vec::new(), Vec::new())
    };

    let records = (0..count as usize)
        .map(|i| {
            R::from_parts(
                signal[i],
                error_squared[i],
                &coords[i * nd..(i + 1) * nd],
                runs.get(i).copied().unwrap_or(0),
                detectors.get(i).copied().unwrap_or(0),
            )
        })
        .collect();
    Ok(records)
}

/// Persist the free-space table. The array never shrinks, so the number of
/// valid rows is kept in an attribute.
pub(crate) fn write_free_space(
    container: &mut ContainerFile,
    blocks: &[FreeBlock],
) -> BoxResult<()> {
    let flat: Vec<u64> = blocks.iter().flat_map(|&(o, l)| [o, l]).collect();
    container.write_rows(EVENT_DATA_GROUP, FREE_SPACE_BLOCKS, 0, &flat)?;
    container.set_attribute(EVENT_DATA_GROUP, ATTR_FREE_SPACE_COUNT, blocks.len().to_string())
}

/// Read the persisted free-space table; a container without one has none
pub(crate) fn read_free_space(container: &mut ContainerFile) -> BoxResult<Vec<FreeBlock>> {
    let count = match container.attribute(EVENT_DATA_GROUP, ATTR_FREE_SPACE_COUNT) {
        Some(value) => value.parse::<u64>().map_err(|_| {
            BoxTreeError::FormatMismatch(format!(
                "attribute '{}' of '{}' is not a count: {}",
                ATTR_FREE_SPACE_COUNT, EVENT_DATA_GROUP, value
            ))
        })?,
        None => return Ok(Vec::new()),
    };
    let flat: Vec<u64> = container.read_rows(EVENT_DATA_GROUP, FREE_SPACE_BLOCKS, 0, count)?;
    Ok(flat.chunks_exact(2).map(|p| (p[0], p[1])).collect())
}
