//! Record types stored in the leaves of a box tree.
//!
//! Every record carries a signal, a squared error and `nd` coordinates.
//! [`FullRecord`] additionally carries provenance: the run it came from and
//! the detector that measured it.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{Display, Formatter};

/// Inline coordinate storage; trees of up to four dimensions never allocate
pub type Coordinates = SmallVec<[f32; 4]>;

/// Tag identifying the record type stored in a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    Lean,
    Full,
}

impl RecordKind {
    pub fn tag(&self) -> &'static str {
        match self {
            RecordKind::Lean => "LeanRecord",
            RecordKind::Full => "FullRecord",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "LeanRecord" => Some(RecordKind::Lean),
            "FullRecord" => Some(RecordKind::Full),
            _ => None,
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Minimal contract every stored record satisfies.
pub trait Record: Clone + Send + Sync + 'static {
    const KIND: RecordKind;

    /// Build a record from its parts. Record types without provenance ignore
    /// `run_index` and `detector_id`.
    fn from_parts(
        signal: f32,
        error_squared: f32,
        coords: &[f32],
        run_index: u16,
        detector_id: i32,
    ) -> Self;

    fn signal(&self) -> f32;

    fn error_squared(&self) -> f32;

    fn coords(&self) -> &[f32];

    fn run_index(&self) -> Option<u16> {
        None
    }

    fn detector_id(&self) -> Option<i32> {
        None
    }

    /// Shift the run index so identities stay unique when trees are merged
    fn offset_run_index(&mut self, _offset: u16) {}

    /// Bytes one record occupies in the container's record area
    fn stored_size(nd: usize) -> u64 {
        let provenance = match Self::KIND {
            RecordKind::Lean => 0,
            RecordKind::Full => 2 + 4,
        };
        (8 + 4 * nd + provenance) as u64
    }
}

/// A record without provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeanRecord {
    pub signal: f32,
    pub error_squared: f32,
    pub coords: Coordinates,
}

impl LeanRecord {
    pub fn new(signal: f32, error_squared: f32, coords: &[f32]) -> Self {
        Self {
            signal,
            error_squared,
            coords: Coordinates::from_slice(coords),
        }
    }
}

impl Record for LeanRecord {
    const KIND: RecordKind = RecordKind::Lean;

    fn from_parts(signal: f32, error_squared: f32, coords: &[f32], _: u16, _: i32) -> Self {
        Self::new(signal, error_squared, coords)
    }

    #[inline]
    fn signal(&self) -> f32 {
        self.signal
    }

    #[inline]
    fn error_squared(&self) -> f32 {
        self.error_squared
    }

    #[inline]
    fn coords(&self) -> &[f32] {
        &self.coords
    }
}

/// A record tagged with the run and detector it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullRecord {
    pub signal: f32,
    pub error_squared: f32,
    pub run_index: u16,
    pub detector_id: i32,
    pub coords: Coordinates,
}

impl FullRecord {
    pub fn new(
        signal: f32,
        error_squared: f32,
        run_index: u16,
        detector_id: i32,
        coords: &[f32],
    ) -> Self {
        Self {
            signal,
            error_squared,
            run_index,
            detector_id,
            coords: Coordinates::from_slice(coords),
        }
    }
}

impl Record for FullRecord {
    const KIND: RecordKind = RecordKind::Full;

    fn from_parts(
        signal: f32,
        error_squared: f32,
        coords: &[f32],
        run_index: u16,
        detector_id: i32,
    ) -> Self {
        Self::new(signal, error_squared, run_index, detector_id, coords)
    }

    #[inline]
    fn signal(&self) -> f32 {
        self.signal
    }

    #[inline]
    fn error_squared(&self) -> f32 {
        self.error_squared
    }

    #[inline]
    fn coords(&self) -> &[f32] {
        &self.coords
    }

    fn run_index(&self) -> Option<u16> {
        Some(self.run_index)
    }

    fn detector_id(&self) -> Option<i32> {
        Some(self.detector_id)
    }

    fn offset_run_index(&mut self, offset: u16) {
        self.run_index = self.run_index.wrapping_add(offset);
    }
}
