//! Axis-aligned extents of a box in `nd` dimensions.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{Display, Formatter};

use crate::constants::VOLUME_EPSILON;
use crate::errors::{BoxResult, BoxTreeError};

/// `(min, max)` of one dimension
pub type Bounds = (f64, f64);

/// N-dimensional extents of a box.
///
/// Sub-boxes produced by [`BoxExtents::subdivide`] are numbered with
/// dimension 0 varying fastest, which is the same order
/// [`BoxExtents::child_index`] uses to route a coordinate to a child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxExtents {
    bounds: SmallVec<[Bounds; 4]>,
}

impl BoxExtents {
    pub fn new(bounds: &[Bounds]) -> Self {
        Self {
            bounds: SmallVec::from_slice(bounds),
        }
    }

    /// The same `(min, max)` in every dimension
    pub fn uniform(nd: usize, min: f64, max: f64) -> Self {
        Self {
            bounds: SmallVec::from_elem((min, max), nd),
        }
    }

    /// Rebuild from the flat `[min0, max0, min1, max1, ...]` layout
    pub fn from_flat(flat: &[f64]) -> BoxResult<Self> {
        if flat.len() % 2 != 0 {
            return Err(BoxTreeError::FormatMismatch(format!(
                "extents row has odd length {}",
                flat.len()
            )));
        }
        Ok(Self {
            bounds: flat.chunks_exact(2).map(|p| (p[0], p[1])).collect(),
        })
    }

    /// Append the flat `[min0, max0, ...]` layout to `out`
    pub fn write_flat(&self, out: &mut Vec<f64>) {
        for &(min, max) in &self.bounds {
            out.push(min);
            out.push(max);
        }
    }

    #[inline]
    pub fn nd(&self) -> usize {
        self.bounds.len()
    }

    #[inline]
    pub fn bounds(&self) -> &[Bounds] {
        &self.bounds
    }

    #[inline]
    pub fn min(&self, dim: usize) -> f64 {
        self.bounds[dim].0
    }

    #[inline]
    pub fn max(&self, dim: usize) -> f64 {
        self.bounds[dim].1
    }

    #[inline]
    pub fn width(&self, dim: usize) -> f64 {
        self.bounds[dim].1 - self.bounds[dim].0
    }

    pub fn volume(&self) -> f64 {
        (0..self.nd()).map(|d| self.width(d)).product()
    }

    /// `1 / volume`, or 1 when the volume is degenerate
    pub fn inverse_volume(&self) -> f64 {
        let volume = self.volume();
        if volume.abs() < VOLUME_EPSILON {
            1.0
        } else {
            1.0 / volume
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.volume().abs() < VOLUME_EPSILON
    }

    /// Whether the point lies inside, upper edges included
    pub fn contains(&self, coords: &[f32]) -> bool {
        coords.len() == self.nd()
            && self
                .bounds
                .iter()
                .zip(coords)
                .all(|(&(min, max), &c)| (c as f64) >= min && (c as f64) <= max)
    }

    /// Index of the child of a `branching` subdivision that receives `coords`.
    ///
    /// Points outside the extents are clamped to the nearest child.
    pub fn child_index(&self, coords: &[f32], branching: &[u32]) -> usize {
        let mut index = 0usize;
        let mut stride = 1usize;
        for (d, &b) in branching.iter().enumerate() {
            let width = self.width(d);
            let slot = if width > 0.0 {
                let frac = (coords[d] as f64 - self.min(d)) / width;
                ((frac * b as f64).floor().max(0.0) as usize).min(b as usize - 1)
            } else {
                0
            };
            index += slot * stride;
            stride *= b as usize;
        }
        index
    }

    /// Split every dimension into `branching[d]` equal intervals
    pub fn subdivide(&self, branching: &[u32]) -> Vec<BoxExtents> {
        let total: usize = branching.iter().map(|&b| b as usize).product();
        let mut children = Vec::with_capacity(total);
        for k in 0..total {
            let mut rest = k;
            let mut bounds = SmallVec::with_capacity(self.nd());
            for (d, &b) in branching.iter().enumerate() {
                let b = b as usize;
                let slot = rest % b;
                rest /= b;
                let step = self.width(d) / b as f64;
                let min = self.min(d) + step * slot as f64;
                let max = if slot + 1 == b {
                    self.max(d)
                } else {
                    self.min(d) + step * (slot + 1) as f64
                };
                bounds.push((min, max));
            }
            children.push(BoxExtents { bounds });
        }
        children
    }

    /// Smallest extents enclosing both
    pub fn union(&self, other: &BoxExtents) -> BoxResult<BoxExtents> {
        if self.nd() != other.nd() {
            return Err(BoxTreeError::FormatMismatch(format!(
                "cannot combine {}-dimensional and {}-dimensional extents",
                self.nd(),
                other.nd()
            )));
        }
        Ok(BoxExtents {
            bounds: self
                .bounds
                .iter()
                .zip(&other.bounds)
                .map(|(a, b)| (a.0.min(b.0), a.1.max(b.1)))
                .collect(),
        })
    }
}

impl Display for BoxExtents {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BoxExtents(")?;
        for (i, (min, max)) in self.bounds.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "[{}, {}]", min, max)?;
        }
        write!(f, ")")
    }
}
