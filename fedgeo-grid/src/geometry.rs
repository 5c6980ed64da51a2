use std::ops::RangeInclusive;

use fedgeo_core::{BucketId, Rectangle};
use serde::{Deserialize, Serialize};

/// Number of spatial dimensions indexed.
pub const DIMS: usize = 2;

/// Relative disagreement tolerated between a published cell width and
/// `(max - min) / k`.
const WIDTH_TOLERANCE: f64 = 1e-9;

/// Cell layout of a uniform grid: `k` cells per dimension over
/// `[min, max]`, each `width` wide. Published to the coordinator as part of
/// the index metadata.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct GridGeometry {
    pub k: u32,
    pub min: [f64; DIMS],
    pub max: [f64; DIMS],
    pub width: [f64; DIMS],
}

impl GridGeometry {
    pub fn new(k: u32, min: [f64; DIMS], max: [f64; DIMS]) -> Self {
        let width = std::array::from_fn(|dim| (max[dim] - min[dim]) / f64::from(k));
        Self { k, min, max, width }
    }

    /// Shape checks applied to geometry received from a peer: finite,
    /// ordered bounds and widths consistent with `(max - min) / k`.
    pub fn is_well_formed(&self) -> bool {
        self.k >= 1
            && (self.k as usize)
                .checked_pow(DIMS as u32)
                .is_some_and(|n| n <= BucketId::MAX as usize)
            && (0..DIMS).all(|dim| {
                let (min, max, width) = (self.min[dim], self.max[dim], self.width[dim]);
                let expected = (max - min) / f64::from(self.k);
                min.is_finite()
                    && max.is_finite()
                    && width.is_finite()
                    && min <= max
                    && width >= 0.0
                    && (width - expected).abs() <= WIDTH_TOLERANCE * expected.abs().max(1.0)
            })
    }

    pub fn num_buckets(&self) -> usize {
        (self.k as usize).pow(DIMS as u32)
    }

    /// Linear offset contributed by one cell step along `dim` (`k^dim`).
    pub fn stride(&self, dim: usize) -> usize {
        (self.k as usize).pow(dim as u32)
    }

    /// `clamp(floor((coord - min) / width), 0, k-1)`; zero-width dimensions
    /// map everything to cell 0.
    pub fn cell_index(&self, dim: usize, coord: f64) -> usize {
        let width = self.width[dim];
        if !(width > 0.0) || coord.is_nan() {
            return 0;
        }
        let raw = ((coord - self.min[dim]) / width).floor();
        if raw <= 0.0 {
            0
        } else {
            (raw as usize).min(self.k as usize - 1)
        }
    }

    pub fn bucket_of(&self, coords: [f64; DIMS]) -> BucketId {
        let cells = std::array::from_fn(|dim| self.cell_index(dim, coords[dim]));
        self.encode(cells)
    }

    pub fn encode(&self, cells: [usize; DIMS]) -> BucketId {
        let id: usize = (0..DIMS).map(|dim| cells[dim] * self.stride(dim)).sum();
        id as BucketId
    }

    pub fn decode(&self, id: BucketId) -> Option<[usize; DIMS]> {
        let id = id as usize;
        if id >= self.num_buckets() {
            return None;
        }
        let k = self.k as usize;
        Some(std::array::from_fn(|dim| (id / self.stride(dim)) % k))
    }

    /// Spatial extent of bucket `id`.
    pub fn bucket_rect(&self, id: BucketId) -> Option<Rectangle> {
        let cells = self.decode(id)?;
        let last = self.k as usize - 1;
        let lo: [f64; DIMS] =
            std::array::from_fn(|dim| self.min[dim] + cells[dim] as f64 * self.width[dim]);
        let hi: [f64; DIMS] = std::array::from_fn(|dim| {
            if cells[dim] == last {
                self.max[dim]
            } else {
                self.min[dim] + (cells[dim] + 1) as f64 * self.width[dim]
            }
        });
        Some(Rectangle::from_bounds(lo[0], lo[1], hi[0], hi[1]))
    }

    /// Buckets overlapping `rect`, as runs of consecutive ids: one run per
    /// combination of cells in dimensions `1..DIMS`, each spanning the
    /// dimension-0 cell range.
    pub fn bucket_intervals(&self, rect: &Rectangle) -> Vec<RangeInclusive<BucketId>> {
        let ranges: [(usize, usize); DIMS] = std::array::from_fn(|dim| {
            (
                self.cell_index(dim, rect.lo(dim)),
                self.cell_index(dim, rect.hi(dim)),
            )
        });
        let mut cursor: [usize; DIMS] = std::array::from_fn(|dim| ranges[dim].0);
        let mut intervals = Vec::new();
        loop {
            let offset: usize = (1..DIMS).map(|dim| cursor[dim] * self.stride(dim)).sum();
            intervals.push(
                (offset + ranges[0].0) as BucketId..=(offset + ranges[0].1) as BucketId,
            );
            let mut dim = 1;
            loop {
                if dim == DIMS {
                    return intervals;
                }
                if cursor[dim] < ranges[dim].1 {
                    cursor[dim] += 1;
                    break;
                }
                cursor[dim] = ranges[dim].0;
                dim += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_ids_are_a_bijection_for_k5() {
        let geometry = GridGeometry::new(5, [0.0, 0.0], [5.0, 5.0]);
        let mut seen = std::collections::BTreeSet::new();
        for cy in 0..5 {
            for cx in 0..5 {
                let id = geometry.encode([cx, cy]);
                assert_eq!(id as usize, cx + 5 * cy);
                assert_eq!(geometry.decode(id), Some([cx, cy]));
                seen.insert(id);
            }
        }
        assert_eq!(seen.len(), 25);
        assert_eq!(seen.iter().max(), Some(&24));
        assert_eq!(geometry.decode(25), None);
    }

    #[test]
    fn cell_index_clamps_to_grid() {
        let geometry = GridGeometry::new(4, [0.0, 0.0], [8.0, 8.0]);
        assert_eq!(geometry.cell_index(0, -3.0), 0);
        assert_eq!(geometry.cell_index(0, 3.9), 1);
        assert_eq!(geometry.cell_index(0, 8.0), 3);
        assert_eq!(geometry.cell_index(1, 100.0), 3);
    }

    #[test]
    fn zero_width_maps_to_cell_zero() {
        let geometry = GridGeometry::new(3, [2.0, 0.0], [2.0, 0.0]);
        assert_eq!(geometry.bucket_of([2.0, 0.0]), 0);
        assert_eq!(geometry.bucket_of([99.0, -4.0]), 0);
    }

    #[test]
    fn intervals_cover_bounding_box_cells() {
        let geometry = GridGeometry::new(4, [0.0, 0.0], [4.0, 4.0]);
        let rect = Rectangle::from_bounds(1.5, 0.5, 2.5, 2.5);
        let intervals = geometry.bucket_intervals(&rect);
        assert_eq!(intervals, vec![1..=2, 5..=6, 9..=10]);
    }

    #[test]
    fn well_formed_requires_consistent_widths() {
        let geometry = GridGeometry::new(4, [0.0, -2.0], [1.0, 6.0]);
        assert!(geometry.is_well_formed());

        let mut inflated = geometry.clone();
        inflated.width = [10.0, 10.0];
        assert!(!inflated.is_well_formed());

        let mut shrunk = geometry.clone();
        shrunk.width[1] = 0.0;
        assert!(!shrunk.is_well_formed());

        let degenerate = GridGeometry::new(3, [5.0, 5.0], [5.0, 5.0]);
        assert!(degenerate.is_well_formed());
    }

    #[test]
    fn last_cell_rect_reaches_max() {
        let geometry = GridGeometry::new(3, [0.0, 0.0], [1.0, 1.0]);
        let rect = geometry.bucket_rect(8).unwrap();
        assert!((rect.max_x() - 1.0).abs() < 1e-12);
        assert!((rect.max_y() - 1.0).abs() < 1e-12);
    }
}
