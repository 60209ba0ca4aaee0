//! Spatio-temporal extent — grid and axis definitions for one query run.
//!
//! The extent supplies the default "self" cube the interpreter starts from
//! and the template every retrieved layer is laid out on. The preview pass
//! asks for a coarsened variant of the same extent: same bounding box and
//! timestamps, spatial grid coerced to a small fixed number of cells.

use super::array::{Coord, Cube, Dimension, ValueType};
use super::{SPACE, TIME};

/// Spatio-temporal extent of a query.
///
/// Spatial coordinates are cell centers expressed in integer CRS units on a
/// regular north-up grid (`origin_x`/`origin_y` is the top-left corner).
/// Temporal coordinates are epoch seconds; `tz_offset` is the output
/// timezone expressed as seconds east of UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    crs: u32,
    origin_x: i64,
    origin_y: i64,
    cell_size: i64,
    cols: usize,
    rows: usize,
    instants: Vec<i64>,
    tz_offset: i32,
}

impl Extent {
    pub fn new(
        crs: u32,
        origin_x: i64,
        origin_y: i64,
        cell_size: i64,
        cols: usize,
        rows: usize,
        instants: Vec<i64>,
        tz_offset: i32,
    ) -> Self {
        Self {
            crs,
            origin_x,
            origin_y,
            cell_size: cell_size.max(1),
            cols,
            rows,
            instants,
            tz_offset,
        }
    }

    pub fn crs(&self) -> u32 {
        self.crs
    }

    pub fn cell_size(&self) -> i64 {
        self.cell_size
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn instants(&self) -> &[i64] {
        &self.instants
    }

    pub fn tz_offset(&self) -> i32 {
        self.tz_offset
    }

    /// Width of the bounding box in CRS units.
    pub fn width(&self) -> i64 {
        self.cols as i64 * self.cell_size
    }

    /// Height of the bounding box in CRS units.
    pub fn height(&self) -> i64 {
        self.rows as i64 * self.cell_size
    }

    /// The temporal dimension: one coordinate per requested instant.
    pub fn time_dim(&self) -> Dimension {
        Dimension::new(TIME, self.instants.iter().map(|&t| Coord::Time(t)).collect())
    }

    /// The stacked spatial dimension: cell centers in row-major order,
    /// starting at the top-left corner and moving down each row.
    pub fn space_dim(&self) -> Dimension {
        let half = self.cell_size / 2;
        let mut coords = Vec::with_capacity(self.rows * self.cols);
        for r in 0..self.rows {
            let y = self.origin_y - half - r as i64 * self.cell_size;
            for c in 0..self.cols {
                let x = self.origin_x + half + c as i64 * self.cell_size;
                coords.push(Coord::Space { y, x });
            }
        }
        Dimension::new(SPACE, coords)
    }

    /// The default "self" cube: value 1 over the full requested extent.
    pub fn cube(&self) -> Cube {
        let dims = vec![self.time_dim(), self.space_dim()];
        Cube::filled(dims, 1.0).with_vtype(Some(ValueType::Binary))
    }

    /// Coarsen to an `n` × `n` spatial grid over the same bounding box and
    /// the same temporal instants. Used by the preview pass; the coarse
    /// values themselves are never reused.
    pub fn coarsen(&self, n: usize) -> Self {
        let n = n.max(1);
        let span = self.width().max(self.height());
        let cell = (span / n as i64).max(1);
        Self {
            crs: self.crs,
            origin_x: self.origin_x,
            origin_y: self.origin_y,
            cell_size: cell,
            cols: n,
            rows: n,
            instants: self.instants.clone(),
            tz_offset: self.tz_offset,
        }
    }

    /// Re-grid the same bounding box at a different cell size.
    pub fn with_resolution(&self, cell_size: i64) -> Self {
        let cell = cell_size.max(1);
        let cols = ((self.width() + cell - 1) / cell).max(1) as usize;
        let rows = ((self.height() + cell - 1) / cell).max(1) as usize;
        Self {
            crs: self.crs,
            origin_x: self.origin_x,
            origin_y: self.origin_y,
            cell_size: cell,
            cols,
            rows,
            instants: self.instants.clone(),
            tz_offset: self.tz_offset,
        }
    }

    /// Same extent with a different output timezone.
    pub fn with_tz_offset(&self, tz_offset: i32) -> Self {
        let mut out = self.clone();
        out.tz_offset = tz_offset;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent_3x4() -> Extent {
        // 4 columns, 3 rows, 10-unit cells, 2 timestamps.
        Extent::new(3857, 1000, 2000, 10, 4, 3, vec![0, 86_400], 0)
    }

    #[test]
    fn test_extent_cube_shape_and_value() {
        let cube = extent_3x4().cube();
        assert_eq!(cube.shape(), vec![2, 12]);
        assert_eq!(cube.vtype(), Some(ValueType::Binary));
        assert!(cube.values().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_space_dim_cell_centers() {
        let dim = extent_3x4().space_dim();
        assert_eq!(dim.coords().len(), 12);
        // Top-left cell center.
        assert_eq!(dim.coords()[0], Coord::Space { y: 1995, x: 1005 });
        // Next cell to the right.
        assert_eq!(dim.coords()[1], Coord::Space { y: 1995, x: 1015 });
        // First cell of the second row.
        assert_eq!(dim.coords()[4], Coord::Space { y: 1985, x: 1005 });
    }

    #[test]
    fn test_coarsen_keeps_bbox_and_instants() {
        let full = extent_3x4();
        let coarse = full.coarsen(5);
        assert_eq!(coarse.cols(), 5);
        assert_eq!(coarse.rows(), 5);
        assert_eq!(coarse.instants(), full.instants());
        assert_eq!(coarse.crs(), full.crs());
        // Grid still starts at the same corner.
        assert_eq!(coarse.space_dim().coords().len(), 25);
    }

    #[test]
    fn test_with_resolution_regrids_bbox() {
        let full = extent_3x4();
        let fine = full.with_resolution(5);
        assert_eq!(fine.cols(), 8);
        assert_eq!(fine.rows(), 6);
        assert_eq!(fine.width(), full.width());
    }
}
