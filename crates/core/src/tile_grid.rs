//! Lazy enumeration of tile geometry over a padded image.
//!
//! The grid is anchored at padded coordinate 0 with a cell size of `roi` per
//! axis. Because padding is centred, the image starts `shift = before - halo`
//! pixels into the first cell's kept window; every tile's valid window is
//! clipped to the image so that the windows partition `[0, N)` on each axis.

use serde::Serialize;

use crate::padding::{AxisPlan, PaddingPlan};

/// Placement of one tile. All triples are indexed `[x, y, z]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileGeometry {
    /// Row-major position in the grid, x fastest.
    pub index: usize,
    pub grid_position: [usize; 3],
    /// Offset into the padded input buffer.
    pub source_origin: [usize; 3],
    /// Tile extent, equal to the patch.
    pub extent: [usize; 3],
    /// Start of the kept region in tile-local coordinates.
    pub valid_offset: [usize; 3],
    pub valid_extent: [usize; 3],
    /// Start of the kept region in unpadded image coordinates.
    pub output_origin: [usize; 3],
}

impl TileGeometry {
    /// Exclusive end of the kept region in image coordinates.
    pub fn output_end(&self) -> [usize; 3] {
        [0, 1, 2].map(|k| self.output_origin[k] + self.valid_extent[k])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AxisSpan {
    source_origin: usize,
    valid_offset: usize,
    valid_extent: usize,
    output_origin: usize,
}

fn axis_span(plan: &AxisPlan, i: usize) -> AxisSpan {
    let shift = plan.shift();
    let source_origin = i * plan.roi;
    // Kept window in image coordinates is [start - shift, end - shift).
    let start = source_origin;
    let end = source_origin + plan.roi;
    let clipped_start = start.max(shift);
    let clipped_end = end.min(shift + plan.image);

    AxisSpan {
        source_origin,
        valid_offset: plan.halo + (clipped_start - start),
        valid_extent: clipped_end - clipped_start,
        output_origin: clipped_start - shift,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    plan: PaddingPlan,
}

impl TileGrid {
    pub fn new(plan: PaddingPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &PaddingPlan {
        &self.plan
    }

    pub fn len(&self) -> usize {
        self.plan.total_tiles()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Geometry of the `index`-th tile in row-major order.
    pub fn tile(&self, index: usize) -> Option<TileGeometry> {
        if index >= self.len() {
            return None;
        }
        let [nx, ny, _] = self.plan.tiles_per_axis();
        let grid_position = [index % nx, (index / nx) % ny, index / (nx * ny)];

        let spans = [0, 1, 2].map(|k| axis_span(&self.plan.axes[k], grid_position[k]));
        Some(TileGeometry {
            index,
            grid_position,
            source_origin: spans.map(|s| s.source_origin),
            extent: self.plan.patch(),
            valid_offset: spans.map(|s| s.valid_offset),
            valid_extent: spans.map(|s| s.valid_extent),
            output_origin: spans.map(|s| s.output_origin),
        })
    }

    pub fn iter(&self) -> TileIter<'_> {
        TileIter {
            grid: self,
            next: 0,
        }
    }
}

impl<'a> IntoIterator for &'a TileGrid {
    type Item = TileGeometry;
    type IntoIter = TileIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct TileIter<'a> {
    grid: &'a TileGrid,
    next: usize,
}

impl Iterator for TileIter<'_> {
    type Item = TileGeometry;

    fn next(&mut self) -> Option<Self::Item> {
        let tile = self.grid.tile(self.next)?;
        self.next += 1;
        Some(tile)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grid.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TileIter<'_> {}
