//! Mirror-padding amounts needed to cover an image with whole tiles.
//!
//! Per spatial axis, with image extent `N`, patch `P` and halo `H`:
//! `roi = P - 2H`, `tiles = ceil(N / roi)`, and the padded extent is
//! `tiles * roi + 2H`. The extra pixels are split as evenly as possible,
//! the smaller half going before the image. When outputs are scaled, the
//! split is nudged (and a tile added if needed) so that `before` is a
//! multiple of the output sampling period.

use serde::Serialize;

use crate::axis::AxisTag;
use crate::error::{TilingError, TilingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AxisPlan {
    pub axis: AxisTag,
    pub image: usize,
    pub patch: usize,
    pub halo: usize,
    pub roi: usize,
    pub tiles: usize,
    pub before: usize,
    pub after: usize,
}

impl AxisPlan {
    pub fn padded(&self) -> usize {
        self.before + self.image + self.after
    }

    /// Distance from the first tile's kept region to the image start.
    pub fn shift(&self) -> usize {
        self.before - self.halo
    }
}

/// Padding and tile counts for the `[x, y, z]` axes of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PaddingPlan {
    pub axes: [AxisPlan; 3],
}

impl PaddingPlan {
    pub fn axis(&self, tag: AxisTag) -> Option<&AxisPlan> {
        tag.spatial_index().map(|index| &self.axes[index])
    }

    pub fn before(&self) -> [usize; 3] {
        self.axes.map(|plan| plan.before)
    }

    pub fn after(&self) -> [usize; 3] {
        self.axes.map(|plan| plan.after)
    }

    pub fn padded_extent(&self) -> [usize; 3] {
        self.axes.map(|plan| plan.padded())
    }

    pub fn patch(&self) -> [usize; 3] {
        self.axes.map(|plan| plan.patch)
    }

    pub fn tiles_per_axis(&self) -> [usize; 3] {
        self.axes.map(|plan| plan.tiles)
    }

    pub fn total_tiles(&self) -> usize {
        self.axes.iter().map(|plan| plan.tiles).product()
    }
}

pub struct PaddingPlanner;

impl PaddingPlanner {
    /// Plan all three spatial axes; each argument is indexed `[x, y, z]`.
    pub fn plan(image: [usize; 3], patch: [usize; 3], halo: [usize; 3]) -> TilingResult<PaddingPlan> {
        Self::plan_aligned(image, patch, halo, [1; 3])
    }

    /// Like [`PaddingPlanner::plan`], with every tile's image-space origin a
    /// multiple of `period[k]` so that scaled outputs sample each tile in the
    /// same phase.
    pub fn plan_aligned(
        image: [usize; 3],
        patch: [usize; 3],
        halo: [usize; 3],
        period: [usize; 3],
    ) -> TilingResult<PaddingPlan> {
        let x = Self::plan_axis_aligned(AxisTag::Width, image[0], patch[0], halo[0], period[0])?;
        let y = Self::plan_axis_aligned(AxisTag::Height, image[1], patch[1], halo[1], period[1])?;
        let z = Self::plan_axis_aligned(AxisTag::Depth, image[2], patch[2], halo[2], period[2])?;
        Ok(PaddingPlan { axes: [x, y, z] })
    }

    pub fn plan_axis(axis: AxisTag, image: usize, patch: usize, halo: usize) -> TilingResult<AxisPlan> {
        Self::plan_axis_aligned(axis, image, patch, halo, 1)
    }

    pub fn plan_axis_aligned(
        axis: AxisTag,
        image: usize,
        patch: usize,
        halo: usize,
        period: usize,
    ) -> TilingResult<AxisPlan> {
        if image == 0 {
            return Err(TilingError::EmptyImage { axis });
        }
        let invalid = |reason| TilingError::InvalidTileGeometry {
            axis,
            patch,
            halo,
            reason,
        };
        if patch == 0 {
            return Err(invalid("patch must be positive"));
        }
        if 2 * halo >= patch {
            return Err(invalid("halo must be less than half the patch"));
        }
        if patch >= 3 * image {
            return Err(TilingError::TileTooLarge { axis, patch, image });
        }

        let period = period.max(1);
        let roi = patch - 2 * halo;
        if roi % period != 0 {
            return Err(invalid(
                "tile stride is not a whole number of output pixels at this scale",
            ));
        }

        // The kept window of tile i is [i*roi - shift, (i+1)*roi - shift) in
        // image coordinates, and `before = halo + shift` must be a multiple
        // of `period`.
        let mut tiles = image.div_ceil(roi);
        let slack = tiles * roi - image;
        let residue = (period - halo % period) % period;
        let shift = if residue > slack {
            tiles += 1;
            residue
        } else if residue > slack / 2 {
            residue
        } else {
            residue + (slack / 2 - residue) / period * period
        };

        let before = halo + shift;
        let after = tiles * roi + 2 * halo - image - before;

        Ok(AxisPlan {
            axis,
            image,
            patch,
            halo,
            roi,
            tiles,
            before,
            after,
        })
    }
}

/// Smallest stride `g <= limit` such that `g * scale` is a whole number for
/// every scale, or `None` if there is none.
pub fn sampling_period(scales: impl IntoIterator<Item = f64>, limit: usize) -> Option<usize> {
    let mut period = 1usize;
    for scale in scales {
        let own = (1..=limit.max(1)).find(|&g| {
            let scaled = g as f64 * scale;
            (scaled - scaled.round()).abs() < 1e-6
        })?;
        period = period / gcd(period, own) * own;
        if period > limit.max(1) {
            return None;
        }
    }
    Some(period)
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_extra_pixels_around_the_image() {
        let plan = PaddingPlanner::plan_axis(AxisTag::Width, 512, 128, 16).unwrap();
        assert_eq!(plan.roi, 96);
        assert_eq!(plan.tiles, 6);
        assert_eq!(plan.padded(), 6 * 96 + 32);
        assert_eq!(plan.before, 48);
        assert_eq!(plan.after, 48);
        assert_eq!(plan.shift(), 32);
    }

    #[test]
    fn odd_extra_puts_the_larger_half_after() {
        let plan = PaddingPlanner::plan_axis(AxisTag::Height, 10, 8, 1).unwrap();
        // roi 6, 2 tiles, span 14, extra 4.
        assert_eq!((plan.before, plan.after), (2, 2));

        let plan = PaddingPlanner::plan_axis(AxisTag::Height, 11, 8, 1).unwrap();
        assert_eq!((plan.before, plan.after), (1, 2));
    }

    #[test]
    fn padding_is_balanced_and_never_below_halo() {
        for image in 1..60 {
            for patch in 1..40 {
                for halo in 0..=patch / 2 {
                    let Ok(plan) = PaddingPlanner::plan_axis(AxisTag::Width, image, patch, halo)
                    else {
                        continue;
                    };
                    assert!(plan.before.abs_diff(plan.after) <= 1);
                    assert!(plan.before >= halo);
                    assert!(plan.shift() < plan.roi);
                    assert!(plan.padded() >= plan.tiles * plan.roi + 2 * halo);
                }
            }
        }
    }

    #[test]
    fn rejects_degenerate_geometry() {
        assert!(matches!(
            PaddingPlanner::plan_axis(AxisTag::Width, 64, 16, 8),
            Err(TilingError::InvalidTileGeometry { .. })
        ));
        assert!(matches!(
            PaddingPlanner::plan_axis(AxisTag::Width, 64, 0, 0),
            Err(TilingError::InvalidTileGeometry { .. })
        ));
        assert!(matches!(
            PaddingPlanner::plan_axis(AxisTag::Width, 0, 16, 0),
            Err(TilingError::EmptyImage { .. })
        ));
    }

    #[test]
    fn rejects_patch_of_three_image_extents() {
        assert!(matches!(
            PaddingPlanner::plan_axis(AxisTag::Width, 10, 30, 2),
            Err(TilingError::TileTooLarge { patch: 30, image: 10, .. })
        ));
        assert!(PaddingPlanner::plan_axis(AxisTag::Width, 10, 29, 2).is_ok());
        // A single-slice axis with a single-slice patch is the 2-D case.
        assert!(PaddingPlanner::plan_axis(AxisTag::Depth, 1, 1, 0).is_ok());
    }

    #[test]
    fn aligned_origins_are_whole_periods() {
        for image in 1..70 {
            for patch in (2..40).step_by(2) {
                for halo in 0..patch / 2 {
                    for period in [1, 2, 3, 4] {
                        let Ok(plan) = PaddingPlanner::plan_axis_aligned(
                            AxisTag::Width,
                            image,
                            patch,
                            halo,
                            period,
                        ) else {
                            continue;
                        };
                        assert_eq!(plan.before % period, 0, "{image}/{patch}/{halo}/{period}");
                        assert!(plan.before >= halo);
                        assert!(plan.shift() < plan.roi);
                        assert!(plan.tiles * plan.roi - plan.shift() >= image);
                        assert!((plan.tiles - 1) * plan.roi < image + plan.shift());
                        assert_eq!(plan.padded(), plan.tiles * plan.roi + 2 * halo);
                        if period == 1 {
                            assert!(plan.before.abs_diff(plan.after) <= 1);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn alignment_keeps_the_split_near_the_middle() {
        // roi 24, 3 tiles, 22 spare pixels: an even shift of 10 instead of 11.
        let plan = PaddingPlanner::plan_axis_aligned(AxisTag::Width, 50, 32, 4, 2).unwrap();
        assert_eq!((plan.tiles, plan.before, plan.after), (3, 14, 16));
        assert_eq!(plan.shift(), 10);
    }

    #[test]
    fn alignment_adds_a_tile_when_the_image_fills_the_grid() {
        // roi 12 covers 24 exactly, but an odd halo needs a shift of 1.
        let plan = PaddingPlanner::plan_axis_aligned(AxisTag::Width, 24, 14, 1, 2).unwrap();
        assert_eq!((plan.tiles, plan.before, plan.after), (3, 2, 12));
    }

    #[test]
    fn stride_must_be_a_whole_number_of_periods() {
        assert!(matches!(
            PaddingPlanner::plan_axis_aligned(AxisTag::Height, 64, 15, 2, 2),
            Err(TilingError::InvalidTileGeometry { axis: AxisTag::Height, .. })
        ));
        assert!(PaddingPlanner::plan_axis_aligned(AxisTag::Height, 64, 15, 2, 3).is_err());
        assert!(PaddingPlanner::plan_axis_aligned(AxisTag::Height, 64, 16, 2, 4).is_ok());
    }

    #[test]
    fn sampling_period_of_output_scales() {
        assert_eq!(sampling_period([1.0], 32), Some(1));
        assert_eq!(sampling_period([0.5], 32), Some(2));
        assert_eq!(sampling_period([2.0], 32), Some(1));
        assert_eq!(sampling_period([1.5], 32), Some(2));
        assert_eq!(sampling_period([1.0 / 3.0], 32), Some(3));
        assert_eq!(sampling_period([0.5, 1.0 / 3.0], 32), Some(6));
        assert_eq!(sampling_period([0.5, 1.0 / 3.0], 4), None);
        assert_eq!(sampling_period([0.3], 8), None);
        assert_eq!(sampling_period(std::iter::empty(), 8), Some(1));
    }

    #[test]
    fn plan_collects_all_axes() {
        let plan = PaddingPlanner::plan([100, 50, 1], [32, 32, 1], [4, 4, 0]).unwrap();
        assert_eq!(plan.tiles_per_axis(), [5, 3, 1]);
        assert_eq!(plan.total_tiles(), 15);
        assert_eq!(plan.axis(AxisTag::Depth).unwrap().padded(), 1);
        assert!(plan.axis(AxisTag::Channel).is_none());
    }
}
