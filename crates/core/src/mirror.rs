//! Symmetric mirror padding, applied one spatial axis at a time.
//!
//! Reflection is half-sample symmetric: the edge pixel is repeated once at
//! the fold (`... 2 1 0 | 0 1 2 ...`), giving a period of `2N`. Composition of
//! the per-axis passes produces the corners.

use ndarray::{Array5, Axis};

use crate::axis::AxisTag;
use crate::buffer::ImageBuffer;
use crate::error::TilingResult;
use crate::padding::PaddingPlan;

/// Source index for padded coordinate `d` of an axis of length `n` with
/// `before` pixels prepended.
pub fn mirror_index(d: usize, before: usize, n: usize) -> usize {
    debug_assert!(n > 0);
    let period = 2 * n as isize;
    let folded = (d as isize - before as isize).rem_euclid(period) as usize;
    if folded < n {
        folded
    } else {
        2 * n - 1 - folded
    }
}

pub struct MirrorPadder;

impl MirrorPadder {
    /// Pad `source` by the plan's `before`/`after` on x, then y, then z.
    pub fn pad(source: &ImageBuffer, plan: &PaddingPlan) -> TilingResult<ImageBuffer> {
        let mut current: Option<Array5<f32>> = None;

        for axis_plan in &plan.axes {
            if axis_plan.before == 0 && axis_plan.after == 0 {
                continue;
            }
            let input = match &current {
                Some(array) => array.view(),
                None => source.view(),
            };
            let padded = pad_axis(input, axis_plan.axis, axis_plan.before, axis_plan.after);
            current = Some(padded);
        }

        match current {
            Some(array) => ImageBuffer::from_array(array),
            None => Ok(source.clone()),
        }
    }
}

fn pad_axis(
    input: ndarray::ArrayView5<'_, f32>,
    axis: AxisTag,
    before: usize,
    after: usize,
) -> Array5<f32> {
    let index = axis.native_index();
    let n = input.len_of(Axis(index));

    let mut shape = [0usize; 5];
    shape.copy_from_slice(input.shape());
    shape[index] = before + n + after;

    let mut out = Array5::<f32>::zeros(shape);
    for (d, mut lane) in out.axis_iter_mut(Axis(index)).enumerate() {
        let src = mirror_index(d, before, n);
        lane.assign(&input.index_axis(Axis(index), src));
    }
    out
}
