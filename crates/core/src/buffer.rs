//! Dense multi-axis pixel buffer in native `[x, y, c, z, b]` order.

use ndarray::{s, Array5, ArrayView5, ArrayViewMut5};

use crate::axis::AxisTag;
use crate::error::{TilingError, TilingResult};

/// Extent of an [`ImageBuffer`]. Batch is always 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageExtent {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub depth: usize,
}

impl ImageExtent {
    pub fn new(width: usize, height: usize, channels: usize, depth: usize) -> Self {
        Self {
            width,
            height,
            channels,
            depth,
        }
    }

    pub fn get(&self, tag: AxisTag) -> usize {
        match tag {
            AxisTag::Width => self.width,
            AxisTag::Height => self.height,
            AxisTag::Channel => self.channels,
            AxisTag::Depth => self.depth,
            AxisTag::Batch => 1,
        }
    }

    /// `[x, y, z]`
    pub fn spatial(&self) -> [usize; 3] {
        [self.width, self.height, self.depth]
    }

    pub fn native_shape(&self) -> [usize; 5] {
        [self.width, self.height, self.channels, self.depth, 1]
    }

    pub fn from_native_shape(shape: &[usize]) -> Self {
        Self::new(shape[0], shape[1], shape[2], shape[3])
    }

    pub fn len(&self) -> usize {
        self.width * self.height * self.channels * self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    data: Array5<f32>,
}

impl ImageBuffer {
    pub fn filled(extent: ImageExtent, value: f32) -> Self {
        Self {
            data: Array5::from_elem(extent.native_shape(), value),
        }
    }

    pub fn zeros(extent: ImageExtent) -> Self {
        Self::filled(extent, 0.0)
    }

    /// Build from samples laid out `x` fastest, then `y`, `c`, `z`.
    ///
    /// This is the plane-by-plane order hosts usually hand pixels over in.
    pub fn from_planar(extent: ImageExtent, samples: Vec<f32>) -> TilingResult<Self> {
        let expected = extent.len();
        if samples.len() != expected {
            return Err(TilingError::InvalidDescriptor {
                tensor: "image".to_string(),
                reason: format!("expected {expected} samples, got {}", samples.len()),
            });
        }
        let shape = (1, extent.depth, extent.channels, extent.height, extent.width);
        let zcyx = Array5::from_shape_vec(shape, samples).map_err(|e| {
            TilingError::InvalidDescriptor {
                tensor: "image".to_string(),
                reason: e.to_string(),
            }
        })?;
        let data = zcyx
            .permuted_axes([4, 3, 2, 1, 0])
            .as_standard_layout()
            .into_owned();
        Ok(Self { data })
    }

    /// Wrap an existing native-order array.
    pub fn from_array(data: Array5<f32>) -> TilingResult<Self> {
        let batch = data.shape()[4];
        if batch != 1 {
            return Err(TilingError::BatchSizeBiggerThanOne {
                tensor: "image".to_string(),
                batch,
            });
        }
        Ok(Self { data })
    }

    pub fn extent(&self) -> ImageExtent {
        ImageExtent::from_native_shape(self.data.shape())
    }

    pub fn get(&self, x: usize, y: usize, c: usize, z: usize) -> f32 {
        self.data[[x, y, c, z, 0]]
    }

    pub fn set(&mut self, x: usize, y: usize, c: usize, z: usize, value: f32) {
        self.data[[x, y, c, z, 0]] = value;
    }

    pub fn view(&self) -> ArrayView5<'_, f32> {
        self.data.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMut5<'_, f32> {
        self.data.view_mut()
    }

    /// Spatial sub-region covering all channels.
    pub fn region(&self, origin: [usize; 3], extent: [usize; 3]) -> ArrayView5<'_, f32> {
        self.data.slice(s![
            origin[0]..origin[0] + extent[0],
            origin[1]..origin[1] + extent[1],
            ..,
            origin[2]..origin[2] + extent[2],
            ..
        ])
    }

    pub fn region_mut(
        &mut self,
        origin: [usize; 3],
        extent: [usize; 3],
    ) -> ArrayViewMut5<'_, f32> {
        self.data.slice_mut(s![
            origin[0]..origin[0] + extent[0],
            origin[1]..origin[1] + extent[1],
            ..,
            origin[2]..origin[2] + extent[2],
            ..
        ])
    }

    /// Samples in the same `x`-fastest order [`ImageBuffer::from_planar`] takes.
    pub fn to_planar(&self) -> Vec<f32> {
        self.data
            .view()
            .permuted_axes([4, 3, 2, 1, 0])
            .iter()
            .copied()
            .collect()
    }

    pub fn into_array(self) -> Array5<f32> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planar_round_trip_keeps_x_fastest_order() {
        let extent = ImageExtent::new(3, 2, 2, 1);
        let samples: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let buffer = ImageBuffer::from_planar(extent, samples.clone()).unwrap();

        assert_eq!(buffer.extent(), extent);
        assert_eq!(buffer.get(1, 0, 0, 0), 1.0);
        assert_eq!(buffer.get(0, 1, 0, 0), 3.0);
        assert_eq!(buffer.get(0, 0, 1, 0), 6.0);
        assert_eq!(buffer.to_planar(), samples);
    }

    #[test]
    fn from_planar_rejects_wrong_length() {
        let extent = ImageExtent::new(4, 4, 1, 1);
        assert!(ImageBuffer::from_planar(extent, vec![0.0; 15]).is_err());
    }

    #[test]
    fn region_views_cover_all_channels() {
        let mut buffer = ImageBuffer::zeros(ImageExtent::new(8, 6, 3, 1));
        buffer.region_mut([2, 1, 0], [3, 2, 1]).fill(5.0);

        let region = buffer.region([2, 1, 0], [3, 2, 1]);
        assert_eq!(region.shape(), &[3, 2, 3, 1, 1]);
        assert!(region.iter().all(|v| *v == 5.0));
        assert_eq!(buffer.get(1, 1, 0, 0), 0.0);
        assert_eq!(buffer.get(5, 1, 2, 0), 0.0);
    }
}
