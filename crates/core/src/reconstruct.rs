//! Stitching of decoded tiles into full-size output images.
//!
//! Tile boundaries are mapped into output space with `floor(x * scale)`, so
//! neighbouring tiles share a boundary and the output spans
//! `floor(N * scale)`. Every tile must start on a whole output pixel; the
//! kept region is then cropped from the decoded tile relative to that
//! pixel, after removing the declared `offset`.

use tracing::debug;

use crate::axis::AxisTag;
use crate::buffer::{ImageBuffer, ImageExtent};
use crate::codec::scale_floor;
use crate::descriptor::TensorDescriptor;
use crate::error::{TilingError, TilingResult};
use crate::tile_grid::TileGeometry;

/// A finished (or partially filled) output image.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputImage {
    pub name: String,
    pub buffer: ImageBuffer,
    pub data_range: Option<[f64; 2]>,
}

#[derive(Debug)]
struct OutputSlot {
    descriptor: TensorDescriptor,
    buffer: Option<ImageBuffer>,
    tile_extent: Option<ImageExtent>,
}

#[derive(Debug)]
pub struct Reconstructor {
    image: [usize; 3],
    fill_value: f32,
    slots: Vec<OutputSlot>,
}

impl Reconstructor {
    /// One output slot per descriptor, in declaration order. Buffers are
    /// allocated when the first tile for that output arrives.
    pub fn new(outputs: &[TensorDescriptor], image: [usize; 3], fill_value: f32) -> Self {
        let slots = outputs
            .iter()
            .map(|descriptor| OutputSlot {
                descriptor: descriptor.clone(),
                buffer: None,
                tile_extent: None,
            })
            .collect();
        Self {
            image,
            fill_value,
            slots,
        }
    }

    /// Spatial extent (`[x, y, z]`) of `descriptor`'s output for an image of
    /// extent `image`.
    pub fn output_extent(descriptor: &TensorDescriptor, image: [usize; 3]) -> [usize; 3] {
        let mut extent = [1usize; 3];
        for (k, tag) in AxisTag::SPATIAL.into_iter().enumerate() {
            if descriptor.has_axis(tag) {
                extent[k] = scale_floor(image[k], descriptor.scale_of(tag));
            }
        }
        extent
    }

    /// Copy the kept region of one decoded tile into the named output.
    pub fn place(
        &mut self,
        name: &str,
        tile: &ImageBuffer,
        geometry: &TileGeometry,
    ) -> TilingResult<()> {
        let image = self.image;
        let fill_value = self.fill_value;
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.descriptor.name == name)
            .ok_or_else(|| TilingError::InvalidDescriptor {
                tensor: name.to_string(),
                reason: "not a declared output".to_string(),
            })?;

        let decoded = tile.extent();
        let inconsistent = |expected: ImageExtent| TilingError::InconsistentOutputShape {
            tensor: name.to_string(),
            tile_index: geometry.index,
            expected: expected.native_shape().to_vec(),
            actual: decoded.native_shape().to_vec(),
        };

        if let Some(first) = slot.tile_extent {
            if first != decoded {
                return Err(inconsistent(first));
            }
        }

        let invalid = |reason: String| TilingError::InvalidDescriptor {
            tensor: name.to_string(),
            reason,
        };
        let mut out_origin = [0usize; 3];
        let mut tile_origin = [0usize; 3];
        let mut span = [1usize; 3];
        for (k, tag) in AxisTag::SPATIAL.into_iter().enumerate() {
            if !slot.descriptor.has_axis(tag) {
                continue;
            }
            let scale = slot.descriptor.scale_of(tag);
            let offset = slot.descriptor.offset_of(tag) as i64;
            let start = scale_floor(geometry.output_origin[k], scale);
            let end = scale_floor(geometry.output_end()[k], scale);

            // Image coordinate of the tile's first pixel, which may lie in
            // the padding before the image.
            let tile_start = geometry.output_origin[k] as i64 - geometry.valid_offset[k] as i64;
            let scaled = tile_start as f64 * scale;
            if (scaled - scaled.round()).abs() > 1e-6 {
                return Err(invalid(format!(
                    "tile {} starts at {tile_start} on axis '{tag}', which is not a whole output pixel at scale {scale}",
                    geometry.index
                )));
            }
            let local = start as i64 - scaled.round() as i64 - offset;
            if local < 0 || local as usize + (end - start) > decoded.get(tag) {
                return Err(invalid(format!(
                    "declared offset {offset} on axis '{tag}' exceeds the halo kept around the tile"
                )));
            }
            out_origin[k] = start;
            tile_origin[k] = local as usize;
            span[k] = end - start;
        }

        let [width, height, depth] = Self::output_extent(&slot.descriptor, image);
        let buffer = slot.buffer.get_or_insert_with(|| {
            debug!(
                output = name,
                width,
                height,
                depth,
                channels = decoded.channels,
                "Allocating output buffer"
            );
            ImageBuffer::filled(ImageExtent::new(width, height, decoded.channels, depth), fill_value)
        });
        slot.tile_extent = Some(decoded);
        buffer
            .region_mut(out_origin, span)
            .assign(&tile.region(tile_origin, span));
        Ok(())
    }

    /// Outputs that received at least one tile, in declaration order.
    pub fn into_outputs(self) -> Vec<OutputImage> {
        self.slots
            .into_iter()
            .filter_map(|slot| {
                slot.buffer.map(|buffer| OutputImage {
                    name: slot.descriptor.name,
                    buffer,
                    data_range: slot.descriptor.data_range,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(valid_offset: usize, valid_extent: usize, output_origin: usize) -> TileGeometry {
        TileGeometry {
            index: 0,
            grid_position: [0; 3],
            source_origin: [0; 3],
            extent: [128, 1, 1],
            valid_offset: [valid_offset, 0, 0],
            valid_extent: [valid_extent, 1, 1],
            output_origin: [output_origin, 0, 0],
        }
    }

    fn ramp(width: usize) -> ImageBuffer {
        let samples = (0..width).map(|v| v as f32).collect();
        ImageBuffer::from_planar(ImageExtent::new(width, 1, 1, 1), samples).unwrap()
    }

    #[test]
    fn output_extent_is_floor_of_scaled_image() {
        let descriptor = TensorDescriptor::new("out", "byxc")
            .unwrap()
            .with_scale(&[1.0, 0.5, 0.5, 1.0]);
        assert_eq!(Reconstructor::output_extent(&descriptor, [513, 512, 1]), [256, 256, 1]);

        let flat = TensorDescriptor::new("flat", "bx").unwrap();
        assert_eq!(Reconstructor::output_extent(&flat, [40, 1, 1]), [40, 1, 1]);
    }

    #[test]
    fn places_scaled_region_after_offset_crop() {
        let descriptor = TensorDescriptor::new("out", "bxc")
            .unwrap()
            .with_scale(&[1.0, 0.5, 1.0])
            .with_offset(&[0, 2, 0]);
        let mut reconstructor = Reconstructor::new(&[descriptor], [512, 1, 1], -1.0);

        // Second tile of a 512/128/16 grid: valid [16, 112) lands at image 64.
        let tile = ramp(60);
        reconstructor
            .place("out", &tile, &geometry(16, 96, 64))
            .unwrap();

        let outputs = reconstructor.into_outputs();
        assert_eq!(outputs.len(), 1);
        let buffer = &outputs[0].buffer;
        assert_eq!(buffer.extent(), ImageExtent::new(256, 1, 1, 1));
        assert_eq!(buffer.get(31, 0, 0, 0), -1.0);
        // Local start is 16 * 0.5 - 2 = 6.
        assert_eq!(buffer.get(32, 0, 0, 0), 6.0);
        assert_eq!(buffer.get(79, 0, 0, 0), 53.0);
        assert_eq!(buffer.get(80, 0, 0, 0), -1.0);
    }

    #[test]
    fn later_tile_with_different_shape_is_rejected() {
        let descriptor = TensorDescriptor::new("out", "bx").unwrap();
        let mut reconstructor = Reconstructor::new(&[descriptor], [64, 1, 1], 0.0);
        reconstructor.place("out", &ramp(32), &geometry(0, 32, 0)).unwrap();

        let mut second = geometry(0, 32, 32);
        second.index = 1;
        assert!(matches!(
            reconstructor.place("out", &ramp(30), &second),
            Err(TilingError::InconsistentOutputShape { tile_index: 1, .. })
        ));
    }

    #[test]
    fn region_outside_decoded_tile_is_rejected() {
        let descriptor = TensorDescriptor::new("out", "bx")
            .unwrap()
            .with_offset(&[0, 4]);
        let mut reconstructor = Reconstructor::new(&[descriptor], [64, 1, 1], 0.0);
        // Offset 4 exceeds the 2 px halo the tile keeps clear.
        assert!(matches!(
            reconstructor.place("out", &ramp(28), &geometry(2, 28, 0)),
            Err(TilingError::InvalidDescriptor { tensor, reason })
                if tensor == "out" && reason.contains("axis 'x'")
        ));
        assert!(reconstructor.into_outputs().is_empty());
    }

    #[test]
    fn tile_starting_between_output_pixels_is_rejected() {
        let descriptor = TensorDescriptor::new("out", "bx")
            .unwrap()
            .with_scale(&[1.0, 0.5]);
        let mut reconstructor = Reconstructor::new(&[descriptor], [64, 1, 1], 0.0);
        // Tile pixel 0 is image pixel 33, half-way between output pixels.
        assert!(matches!(
            reconstructor.place("out", &ramp(64), &geometry(3, 20, 36)),
            Err(TilingError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn neighbouring_scaled_tiles_sample_in_the_same_phase() {
        let descriptor = TensorDescriptor::new("out", "bx")
            .unwrap()
            .with_scale(&[1.0, 0.5]);
        let mut reconstructor = Reconstructor::new(&[descriptor], [50, 1, 1], 0.0);

        // 50/32/4 grid aligned to even origins: tiles start at image -14, 10, 34.
        let starts = [-14i64, 10, 34];
        for (index, &tile_start) in starts.iter().enumerate() {
            let kept_start = (tile_start + 4).max(0) as usize;
            let kept_end = ((tile_start + 28) as usize).min(50);
            let mut kept = geometry(
                (kept_start as i64 - tile_start) as usize,
                kept_end - kept_start,
                kept_start,
            );
            kept.index = index;
            // Each decoded sample holds the image coordinate it came from.
            let samples = (0..16).map(|j| (tile_start + 2 * j) as f32).collect();
            let tile = ImageBuffer::from_planar(ImageExtent::new(16, 1, 1, 1), samples).unwrap();
            reconstructor.place("out", &tile, &kept).unwrap();
        }

        let outputs = reconstructor.into_outputs();
        let buffer = &outputs[0].buffer;
        assert_eq!(buffer.extent().width, 25);
        for x in 0..25 {
            assert_eq!(buffer.get(x, 0, 0, 0), (2 * x) as f32);
        }
    }

    #[test]
    fn unknown_output_name_is_rejected() {
        let mut reconstructor = Reconstructor::new(&[], [8, 1, 1], 0.0);
        assert!(reconstructor
            .place("missing", &ramp(8), &geometry(0, 8, 0))
            .is_err());
        assert!(reconstructor.into_outputs().is_empty());
    }
}
