//! Conversion between native image regions and axis-ordered model tensors.
//!
//! Encoding permutes a `[x, y, c, z, b]` region into the tensor's declared
//! axis order and drops axes the tensor does not carry (they must have extent
//! 1). Decoding is the inverse. Outputs declared without an axis form have
//! their axes resolved by matching sizes against the expected output extent;
//! a size that fits more than one axis is an error rather than a guess.

use ndarray::{ArrayD, Axis, Ix5, IxDyn};

use crate::axis::{AxisForm, AxisTag, MAX_RANK};
use crate::buffer::ImageBuffer;
use crate::descriptor::TensorDescriptor;
use crate::error::{TilingError, TilingResult};

/// Spatial extent (`[x, y, z]`) an output tile should decode to for an input
/// tile of `tile_extent`: the scaled tile minus `offset` on each side.
pub fn expected_output_extent(descriptor: &TensorDescriptor, tile_extent: [usize; 3]) -> [usize; 3] {
    let mut expected = [0usize; 3];
    for (k, tag) in AxisTag::SPATIAL.into_iter().enumerate() {
        let scaled = scale_floor(tile_extent[k], descriptor.scale_of(tag));
        expected[k] = scaled.saturating_sub(2 * descriptor.offset_of(tag));
    }
    expected
}

/// `floor(value * scale)`, tolerant of products that land a hair under an integer.
pub fn scale_floor(value: usize, scale: f64) -> usize {
    (value as f64 * scale + 1e-6).floor() as usize
}

pub struct TensorCodec;

impl TensorCodec {
    /// Copy the `[x, y, z]` region at `origin` into a tensor laid out by the
    /// descriptor's axis form.
    pub fn encode(
        buffer: &ImageBuffer,
        origin: [usize; 3],
        extent: [usize; 3],
        descriptor: &TensorDescriptor,
    ) -> TilingResult<ArrayD<f32>> {
        let form = descriptor
            .axis_form
            .as_ref()
            .ok_or_else(|| TilingError::InvalidDescriptor {
                tensor: descriptor.name.clone(),
                reason: "cannot encode a tensor without an axis form".to_string(),
            })?;
        if form.len() > MAX_RANK {
            return Err(TilingError::UnsupportedRank {
                tensor: descriptor.name.clone(),
                rank: form.len(),
            });
        }

        let region = buffer.region(origin, extent);
        let absent: Vec<AxisTag> = AxisTag::NATIVE
            .into_iter()
            .filter(|tag| !form.contains(*tag))
            .collect();
        for tag in &absent {
            let len = region.len_of(Axis(tag.native_index()));
            if len != 1 {
                return Err(absent_axis_error(descriptor, *tag, len));
            }
        }

        let order: Vec<usize> = form
            .iter()
            .chain(absent.iter().copied())
            .map(AxisTag::native_index)
            .collect();
        let shape: Vec<usize> = form
            .iter()
            .map(|tag| region.len_of(Axis(tag.native_index())))
            .collect();

        region
            .into_dyn()
            .permuted_axes(order)
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order(IxDyn(&shape))
            .map_err(|e| TilingError::InvalidDescriptor {
                tensor: descriptor.name.clone(),
                reason: e.to_string(),
            })
    }

    /// Convert a backend output tensor back into a native buffer.
    ///
    /// `expected` is the spatial extent the tile should have (see
    /// [`expected_output_extent`]); it is only consulted for untagged outputs.
    pub fn decode(
        tensor: &ArrayD<f32>,
        descriptor: &TensorDescriptor,
        expected: [usize; 3],
    ) -> TilingResult<ImageBuffer> {
        let form = match &descriptor.axis_form {
            Some(form) => form.clone(),
            None => resolve_axes(&descriptor.name, tensor.shape(), expected)?,
        };

        if tensor.ndim() != form.len() {
            return Err(TilingError::RankMismatch {
                tensor: descriptor.name.clone(),
                expected: form.len(),
                actual: tensor.ndim(),
            });
        }
        if let Some(position) = form.position(AxisTag::Batch) {
            let batch = tensor.shape()[position];
            if batch > 1 {
                return Err(TilingError::BatchSizeBiggerThanOne {
                    tensor: descriptor.name.clone(),
                    batch,
                });
            }
        }

        let mut order: Vec<AxisTag> = form.tags().to_vec();
        let mut view = tensor.view();
        for tag in AxisTag::NATIVE {
            if !form.contains(tag) {
                view.insert_axis_inplace(Axis(view.ndim()));
                order.push(tag);
            }
        }
        let permutation: Vec<usize> = AxisTag::NATIVE
            .iter()
            .filter_map(|tag| order.iter().position(|t| t == tag))
            .collect();

        let native = view
            .permuted_axes(permutation)
            .into_dimensionality::<Ix5>()
            .map_err(|e| TilingError::InvalidDescriptor {
                tensor: descriptor.name.clone(),
                reason: e.to_string(),
            })?
            .as_standard_layout()
            .into_owned();
        ImageBuffer::from_array(native)
    }
}

/// Infer the axis form of an untagged tensor from its shape.
///
/// Non-unit axes are matched by size against the expected width, height and
/// depth; a size matching more than one of them, or one of them matched
/// twice, is ambiguous. One unmatched non-unit axis is taken as channels.
/// Unit axes are then handed out leftmost first: batch, any spatial axis
/// expected to be 1, and finally channel.
pub fn resolve_axes(name: &str, shape: &[usize], expected: [usize; 3]) -> TilingResult<AxisForm> {
    let ambiguous = |reason: String| TilingError::AmbiguousAxisMapping {
        tensor: name.to_string(),
        shape: shape.to_vec(),
        reason,
    };
    if shape.len() > MAX_RANK {
        return Err(TilingError::UnsupportedRank {
            tensor: name.to_string(),
            rank: shape.len(),
        });
    }

    let mut assigned: Vec<Option<AxisTag>> = vec![None; shape.len()];
    let taken = |assigned: &[Option<AxisTag>], tag: AxisTag| assigned.contains(&Some(tag));

    for (position, &size) in shape.iter().enumerate() {
        if size <= 1 {
            continue;
        }
        let candidates: Vec<AxisTag> = AxisTag::SPATIAL
            .into_iter()
            .zip(expected)
            .filter(|(_, extent)| *extent == size)
            .map(|(tag, _)| tag)
            .collect();

        let tag = match candidates.as_slice() {
            [tag] => *tag,
            [] => AxisTag::Channel,
            _ => {
                let names: Vec<String> = candidates.iter().map(ToString::to_string).collect();
                return Err(ambiguous(format!(
                    "extent {size} fits axes {}",
                    names.join(", ")
                )));
            }
        };
        if taken(&assigned, tag) {
            return Err(ambiguous(format!(
                "more than one axis of extent {size} could be '{tag}'"
            )));
        }
        assigned[position] = Some(tag);
    }

    let mut unit_slots: Vec<AxisTag> = vec![AxisTag::Batch];
    unit_slots.extend(
        AxisTag::SPATIAL
            .into_iter()
            .zip(expected)
            .filter(|(tag, extent)| *extent <= 1 && !taken(&assigned, *tag))
            .map(|(tag, _)| tag),
    );
    if !taken(&assigned, AxisTag::Channel) {
        unit_slots.push(AxisTag::Channel);
    }
    let mut unit_slots = unit_slots.into_iter();
    for (position, &size) in shape.iter().enumerate() {
        if size <= 1 {
            let tag = unit_slots
                .next()
                .ok_or_else(|| ambiguous(format!("no axis left for unit axis {position}")))?;
            assigned[position] = Some(tag);
        }
    }

    for (tag, extent) in AxisTag::SPATIAL.into_iter().zip(expected) {
        if extent > 1 && !taken(&assigned, tag) {
            return Err(ambiguous(format!("no axis has the expected '{tag}' extent {extent}")));
        }
    }

    let tags: Vec<AxisTag> = assigned.into_iter().flatten().collect();
    AxisForm::from_tags(&tags).map_err(|e| ambiguous(e.to_string()))
}

fn absent_axis_error(descriptor: &TensorDescriptor, tag: AxisTag, actual: usize) -> TilingError {
    match tag {
        AxisTag::Channel => TilingError::ChannelMismatch {
            tensor: descriptor.name.clone(),
            expected: 1,
            actual,
        },
        AxisTag::Depth => TilingError::DepthMismatch {
            tensor: descriptor.name.clone(),
            expected: 1,
            actual,
        },
        _ => TilingError::InvalidDescriptor {
            tensor: descriptor.name.clone(),
            reason: format!("axis '{tag}' is missing but the region spans {actual}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ImageExtent;

    fn ramp(extent: ImageExtent) -> ImageBuffer {
        let samples = (0..extent.len()).map(|v| v as f32).collect();
        ImageBuffer::from_planar(extent, samples).unwrap()
    }

    #[test]
    fn encodes_in_declared_axis_order() {
        let buffer = ramp(ImageExtent::new(6, 5, 3, 1));
        let descriptor = TensorDescriptor::new("input", "bcyx").unwrap();

        let tensor = TensorCodec::encode(&buffer, [1, 2, 0], [4, 3, 1], &descriptor).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 3, 4]);
        for c in 0..3 {
            for y in 0..3 {
                for x in 0..4 {
                    assert_eq!(tensor[[0, c, y, x]], buffer.get(x + 1, y + 2, c, 0));
                }
            }
        }
    }

    #[test]
    fn encode_rejects_multichannel_region_for_channel_less_tensor() {
        let buffer = ramp(ImageExtent::new(4, 4, 2, 1));
        let descriptor = TensorDescriptor::new("input", "byx").unwrap();
        assert!(matches!(
            TensorCodec::encode(&buffer, [0, 0, 0], [4, 4, 1], &descriptor),
            Err(TilingError::ChannelMismatch { expected: 1, actual: 2, .. })
        ));
    }

    #[test]
    fn decode_inverts_encode_for_volumes() {
        let buffer = ramp(ImageExtent::new(4, 3, 2, 5));
        let descriptor = TensorDescriptor::new("volume", "bzcyx").unwrap();

        let tensor = TensorCodec::encode(&buffer, [0, 0, 0], [4, 3, 5], &descriptor).unwrap();
        assert_eq!(tensor.shape(), &[1, 5, 2, 3, 4]);
        let decoded = TensorCodec::decode(&tensor, &descriptor, [4, 3, 5]).unwrap();
        assert_eq!(decoded, buffer);
    }

    #[test]
    fn decode_checks_rank_and_batch() {
        let descriptor = TensorDescriptor::new("out", "byxc").unwrap();
        let wrong_rank = ArrayD::<f32>::zeros(IxDyn(&[1, 8, 8]));
        assert!(matches!(
            TensorCodec::decode(&wrong_rank, &descriptor, [8, 8, 1]),
            Err(TilingError::RankMismatch { expected: 4, actual: 3, .. })
        ));

        let batched = ArrayD::<f32>::zeros(IxDyn(&[2, 8, 8, 1]));
        assert!(matches!(
            TensorCodec::decode(&batched, &descriptor, [8, 8, 1]),
            Err(TilingError::BatchSizeBiggerThanOne { batch: 2, .. })
        ));
    }

    #[test]
    fn untagged_output_resolves_by_size() {
        let form = resolve_axes("mask", &[1, 3, 40, 24], [24, 40, 1]).unwrap();
        assert_eq!(form.to_string(), "bcyx");

        let form = resolve_axes("mask", &[24, 40], [24, 40, 1]).unwrap();
        assert_eq!(form.to_string(), "xy");

        let form = resolve_axes("mask", &[1, 1, 40, 24, 1], [24, 40, 1]).unwrap();
        assert_eq!(form.to_string(), "bzyxc");
    }

    #[test]
    fn equal_spatial_sizes_are_ambiguous() {
        let shape = [1, 32, 32, 1];
        assert!(matches!(
            resolve_axes("out", &shape, [32, 32, 1]),
            Err(TilingError::AmbiguousAxisMapping { .. })
        ));

        let descriptor = TensorDescriptor::untagged("out");
        let tensor = ArrayD::<f32>::zeros(IxDyn(&shape));
        assert!(matches!(
            TensorCodec::decode(&tensor, &descriptor, [32, 32, 1]),
            Err(TilingError::AmbiguousAxisMapping { .. })
        ));
    }

    #[test]
    fn unmatched_spatial_extent_is_ambiguous() {
        assert!(matches!(
            resolve_axes("out", &[1, 3, 30, 24], [24, 40, 1]),
            Err(TilingError::AmbiguousAxisMapping { .. })
        ));
        // Two unmatched non-unit axes cannot both be channels.
        assert!(matches!(
            resolve_axes("out", &[5, 7, 40, 24], [24, 40, 1]),
            Err(TilingError::AmbiguousAxisMapping { .. })
        ));
    }

    #[test]
    fn expected_extent_applies_scale_and_offset() {
        let descriptor = TensorDescriptor::new("out", "byxc")
            .unwrap()
            .with_scale(&[1.0, 0.5, 0.5, 1.0])
            .with_offset(&[0, 2, 2, 0]);
        assert_eq!(expected_output_extent(&descriptor, [128, 96, 1]), [60, 44, 1]);
        assert_eq!(scale_floor(3, 1.0 / 3.0), 1);
    }
}
