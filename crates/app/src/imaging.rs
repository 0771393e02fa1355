use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::{ColorType, DynamicImage, ImageFormat};
use tracing::debug;

use tessera_core::{ImageBuffer, ImageExtent, OutputImage};

/// Decode a PNG/TIFF into a single-plane buffer, one channel per colour
/// component. Integer samples are normalised to `[0, 1]`.
pub fn load_image(path: &Path) -> Result<ImageBuffer> {
    let decoded = image::open(path)
        .with_context(|| format!("Failed to open image: {}", path.display()))?;
    let width = decoded.width() as usize;
    let height = decoded.height() as usize;

    let (channels, samples) = match decoded {
        DynamicImage::ImageLuma8(img) => (1, normalise_u8(img.as_raw())),
        DynamicImage::ImageLumaA8(img) => (2, normalise_u8(img.as_raw())),
        DynamicImage::ImageRgb8(img) => (3, normalise_u8(img.as_raw())),
        DynamicImage::ImageRgba8(img) => (4, normalise_u8(img.as_raw())),
        DynamicImage::ImageLuma16(img) => (1, normalise_u16(img.as_raw())),
        DynamicImage::ImageLumaA16(img) => (2, normalise_u16(img.as_raw())),
        DynamicImage::ImageRgb16(img) => (3, normalise_u16(img.as_raw())),
        DynamicImage::ImageRgba16(img) => (4, normalise_u16(img.as_raw())),
        DynamicImage::ImageRgb32F(img) => (3, img.into_raw()),
        other => (4, other.into_rgba32f().into_raw()),
    };
    debug!(
        path = %path.display(),
        width,
        height,
        channels,
        "Decoded input image"
    );

    interleaved_to_buffer(ImageExtent::new(width, height, channels, 1), &samples)
}

fn normalise_u8(samples: &[u8]) -> Vec<f32> {
    samples.iter().map(|&v| f32::from(v) / 255.0).collect()
}

fn normalise_u16(samples: &[u16]) -> Vec<f32> {
    samples.iter().map(|&v| f32::from(v) / 65535.0).collect()
}

/// `samples` is pixel-interleaved: channel fastest, then `x`, then `y`.
pub fn interleaved_to_buffer(extent: ImageExtent, samples: &[f32]) -> Result<ImageBuffer> {
    if samples.len() != extent.len() {
        bail!(
            "sample count {} does not match {}x{}x{}",
            samples.len(),
            extent.width,
            extent.height,
            extent.channels
        );
    }
    let mut buffer = ImageBuffer::zeros(extent);
    for (i, &value) in samples.iter().enumerate() {
        let c = i % extent.channels;
        let pixel = i / extent.channels;
        buffer.set(pixel % extent.width, pixel / extent.width, c, 0, value);
    }
    Ok(buffer)
}

/// Range mapped onto the full 16-bit scale: the declared data range if any,
/// otherwise the finite min/max of the samples.
pub fn display_range(output: &OutputImage) -> [f32; 2] {
    if let Some([low, high]) = output.data_range {
        return [low as f32, high as f32];
    }
    let (low, high) = output
        .buffer
        .view()
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if low > high {
        [0.0, 1.0]
    } else if low == high {
        [low, low + 1.0]
    } else {
        [low, high]
    }
}

fn quantise(value: f32, [low, high]: [f32; 2]) -> u16 {
    if !value.is_finite() || high <= low {
        return 0;
    }
    let unit = ((value - low) / (high - low)).clamp(0.0, 1.0);
    (unit * 65535.0).round() as u16
}

/// Write an output as 16-bit PNG. One file per z-slice for volumes; buffers
/// whose channel count has no PNG colour type get one grey file per channel.
/// Returns the files written.
pub fn save_output(output: &OutputImage, base: &Path) -> Result<Vec<PathBuf>> {
    let extent = output.buffer.extent();
    let range = display_range(output);
    let colour = match extent.channels {
        1 => Some(ColorType::L16),
        2 => Some(ColorType::La16),
        3 => Some(ColorType::Rgb16),
        4 => Some(ColorType::Rgba16),
        _ => None,
    };

    let mut written = Vec::new();
    for z in 0..extent.depth {
        let slice_base = if extent.depth > 1 {
            suffixed(base, &format!("z{z}"))
        } else {
            base.to_path_buf()
        };
        match colour {
            Some(colour) => {
                let channels: Vec<usize> = (0..extent.channels).collect();
                let path = png_path(&slice_base);
                write_png(&path, output, z, &channels, colour, range)?;
                written.push(path);
            }
            None => {
                for c in 0..extent.channels {
                    let path = png_path(&suffixed(&slice_base, &format!("c{c}")));
                    write_png(&path, output, z, &[c], ColorType::L16, range)?;
                    written.push(path);
                }
            }
        }
    }
    Ok(written)
}

fn file_name(base: &Path) -> String {
    base.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    base.with_file_name(format!("{}_{suffix}", file_name(base)))
}

fn png_path(base: &Path) -> PathBuf {
    base.with_file_name(format!("{}.png", file_name(base)))
}

fn write_png(
    path: &Path,
    output: &OutputImage,
    z: usize,
    channels: &[usize],
    colour: ColorType,
    range: [f32; 2],
) -> Result<()> {
    let extent = output.buffer.extent();
    let mut bytes = Vec::with_capacity(extent.width * extent.height * channels.len() * 2);
    for y in 0..extent.height {
        for x in 0..extent.width {
            for &c in channels {
                let sample = quantise(output.buffer.get(x, y, c, z), range);
                bytes.extend_from_slice(&sample.to_ne_bytes());
            }
        }
    }

    image::save_buffer_with_format(
        path,
        &bytes,
        extent.width as u32,
        extent.height as u32,
        colour,
        ImageFormat::Png,
    )
    .with_context(|| format!("Failed to write output image: {}", path.display()))
}
