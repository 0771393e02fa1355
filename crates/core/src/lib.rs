//! Tiled inference for image-to-image models.
//!
//! Images larger than a model's native input are mirror-padded, cut into
//! overlapping tiles, run one tile at a time through an
//! [`backend::InferenceBackend`], and stitched back together with each tile's
//! halo discarded and each output's scale and offset applied.

pub mod axis;
pub mod backend;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod logging;
pub mod mirror;
pub mod padding;
pub mod reconstruct;
pub mod runner;
pub mod tile_grid;

pub use axis::{AxisForm, AxisTag};
pub use backend::{InferenceBackend, TensorMap};
pub use buffer::{ImageBuffer, ImageExtent};
pub use descriptor::{HaloPolicy, ModelDescriptor, TensorDescriptor};
pub use error::{TilingError, TilingResult};
pub use reconstruct::OutputImage;
pub use runner::{RunOptions, RunReport, RunState, TileRunner};
