//! Error taxonomy for the tiling engine.
//!
//! Every kind is terminal for the run that raised it. Cancellation is not an
//! error and never appears here; see [`crate::runner::RunState::Stopped`].

use thiserror::Error;

use crate::axis::AxisTag;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TilingError {
    #[error("invalid tile geometry on axis {axis}: patch {patch}, halo {halo} ({reason})")]
    InvalidTileGeometry {
        axis: AxisTag,
        patch: usize,
        halo: usize,
        reason: &'static str,
    },

    #[error("image has zero extent on axis {axis}")]
    EmptyImage { axis: AxisTag },

    #[error("patch {patch} on axis {axis} is too large for image extent {image} (must be < 3x)")]
    TileTooLarge {
        axis: AxisTag,
        patch: usize,
        image: usize,
    },

    #[error("invalid patch size {patch} on axis {axis}: {reason}")]
    InvalidPatchSize {
        axis: AxisTag,
        patch: usize,
        reason: String,
    },

    #[error("input '{tensor}' expects {expected} channel(s), image has {actual}")]
    ChannelMismatch {
        tensor: String,
        expected: usize,
        actual: usize,
    },

    #[error("input '{tensor}' expects depth {expected}, image has {actual}")]
    DepthMismatch {
        tensor: String,
        expected: usize,
        actual: usize,
    },

    #[error("tensor '{tensor}' has {rank} axes; at most 5 are supported")]
    UnsupportedRank { tensor: String, rank: usize },

    #[error("invalid axis form '{form}': {reason}")]
    InvalidAxisForm { form: String, reason: String },

    #[error("tensor '{tensor}' has rank {actual}, its axis form declares {expected}")]
    RankMismatch {
        tensor: String,
        expected: usize,
        actual: usize,
    },

    #[error("tensor '{tensor}' has batch size {batch}; only 1 is supported")]
    BatchSizeBiggerThanOne { tensor: String, batch: usize },

    #[error("cannot map axes of output '{tensor}' with shape {shape:?}: {reason}")]
    AmbiguousAxisMapping {
        tensor: String,
        shape: Vec<usize>,
        reason: String,
    },

    #[error(
        "output '{tensor}' at tile {tile_index} has shape {actual:?}, expected {expected:?}"
    )]
    InconsistentOutputShape {
        tensor: String,
        tile_index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("backend did not return requested tensor '{tensor}' at tile {tile_index}")]
    MissingTensor { tensor: String, tile_index: usize },

    #[error("invalid descriptor for '{tensor}': {reason}")]
    InvalidDescriptor { tensor: String, reason: String },

    #[error("input '{tensor}' has spatial extent {actual:?}, primary input has {expected:?}")]
    InputExtentMismatch {
        tensor: String,
        expected: [usize; 3],
        actual: [usize; 3],
    },

    #[error("inference failed at tile {tile_index}: {message}")]
    Backend { tile_index: usize, message: String },
}

pub type TilingResult<T> = Result<T, TilingError>;
