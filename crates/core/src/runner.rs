//! Tile-by-tile orchestration of one inference pass.
//!
//! `Idle -> Planning -> Running(i) -> {Stopped | Completed | Failed}`.
//! Planning rejects bad geometry and mismatched images before any tile runs.
//! Tiles then run sequentially; the cancel flag is checked between tiles and
//! a stopped run still returns what has been stitched so far.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::axis::AxisTag;
use crate::backend::{InferenceBackend, TensorMap};
use crate::buffer::{ImageBuffer, ImageExtent};
use crate::codec::{expected_output_extent, TensorCodec};
use crate::descriptor::{HaloPolicy, ModelDescriptor, TensorDescriptor, TensorRole};
use crate::error::{TilingError, TilingResult};
use crate::mirror::MirrorPadder;
use crate::padding::{sampling_period, PaddingPlan, PaddingPlanner};
use crate::reconstruct::{OutputImage, Reconstructor};
use crate::tile_grid::TileGrid;

pub type ProgressCallback = Box<dyn Fn(usize, usize) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Planning,
    Running { tile_index: usize },
    /// Cancelled between tiles; outputs are partial.
    Stopped,
    Completed,
    /// `tile_index` is `None` when planning failed.
    Failed { tile_index: Option<usize> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunOptions {
    /// Patch extent per spatial axis (`[x, y, z]`); `None` uses the input's
    /// recommended patch.
    pub patch: Option<[usize; 3]>,
    /// Value unwritten output pixels keep.
    pub fill_value: f32,
    pub halo_policy: HaloPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            patch: None,
            fill_value: 0.0,
            halo_policy: HaloPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: RunState,
    pub tiles_completed: usize,
    pub total_tiles: usize,
    pub elapsed: Duration,
    pub plan: PaddingPlan,
    /// One image per declared output, in declaration order.
    pub outputs: Vec<OutputImage>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Halo per spatial axis the grid was laid out with.
    pub fn halo(&self) -> [usize; 3] {
        self.plan.axes.map(|axis| axis.halo)
    }

    pub fn output(&self, name: &str) -> Option<&OutputImage> {
        self.outputs.iter().find(|output| output.name == name)
    }
}

pub struct TileRunner {
    model: ModelDescriptor,
    options: RunOptions,
    progress: Option<ProgressCallback>,
    cancel: Option<watch::Receiver<bool>>,
    state: RunState,
}

impl TileRunner {
    pub fn new(model: ModelDescriptor, options: RunOptions) -> Self {
        Self {
            model,
            options,
            progress: None,
            cancel: None,
            state: RunState::Idle,
        }
    }

    /// Called with `(tiles_completed, total_tiles)` after every tile.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    /// Validate the model against an image extent and lay out the tiles.
    pub fn plan(&self, image: ImageExtent) -> TilingResult<PaddingPlan> {
        let primary = self.validate_model()?;
        for tag in AxisTag::SPATIAL.into_iter().chain([AxisTag::Channel]) {
            if image.get(tag) == 0 {
                return Err(TilingError::EmptyImage { axis: tag });
            }
        }
        check_image_axes(primary, image)?;

        let mut patch = [1usize; 3];
        let mut halo = self.model.tiling_halo(self.options.halo_policy);
        for (k, tag) in AxisTag::SPATIAL.into_iter().enumerate() {
            if !primary.has_axis(tag) {
                halo[k] = 0;
                continue;
            }
            patch[k] = match self.options.patch {
                Some(requested) => requested[k],
                None => primary
                    .default_patch(tag)
                    .unwrap_or_else(|| primary.legal_patch(tag, image.get(tag))),
            };
            for input in self.model.inputs.iter().filter(|input| input.has_axis(tag)) {
                input.check_patch(tag, patch[k])?;
            }
        }

        for output in &self.model.outputs {
            for tag in AxisTag::SPATIAL {
                if image.get(tag) > 1 && !output.has_axis(tag) {
                    return Err(TilingError::InvalidDescriptor {
                        tensor: output.name.clone(),
                        reason: format!(
                            "output has no '{tag}' axis but the image spans {}",
                            image.get(tag)
                        ),
                    });
                }
            }
        }

        let mut period = [1usize; 3];
        for (k, tag) in AxisTag::SPATIAL.into_iter().enumerate() {
            if !primary.has_axis(tag) {
                continue;
            }
            let scales = self
                .model
                .outputs
                .iter()
                .filter(|output| output.has_axis(tag))
                .map(|output| output.scale_of(tag));
            period[k] = sampling_period(scales, patch[k]).ok_or_else(|| {
                TilingError::InvalidDescriptor {
                    tensor: self.model.name.clone(),
                    reason: format!(
                        "output scales on axis '{tag}' have no whole-pixel period within patch {}",
                        patch[k]
                    ),
                }
            })?;
        }

        PaddingPlanner::plan_aligned(image.spatial(), patch, halo, period)
    }

    /// Run every tile. `images` holds one buffer per declared input, in
    /// declaration order; all must share the same spatial extent.
    pub fn run(
        &mut self,
        backend: &mut dyn InferenceBackend,
        images: &[&ImageBuffer],
    ) -> TilingResult<RunReport> {
        let started = Instant::now();
        self.state = RunState::Planning;

        let result = self.execute(backend, images, started);
        if let Err(e) = &result {
            let tile_index = match self.state {
                RunState::Running { tile_index } => Some(tile_index),
                _ => None,
            };
            self.state = RunState::Failed { tile_index };
            error!(model = %self.model.name, ?tile_index, error = %e, "Tiled inference failed");
        }
        result
    }

    fn execute(
        &mut self,
        backend: &mut dyn InferenceBackend,
        images: &[&ImageBuffer],
        started: Instant,
    ) -> TilingResult<RunReport> {
        if images.len() != self.model.inputs.len() {
            return Err(TilingError::InvalidDescriptor {
                tensor: self.model.name.clone(),
                reason: format!(
                    "model takes {} input image(s), got {}",
                    self.model.inputs.len(),
                    images.len()
                ),
            });
        }
        let Some(first) = images.first() else {
            return Err(TilingError::InvalidDescriptor {
                tensor: self.model.name.clone(),
                reason: "model declares no inputs".to_string(),
            });
        };
        let extent = first.extent();
        for (input, image) in self.model.inputs.iter().zip(images).skip(1) {
            if image.extent().spatial() != extent.spatial() {
                return Err(TilingError::InputExtentMismatch {
                    tensor: input.name.clone(),
                    expected: extent.spatial(),
                    actual: image.extent().spatial(),
                });
            }
            check_image_axes(input, image.extent())?;
        }

        let plan = self.plan(extent)?;
        let grid = TileGrid::new(plan);
        let total_tiles = grid.len();
        info!(
            model = %self.model.name,
            width = extent.width,
            height = extent.height,
            depth = extent.depth,
            patch = ?plan.patch(),
            halo = ?plan.axes.map(|axis| axis.halo),
            total_tiles,
            "Starting tiled inference"
        );

        let padded = images
            .iter()
            .map(|image| MirrorPadder::pad(image, &plan))
            .collect::<TilingResult<Vec<_>>>()?;
        debug!(
            before = ?plan.before(),
            after = ?plan.after(),
            padded = ?plan.padded_extent(),
            "Mirror padding applied"
        );

        let output_names: Vec<String> = self
            .model
            .outputs
            .iter()
            .map(|output| output.name.clone())
            .collect();
        let mut reconstructor =
            Reconstructor::new(&self.model.outputs, extent.spatial(), self.options.fill_value);
        let mut tiles_completed = 0;
        let mut final_state = RunState::Completed;

        for tile in &grid {
            self.state = RunState::Running {
                tile_index: tile.index,
            };

            let mut inputs = TensorMap::with_capacity(padded.len());
            for (descriptor, buffer) in self.model.inputs.iter().zip(&padded) {
                let tensor =
                    TensorCodec::encode(buffer, tile.source_origin, tile.extent, descriptor)?;
                inputs.insert(descriptor.name.clone(), tensor);
            }

            let mut results = backend.invoke(inputs, &output_names).map_err(|e| {
                TilingError::Backend {
                    tile_index: tile.index,
                    message: format!("{e:#}"),
                }
            })?;

            for descriptor in &self.model.outputs {
                let tensor = results.remove(&descriptor.name).ok_or_else(|| {
                    TilingError::MissingTensor {
                        tensor: descriptor.name.clone(),
                        tile_index: tile.index,
                    }
                })?;
                let expected = expected_output_extent(descriptor, tile.extent);
                let decoded = TensorCodec::decode(&tensor, descriptor, expected)?;
                reconstructor.place(&descriptor.name, &decoded, &tile)?;
            }

            tiles_completed += 1;
            debug!(
                tile_index = tile.index,
                grid_position = ?tile.grid_position,
                output_origin = ?tile.output_origin,
                valid_extent = ?tile.valid_extent,
                "Tile stitched"
            );
            if let Some(progress) = &self.progress {
                progress(tiles_completed, total_tiles);
            }

            if tiles_completed < total_tiles && self.is_cancelled() {
                warn!(tiles_completed, total_tiles, "Tiled inference cancelled");
                final_state = RunState::Stopped;
                break;
            }
        }

        self.state = final_state;
        let elapsed = started.elapsed();
        info!(
            model = %self.model.name,
            tiles_completed,
            total_tiles,
            elapsed_ms = elapsed.as_millis() as u64,
            "Tiled inference finished"
        );

        Ok(RunReport {
            state: final_state,
            tiles_completed,
            total_tiles,
            elapsed,
            plan,
            outputs: reconstructor.into_outputs(),
        })
    }

    fn validate_model(&self) -> TilingResult<&TensorDescriptor> {
        for input in &self.model.inputs {
            input.validate(TensorRole::Input)?;
        }
        for output in &self.model.outputs {
            output.validate(TensorRole::Output)?;
        }
        self.model
            .primary_input()
            .ok_or_else(|| TilingError::InvalidDescriptor {
                tensor: self.model.name.clone(),
                reason: "model declares no inputs".to_string(),
            })
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|cancel| *cancel.borrow())
    }
}

/// Channel and depth counts of `image` against `input`'s axes and fixed shape.
fn check_image_axes(input: &TensorDescriptor, image: ImageExtent) -> TilingResult<()> {
    for tag in [AxisTag::Channel, AxisTag::Depth] {
        let actual = image.get(tag);
        let expected = if !input.has_axis(tag) {
            1
        } else if let Some(fixed) = input.fixed_extent(tag) {
            fixed
        } else {
            continue;
        };
        if actual == expected {
            continue;
        }
        let tensor = input.name.clone();
        return Err(match tag {
            AxisTag::Channel => TilingError::ChannelMismatch {
                tensor,
                expected,
                actual,
            },
            _ => TilingError::DepthMismatch {
                tensor,
                expected,
                actual,
            },
        });
    }

    for tag in [AxisTag::Width, AxisTag::Height] {
        if !input.has_axis(tag) && image.get(tag) > 1 {
            return Err(TilingError::InvalidDescriptor {
                tensor: input.name.clone(),
                reason: format!("input has no '{tag}' axis but the image spans {}", image.get(tag)),
            });
        }
    }
    Ok(())
}
