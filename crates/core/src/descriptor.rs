//! Immutable descriptions of a model's named input and output tensors.
//!
//! Per-axis arrays (`shape`, `halo`, `scale`, ...) are aligned with the
//! tensor's axis form. An output declared without an axis form has its arrays
//! aligned with the native `xyczb` order instead, and its tensor axes are
//! resolved by size when decoded (see [`crate::codec`]). Empty arrays take the
//! per-axis defaults.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::axis::{AxisForm, AxisTag};
use crate::error::{TilingError, TilingResult};

/// How the tiling halo is derived from the model's tensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaloPolicy {
    /// Use only the primary input's declared halo.
    Input,
    /// Widen the input halo so every output's offset and halo are covered.
    #[default]
    Outputs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRole {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub name: String,
    #[serde(default, rename = "axes", skip_serializing_if = "Option::is_none")]
    pub axis_form: Option<AxisForm>,
    /// Per-axis extent, `-1` when unconstrained.
    #[serde(default)]
    pub shape: Vec<i64>,
    #[serde(default)]
    pub minimum_size: Vec<usize>,
    /// `0` marks a fixed axis; otherwise patches grow from `minimum_size` in multiples of it.
    #[serde(default)]
    pub step: Vec<usize>,
    #[serde(default)]
    pub recommended_patch: Vec<usize>,
    #[serde(default)]
    pub halo: Vec<usize>,
    #[serde(default)]
    pub scale: Vec<f64>,
    /// Pixels trimmed from each side of the scaled tile.
    #[serde(default)]
    pub offset: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_range: Option<[f64; 2]>,
}

impl TensorDescriptor {
    pub fn new(name: impl Into<String>, form: &str) -> TilingResult<Self> {
        Ok(Self {
            axis_form: Some(AxisForm::parse(form)?),
            ..Self::untagged(name)
        })
    }

    /// An output whose axis order is unknown until its tensor is decoded.
    pub fn untagged(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            axis_form: None,
            shape: Vec::new(),
            minimum_size: Vec::new(),
            step: Vec::new(),
            recommended_patch: Vec::new(),
            halo: Vec::new(),
            scale: Vec::new(),
            offset: Vec::new(),
            data_range: None,
        }
    }

    pub fn with_shape(mut self, shape: &[i64]) -> Self {
        self.shape = shape.to_vec();
        self
    }

    pub fn with_minimum_size(mut self, minimum_size: &[usize]) -> Self {
        self.minimum_size = minimum_size.to_vec();
        self
    }

    pub fn with_step(mut self, step: &[usize]) -> Self {
        self.step = step.to_vec();
        self
    }

    pub fn with_recommended_patch(mut self, patch: &[usize]) -> Self {
        self.recommended_patch = patch.to_vec();
        self
    }

    pub fn with_halo(mut self, halo: &[usize]) -> Self {
        self.halo = halo.to_vec();
        self
    }

    pub fn with_scale(mut self, scale: &[f64]) -> Self {
        self.scale = scale.to_vec();
        self
    }

    pub fn with_offset(mut self, offset: &[usize]) -> Self {
        self.offset = offset.to_vec();
        self
    }

    pub fn with_data_range(mut self, low: f64, high: f64) -> Self {
        self.data_range = Some([low, high]);
        self
    }

    /// Order the per-axis arrays are aligned with.
    pub fn layout(&self) -> AxisForm {
        self.axis_form.clone().unwrap_or_else(AxisForm::native)
    }

    pub fn is_tagged(&self) -> bool {
        self.axis_form.is_some()
    }

    /// Whether the tensor carries `tag`. Untagged tensors are assumed to.
    pub fn has_axis(&self, tag: AxisTag) -> bool {
        self.axis_form.as_ref().map_or(true, |form| form.contains(tag))
    }

    fn value_of<T: Copy>(&self, values: &[T], tag: AxisTag) -> Option<T> {
        let position = self.layout().position(tag)?;
        values.get(position).copied()
    }

    pub fn shape_of(&self, tag: AxisTag) -> Option<i64> {
        self.value_of(&self.shape, tag)
    }

    /// Fixed extent of `tag`, when the shape pins it.
    pub fn fixed_extent(&self, tag: AxisTag) -> Option<usize> {
        self.shape_of(tag)
            .filter(|extent| *extent > 0)
            .map(|extent| extent as usize)
    }

    pub fn minimum_of(&self, tag: AxisTag) -> usize {
        self.value_of(&self.minimum_size, tag).unwrap_or(1).max(1)
    }

    pub fn step_of(&self, tag: AxisTag) -> usize {
        self.value_of(&self.step, tag).unwrap_or(1)
    }

    pub fn halo_of(&self, tag: AxisTag) -> usize {
        self.value_of(&self.halo, tag).unwrap_or(0)
    }

    pub fn scale_of(&self, tag: AxisTag) -> f64 {
        self.value_of(&self.scale, tag).unwrap_or(1.0)
    }

    pub fn offset_of(&self, tag: AxisTag) -> usize {
        self.value_of(&self.offset, tag).unwrap_or(0)
    }

    pub fn recommended_patch_of(&self, tag: AxisTag) -> Option<usize> {
        self.value_of(&self.recommended_patch, tag)
            .filter(|patch| *patch > 0)
    }

    /// Patch extent used when the caller does not override it.
    pub fn default_patch(&self, tag: AxisTag) -> Option<usize> {
        self.recommended_patch_of(tag)
            .or_else(|| self.fixed_extent(tag))
    }

    /// Smallest legal patch extent not below `requested`.
    pub fn legal_patch(&self, tag: AxisTag, requested: usize) -> usize {
        let minimum = self.minimum_of(tag);
        match self.step_of(tag) {
            0 => self.fixed_extent(tag).unwrap_or(minimum),
            _ if requested <= minimum => minimum,
            step => minimum + (requested - minimum).div_ceil(step) * step,
        }
    }

    /// Check a patch extent against `minimum_size`, `step`, and fixed shapes.
    pub fn check_patch(&self, tag: AxisTag, patch: usize) -> TilingResult<()> {
        let minimum = self.minimum_of(tag);
        let invalid = |reason: String| TilingError::InvalidPatchSize {
            axis: tag,
            patch,
            reason,
        };

        match self.step_of(tag) {
            0 => {
                if let Some(fixed) = self.fixed_extent(tag) {
                    if patch != fixed {
                        return Err(invalid(format!("axis is fixed at {fixed}")));
                    }
                }
            }
            step => {
                if patch < minimum {
                    return Err(invalid(format!("minimum size is {minimum}")));
                }
                if (patch - minimum) % step != 0 {
                    return Err(invalid(format!(
                        "must be {minimum} plus a multiple of {step}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self, role: TensorRole) -> TilingResult<()> {
        let invalid = |reason: String| TilingError::InvalidDescriptor {
            tensor: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("tensor name is empty".to_string()));
        }
        if role == TensorRole::Input && self.axis_form.is_none() {
            return Err(invalid("input tensors must declare their axes".to_string()));
        }

        let rank = self.layout().len();
        let lengths = [
            ("shape", self.shape.len()),
            ("minimum_size", self.minimum_size.len()),
            ("step", self.step.len()),
            ("recommended_patch", self.recommended_patch.len()),
            ("halo", self.halo.len()),
            ("scale", self.scale.len()),
            ("offset", self.offset.len()),
        ];
        for (field, len) in lengths {
            if len != 0 && len != rank {
                return Err(invalid(format!(
                    "{field} has {len} entries, axis form '{}' has {rank}",
                    self.layout()
                )));
            }
        }

        if let Some(batch) = self.shape_of(AxisTag::Batch) {
            if batch > 1 {
                return Err(TilingError::BatchSizeBiggerThanOne {
                    tensor: self.name.clone(),
                    batch: batch as usize,
                });
            }
        }
        if self.halo_of(AxisTag::Batch) != 0 {
            return Err(invalid("batch axis cannot carry a halo".to_string()));
        }
        if let Some(scale) = self.scale.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(invalid(format!("scale {scale} must be positive")));
        }
        if let Some([low, high]) = self.data_range {
            if !(low < high) {
                return Err(invalid(format!("data range [{low}, {high}] is empty")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub inputs: Vec<TensorDescriptor>,
    pub outputs: Vec<TensorDescriptor>,
}

impl ModelDescriptor {
    /// Load from TOML, or JSON when the file extension is `.json`.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read model descriptor: {}", path.display()))?;

        let descriptor: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&raw).with_context(|| {
                format!("failed to parse descriptor JSON: {}", path.display())
            })?,
            _ => toml::from_str(&raw).with_context(|| {
                format!("failed to parse descriptor TOML: {}", path.display())
            })?,
        };

        descriptor
            .validate()
            .with_context(|| format!("invalid model descriptor: {}", path.display()))?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            bail!("model '{}' declares no inputs", self.name);
        }
        if self.outputs.is_empty() {
            bail!("model '{}' declares no outputs", self.name);
        }

        let mut seen = HashSet::new();
        for input in &self.inputs {
            input.validate(TensorRole::Input)?;
            if !seen.insert(input.name.as_str()) {
                bail!("tensor name '{}' is declared twice", input.name);
            }
        }
        for output in &self.outputs {
            output.validate(TensorRole::Output)?;
            if !seen.insert(output.name.as_str()) {
                bail!("tensor name '{}' is declared twice", output.name);
            }
        }
        Ok(())
    }

    /// The input whose geometry drives the tile grid.
    pub fn primary_input(&self) -> Option<&TensorDescriptor> {
        self.inputs.first()
    }

    pub fn output(&self, name: &str) -> Option<&TensorDescriptor> {
        self.outputs.iter().find(|output| output.name == name)
    }

    /// Halo per spatial axis (`[x, y, z]`) used to lay out tiles.
    ///
    /// Under [`HaloPolicy::Outputs`] every output contributes
    /// `ceil(offset / scale) + ceil(halo / scale)` in input pixels.
    pub fn tiling_halo(&self, policy: HaloPolicy) -> [usize; 3] {
        let mut halo = [0usize; 3];
        let Some(primary) = self.primary_input() else {
            return halo;
        };

        for (slot, tag) in halo.iter_mut().zip(AxisTag::SPATIAL) {
            *slot = primary.halo_of(tag);
            if policy == HaloPolicy::Input {
                continue;
            }
            for output in &self.outputs {
                if !output.has_axis(tag) {
                    continue;
                }
                let scale = output.scale_of(tag);
                let needed = (output.offset_of(tag) as f64 / scale).ceil()
                    + (output.halo_of(tag) as f64 / scale).ceil();
                *slot = (*slot).max(needed as usize);
            }
        }
        halo
    }
}
