//! The inference seam: named tensors in, named tensors out.
//!
//! [`InferenceBackend`] is what the tile runner calls once per tile. Closures
//! implement it directly, which is how tests supply stub models.
//! [`OrtBackend`] runs an ONNX model through ONNX Runtime with IoBinding,
//! converting to and from f16 when the model's tensors are half precision.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::ArrayD;
use ort::{
    execution_providers::{
        CUDAExecutionProvider, ExecutionProvider as _, TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
    tensor::TensorElementType,
    value::{DynValue, Tensor, ValueType},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub type TensorMap = HashMap<String, ArrayD<f32>>;

/// A model invocation. Must supply every requested output.
pub trait InferenceBackend: Send {
    fn invoke(&mut self, inputs: TensorMap, outputs: &[String]) -> Result<TensorMap>;
}

impl<F> InferenceBackend for F
where
    F: FnMut(TensorMap, &[String]) -> Result<TensorMap> + Send,
{
    fn invoke(&mut self, inputs: TensorMap, outputs: &[String]) -> Result<TensorMap> {
        self(inputs, outputs)
    }
}

/// Execution provider selection.
///
/// `Tensorrt` registers CUDA as its fallback; `Cuda` falls back to CPU when
/// the CUDA runtime is missing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    #[default]
    Cpu,
    Cuda,
    Tensorrt,
}

impl ExecutionProvider {
    /// Parse from string (case-insensitive). Returns `Cpu` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Self::Cuda,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cpu,
        }
    }
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub provider: ExecutionProvider,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Point ONNX Runtime's dynamic loader at `path` unless `ORT_DYLIB_PATH` is
/// already set. Must run before the first session is built.
pub fn configure_ort_dylib(path: Option<&Path>) {
    if env::var_os("ORT_DYLIB_PATH").is_none() {
        if let Some(path) = path {
            env::set_var("ORT_DYLIB_PATH", path);
        }
    }

    match env::var("ORT_DYLIB_PATH") {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("ORT_DYLIB_PATH set to {ort} but file not found"),
        Err(_) => debug!("ORT_DYLIB_PATH not set, ORT will try default search paths"),
    }
}

fn cache_file_count(root: &Path) -> usize {
    std::fs::read_dir(root)
        .map(|entries| entries.flatten().filter(|e| e.path().is_file()).count())
        .unwrap_or(0)
}

/// Build an `ort::Session` for the requested provider.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let load_context = || format!("Failed to load ONNX model: {}", config.model_path.display());

    let session = match config.provider {
        ExecutionProvider::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            let cache_path = cache_dir.to_string_lossy().to_string();
            let cached_before = cache_file_count(cache_dir);
            let started = Instant::now();
            info!(
                cache_dir = %cache_dir.display(),
                cache_files = cached_before,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(load_context);

            let elapsed_secs = started.elapsed().as_secs_f64();
            match result {
                Ok(session) => {
                    info!(
                        elapsed_secs,
                        cache_files_before = cached_before,
                        cache_files_after = cache_file_count(cache_dir),
                        "TensorRT session ready"
                    );
                    session
                }
                Err(e) => {
                    error!(elapsed_secs, error = %e, "TensorRT session initialization failed");
                    return Err(e);
                }
            }
        }
        ExecutionProvider::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(provider = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(load_context)?
        }
        ExecutionProvider::Cpu => {
            debug!(provider = "cpu", "Building session with the default CPU EP");
            builder
                .commit_from_file(config.model_path)
                .with_context(load_context)?
        }
    };

    Ok(session)
}

fn is_fp16(dtype: &ValueType) -> bool {
    matches!(dtype, ValueType::Tensor { ty, .. } if *ty == TensorElementType::Float16)
}

/// ONNX Runtime session driven through IoBinding.
pub struct OrtBackend {
    session: Session,
    fp16_inputs: HashMap<String, bool>,
    fp16_outputs: HashMap<String, bool>,
}

impl OrtBackend {
    pub fn new(session: Session) -> Self {
        let fp16_inputs = session
            .inputs()
            .iter()
            .map(|input| (input.name().to_string(), is_fp16(input.dtype())))
            .collect();
        let fp16_outputs = session
            .outputs()
            .iter()
            .map(|output| (output.name().to_string(), is_fp16(output.dtype())))
            .collect();
        Self {
            session,
            fp16_inputs,
            fp16_outputs,
        }
    }

    pub fn load(config: &SessionConfig<'_>) -> Result<Self> {
        let backend = Self::new(build_session(config)?);
        debug!(
            model = %config.model_path.display(),
            provider = %config.provider,
            inputs = ?backend.input_names(),
            outputs = ?backend.output_names(),
            "Detected model IO"
        );
        Ok(backend)
    }

    pub fn input_names(&self) -> Vec<String> {
        self.session
            .inputs()
            .iter()
            .map(|input| input.name().to_string())
            .collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.session
            .outputs()
            .iter()
            .map(|output| output.name().to_string())
            .collect()
    }

    fn to_value(&self, name: &str, array: ArrayD<f32>) -> Result<DynValue> {
        if !self.fp16_inputs.get(name).copied().unwrap_or(false) {
            return Ok(Tensor::from_array(array)?.into_dyn());
        }
        let contiguous = array.as_standard_layout();
        let samples = contiguous
            .as_slice()
            .context("standard-layout array must be contiguous")?;
        let mut half_data = vec![f16::ZERO; samples.len()];
        half_data.convert_from_f32_slice(samples);
        let half_array = ArrayD::from_shape_vec(array.shape().to_vec(), half_data)?;
        Ok(Tensor::from_array(half_array)?.into_dyn())
    }
}

impl InferenceBackend for OrtBackend {
    fn invoke(&mut self, inputs: TensorMap, outputs: &[String]) -> Result<TensorMap> {
        let mut values = Vec::with_capacity(inputs.len());
        for (name, array) in inputs {
            let value = self
                .to_value(&name, array)
                .with_context(|| format!("failed to build input tensor '{name}'"))?;
            values.push((name, value));
        }

        let mut binding = self.session.create_binding()?;
        for (name, value) in &values {
            binding
                .bind_input(name.as_str(), value)
                .with_context(|| format!("failed to bind input '{name}'"))?;
        }
        let memory_info = self.session.allocator().memory_info();
        for name in outputs {
            binding
                .bind_output_to_device(name.as_str(), &memory_info)
                .with_context(|| format!("failed to bind output '{name}'"))?;
        }

        let results = self.session.run_binding(&binding)?;
        let mut decoded = TensorMap::with_capacity(outputs.len());
        for name in outputs {
            let array = if self.fp16_outputs.get(name).copied().unwrap_or(false) {
                let view = results[name.as_str()].try_extract_array::<f16>()?;
                let contiguous = view.as_standard_layout();
                let samples = contiguous
                    .as_slice()
                    .context("standard-layout array must be contiguous")?;
                let mut f32_data = vec![0.0f32; samples.len()];
                samples.convert_to_f32_slice(&mut f32_data);
                ArrayD::from_shape_vec(view.shape().to_vec(), f32_data)?
            } else {
                results[name.as_str()].try_extract_array::<f32>()?.to_owned()
            };
            decoded.insert(name.clone(), array);
        }
        Ok(decoded)
    }
}
