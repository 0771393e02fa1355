use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::ExecutionProvider;
use crate::descriptor::HaloPolicy;
use crate::logging::DEFAULT_RETENTION_FILES;
use crate::runner::RunOptions;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TESSERA_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub tiling: TilingConfig,
    pub backend: BackendConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Where `--model`/`--descriptor` names without a directory are looked up.
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TilingConfig {
    /// Value output pixels hold until a tile writes them.
    pub fill_value: f32,
    pub halo_policy: HaloPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    pub provider: ExecutionProvider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ort_dylib_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Number of daily log files kept under `<data_dir>/logs`.
    pub retention_files: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            fill_value: 0.0,
            halo_policy: HaloPolicy::Outputs,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            retention_files: DEFAULT_RETENTION_FILES,
        }
    }
}

impl TilingConfig {
    pub fn run_options(&self, patch: Option<[usize; 3]>) -> RunOptions {
        RunOptions {
            patch,
            fill_value: self.fill_value,
            halo_policy: self.halo_policy,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TESSERA_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create `data_dir` if missing and write a default config.toml only when
/// none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns `path` as-is if absolute, otherwise joined to `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Resolve a user-supplied file: existing paths win, then bare names are
/// looked up in `models_dir`.
pub fn resolve_model_file(models_dir: &Path, path: &Path) -> PathBuf {
    if path.exists() || path.is_absolute() || path.components().count() > 1 {
        return path.to_path_buf();
    }
    let candidate = models_dir.join(path);
    if candidate.exists() {
        candidate
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.tiling.fill_value, 0.0);
        assert_eq!(cfg.tiling.halo_policy, HaloPolicy::Outputs);
        assert_eq!(cfg.backend.provider, ExecutionProvider::Cpu);
        assert!(cfg.backend.ort_dylib_path.is_none());
        assert_eq!(cfg.logging.retention_files, 7);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.tiling.fill_value = -1.0;
        original.backend.provider = ExecutionProvider::Tensorrt;
        original.backend.ort_dylib_path = Some(PathBuf::from("/opt/ort/libonnxruntime.so"));

        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_file_fills_missing_sections() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[tiling]\nhalo_policy = \"input\"\n\n[backend]\nprovider = \"cuda\"\n")
            .expect("write config");

        let cfg = AppConfig::load_from_path(&path).expect("load config");
        assert_eq!(cfg.tiling.halo_policy, HaloPolicy::Input);
        assert_eq!(cfg.tiling.fill_value, 0.0);
        assert_eq!(cfg.backend.provider, ExecutionProvider::Cuda);
        assert_eq!(cfg.paths, PathsConfig::default());
    }

    #[test]
    fn load_from_nonexistent_or_empty_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("missing.toml");
        assert_eq!(
            AppConfig::load_from_path(&missing).expect("load missing"),
            AppConfig::default()
        );

        let empty = dir.path().join("empty.toml");
        fs::write(&empty, "  \n").expect("write empty");
        assert_eq!(
            AppConfig::load_from_path(&empty).expect("load empty"),
            AppConfig::default()
        );
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[tiling\nfill_value = 1").expect("write config");

        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }

    #[test]
    fn run_options_carry_tiling_settings() {
        let tiling = TilingConfig {
            fill_value: f32::NAN,
            halo_policy: HaloPolicy::Input,
        };
        let options = tiling.run_options(Some([64, 64, 1]));
        assert!(options.fill_value.is_nan());
        assert_eq!(options.halo_policy, HaloPolicy::Input);
        assert_eq!(options.patch, Some([64, 64, 1]));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_var_then_default() {
        let previous = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(value) = previous {
            env::set_var(ENV_DATA_DIR, value);
        }
        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn initialize_creates_data_dir_and_preserves_existing_config() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = dir.path().join("data");
        initialize_data_dir(&root).expect("initialize data dir");
        assert!(config_path(&root).exists());

        let custom = "[logging]\nretention_files = 2\n";
        fs::write(config_path(&root), custom).expect("write custom config");
        initialize_data_dir(&root).expect("initialize again");
        assert_eq!(
            fs::read_to_string(config_path(&root)).expect("read config"),
            custom
        );
    }

    #[test]
    fn resolve_relative_to_keeps_absolute_paths() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }

    #[test]
    fn model_files_fall_back_to_models_dir() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("unet.onnx"), b"").expect("write model");

        assert_eq!(
            resolve_model_file(dir.path(), Path::new("unet.onnx")),
            dir.path().join("unet.onnx")
        );
        assert_eq!(
            resolve_model_file(dir.path(), Path::new("other.onnx")),
            PathBuf::from("other.onnx")
        );
    }
}
