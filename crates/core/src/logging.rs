//! Log filter selection and the rolling log file of the `tessera` binary.
//!
//! The binary owns the subscriber; this module picks the filter strings and
//! opens the appender.

use std::fs;
use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_RETENTION_FILES: usize = 7;
pub const LOG_DIR_NAME: &str = "logs";

/// ONNX Runtime is chatty at info level. The console keeps its errors, the
/// log file its warnings.
const CONSOLE_NOISE: &str = "ort=error";
const FILE_NOISE: &str = "ort=warn";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    /// `--log-filter`; wins over `-v` and `RUST_LOG`.
    pub cli_filter: Option<String>,
    pub env_filter: Option<String>,
    /// 0 means [`DEFAULT_RETENTION_FILES`].
    pub retention_files: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

#[derive(Debug)]
pub struct FileSink {
    pub dir: PathBuf,
    pub appender: RollingFileAppender,
}

/// Why logging stays console-only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct SinkUnavailable {
    pub dir: Option<PathBuf>,
    pub reason: String,
}

impl LogSettings {
    /// Noise filters are prepended only when the user did not choose a
    /// filter with `--log-filter` or `-v`.
    pub fn filters(&self) -> LogFilters {
        let chosen = match (self.cli_filter.as_deref(), self.verbose) {
            (Some(filter), _) => filter,
            (None, 0) => self.env_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER),
            (None, 1) => "debug",
            (None, _) => "trace",
        };
        let explicit = self.cli_filter.is_some() || self.verbose > 0;
        let with_noise = |noise: &str| {
            if explicit {
                chosen.to_string()
            } else {
                format!("{noise},{chosen}")
            }
        };
        LogFilters {
            console: with_noise(CONSOLE_NOISE),
            file: with_noise(FILE_NOISE),
        }
    }

    /// Daily rolling `tessera.*.log` files under `<data_dir>/logs`.
    pub fn open_file_sink(&self) -> Result<FileSink, SinkUnavailable> {
        let Some(data_dir) = self.data_dir.as_deref() else {
            return Err(SinkUnavailable {
                dir: None,
                reason: "no data directory configured".to_string(),
            });
        };
        let dir = data_dir.join(LOG_DIR_NAME);
        let unavailable = |reason: String| SinkUnavailable {
            dir: Some(dir.clone()),
            reason,
        };

        fs::create_dir_all(&dir)
            .map_err(|error| unavailable(format!("failed to create log directory: {error}")))?;
        let retention = match self.retention_files {
            0 => DEFAULT_RETENTION_FILES,
            n => n,
        };
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("tessera")
            .filename_suffix("log")
            .max_log_files(retention)
            .build(&dir)
            .map_err(|error| unavailable(format!("failed to open rolling log file: {error}")))?;
        Ok(FileSink { dir, appender })
    }
}
