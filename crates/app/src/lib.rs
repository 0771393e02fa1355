pub mod imaging;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use tessera_core::axis::AxisTag;
use tessera_core::backend::{configure_ort_dylib, ExecutionProvider, OrtBackend, SessionConfig};
use tessera_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_model_file, resolve_relative_to, AppConfig,
};
use tessera_core::logging::{LogSettings, DEFAULT_LOG_FILTER};
use tessera_core::tile_grid::TileGrid;
use tessera_core::{
    ImageBuffer, ImageExtent, ModelDescriptor, RunReport, RunState, TensorDescriptor, TileRunner,
};

#[derive(Parser)]
#[command(name = "tessera", about = "Tiled inference for image-to-image models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the padding plan and tile grid for an image size.
    Plan(PlanArgs),
    /// Run a model over one image per declared input.
    Run(RunArgs),
}

#[derive(Args)]
struct PlanArgs {
    #[arg(short = 'd', long, help = "Model descriptor (TOML or JSON)")]
    descriptor: PathBuf,
    #[arg(long)]
    width: usize,
    #[arg(long)]
    height: usize,
    #[arg(long, default_value_t = 1)]
    depth: usize,
    #[arg(long, help = "Channel count (defaults to the input's fixed extent, else 1)")]
    channels: Option<usize>,
    #[arg(long, help = "Requested patch edge, rounded up to a legal size")]
    patch: Option<usize>,
}

#[derive(Args)]
struct RunArgs {
    #[arg(short = 'd', long, help = "Model descriptor (TOML or JSON)")]
    descriptor: PathBuf,
    #[arg(short = 'm', long, help = "ONNX model file")]
    model: PathBuf,
    #[arg(
        short = 'i',
        long = "input",
        required = true,
        help = "Input image, repeat once per model input in declaration order"
    )]
    inputs: Vec<PathBuf>,
    #[arg(short = 'o', long, default_value = ".")]
    output_dir: PathBuf,
    #[arg(long, help = "Requested patch edge, rounded up to a legal size")]
    patch: Option<usize>,
    #[arg(long, help = "Execution provider override: cpu, cuda or tensorrt")]
    provider: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let init_error = initialize_data_dir(&resolved_data_dir).err();
    let (config, config_error) = match AppConfig::load_from_path(&config_path(&resolved_data_dir)) {
        Ok(config) => (config, None),
        Err(error) => (AppConfig::default(), Some(error)),
    };

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
        config.logging.retention_files,
    );
    if let Some(error) = init_error {
        warn!(error = %format!("{error:#}"), "Failed to initialize data directory");
    }
    if let Some(error) = config_error {
        warn!(error = %format!("{error:#}"), "Failed to load config file, using defaults");
    }
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Commands::Plan(args) => print_plan(args, &config, &resolved_data_dir),
        Commands::Run(args) => run_model(args, config, resolved_data_dir).await,
    }
}

fn init_logging(
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
    retention_files: usize,
) {
    let settings = LogSettings {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        env_filter: std::env::var("RUST_LOG").ok(),
        retention_files,
    };
    let filters = settings.filters();
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    match settings.open_file_sink() {
        Ok(sink) => {
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(sink.appender)
                    .with_filter(parse_env_filter_with_fallback(&filters.file, "file")),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }
            debug!(log_dir = %sink.dir.display(), "File logging enabled");
        }
        Err(unavailable) => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }
            warn!(
                attempted_log_dir = ?unavailable.dir,
                reason = %unavailable,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_descriptor(path: &Path, config: &AppConfig, data_dir: &Path) -> Result<ModelDescriptor> {
    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    let path = resolve_model_file(&models_dir, path);
    info!("Loading model descriptor: {}", path.display());
    ModelDescriptor::load_from_path(&path)
}

fn primary_input(model: &ModelDescriptor) -> Result<&TensorDescriptor> {
    model
        .primary_input()
        .with_context(|| format!("model '{}' declares no inputs", model.name))
}

/// Turn a single `--patch` edge into a legal per-axis patch. Axes the input
/// lacks stay at 1; depth never asks for more slices than the image has.
fn cli_patch(input: &TensorDescriptor, requested: usize, image: ImageExtent) -> [usize; 3] {
    let mut patch = [1; 3];
    for (k, tag) in AxisTag::SPATIAL.into_iter().enumerate() {
        if !input.has_axis(tag) {
            continue;
        }
        let wanted = match tag {
            AxisTag::Depth => requested.min(image.depth),
            _ => requested,
        };
        patch[k] = input.legal_patch(tag, wanted);
    }
    patch
}

fn print_plan(args: PlanArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let model = load_descriptor(&args.descriptor, config, data_dir)?;
    let input = primary_input(&model)?;
    let channels = args
        .channels
        .or_else(|| input.fixed_extent(AxisTag::Channel))
        .unwrap_or(1);
    let extent = ImageExtent::new(args.width, args.height, channels, args.depth);
    let patch = args.patch.map(|p| cli_patch(input, p, extent));

    let runner = TileRunner::new(model.clone(), config.tiling.run_options(patch));
    let plan = runner.plan(extent).context("Failed to plan tiles")?;
    let tiles: Vec<_> = TileGrid::new(plan).iter().collect();

    let summary = serde_json::json!({
        "model": model.name,
        "image": extent.native_shape(),
        "halo_policy": config.tiling.halo_policy,
        "plan": plan,
        "tiles": tiles,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_model(args: RunArgs, config: AppConfig, data_dir: PathBuf) -> Result<()> {
    let model = load_descriptor(&args.descriptor, &config, &data_dir)?;
    if args.inputs.len() != model.inputs.len() {
        bail!(
            "model '{}' declares {} input(s) but {} --input path(s) were given",
            model.name,
            model.inputs.len(),
            args.inputs.len()
        );
    }

    let images = args
        .inputs
        .iter()
        .map(|path| imaging::load_image(path))
        .collect::<Result<Vec<ImageBuffer>>>()?;
    let patch = match args.patch {
        Some(p) => Some(cli_patch(primary_input(&model)?, p, images[0].extent())),
        None => None,
    };

    configure_ort_dylib(config.backend.ort_dylib_path.as_deref());
    let models_dir = resolve_relative_to(&data_dir, &config.paths.models_dir);
    let model_path = resolve_model_file(&models_dir, &args.model);
    let trt_cache_dir = resolve_relative_to(&data_dir, &config.paths.trt_cache_dir);
    let provider = args
        .provider
        .as_deref()
        .map(ExecutionProvider::from_str_lossy)
        .unwrap_or(config.backend.provider);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current tile");
            let _ = cancel_tx.send(true);
        }
    });

    let options = config.tiling.run_options(patch);
    let report = tokio::task::spawn_blocking(move || -> Result<RunReport> {
        let mut backend = OrtBackend::load(&SessionConfig {
            model_path: &model_path,
            provider,
            trt_cache_dir: Some(&trt_cache_dir),
        })?;
        let mut runner = TileRunner::new(model, options)
            .with_cancel(cancel_rx)
            .with_progress(Box::new(|done, total| {
                info!(tile = done, total, "tile {done}/{total}");
            }));
        let inputs: Vec<&ImageBuffer> = images.iter().collect();
        runner
            .run(&mut backend, &inputs)
            .context("Tiled inference failed")
    })
    .await
    .context("Inference task panicked")??;

    if report.state == RunState::Stopped {
        warn!(
            tiles_completed = report.tiles_completed,
            total_tiles = report.total_tiles,
            "Run cancelled; writing partial result"
        );
    }

    std::fs::create_dir_all(&args.output_dir).with_context(|| {
        format!("Failed to create output directory: {}", args.output_dir.display())
    })?;
    let title = image_title(&args.inputs[0]);
    for output in &report.outputs {
        let base = args.output_dir.join(format!("{title}_{}", output.name));
        let written = imaging::save_output(output, &base)?;
        info!(
            output = %output.name,
            files = written.len(),
            "Wrote {} of {title} to {}",
            output.name,
            base.display()
        );
    }

    info!(
        state = ?report.state,
        tiles_completed = report.tiles_completed,
        total_tiles = report.total_tiles,
        halo = ?report.halo(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Run finished"
    );
    Ok(())
}

fn image_title(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn plan_subcommand_parses_extent_and_defaults() {
        let cli = Cli::try_parse_from([
            "tessera", "plan", "-d", "unet.toml", "--width", "512", "--height", "256",
        ])
        .unwrap();
        match cli.command {
            Commands::Plan(args) => {
                assert_eq!(args.descriptor, PathBuf::from("unet.toml"));
                assert_eq!((args.width, args.height, args.depth), (512, 256, 1));
                assert!(args.channels.is_none());
                assert!(args.patch.is_none());
            }
            Commands::Run(_) => panic!("expected plan"),
        }
    }

    #[test]
    fn run_subcommand_collects_repeated_inputs() {
        let cli = Cli::try_parse_from([
            "tessera", "-vv", "run", "-d", "fuse.toml", "-m", "fuse.onnx", "-i", "a.png", "-i",
            "b.tif", "--patch", "96",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.inputs, vec![PathBuf::from("a.png"), PathBuf::from("b.tif")]);
                assert_eq!(args.output_dir, PathBuf::from("."));
                assert_eq!(args.patch, Some(96));
            }
            Commands::Plan(_) => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_an_input() {
        assert!(Cli::try_parse_from(["tessera", "run", "-d", "m.toml", "-m", "m.onnx"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tessera", "plan", "-d", "m.toml", "--width", "8", "--height", "8", "--log-filter",
            "tessera_core=trace", "--data-dir", "/tmp/tessera",
        ])
        .unwrap();
        assert_eq!(cli.log_filter.as_deref(), Some("tessera_core=trace"));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/tessera")));
    }
}

#[cfg(test)]
mod patch_tests {
    use super::*;

    #[test]
    fn cli_patch_rounds_up_to_step() {
        let input = TensorDescriptor::new("input", "byxc")
            .unwrap()
            .with_minimum_size(&[1, 16, 16, 1])
            .with_step(&[0, 16, 16, 0]);
        let patch = cli_patch(&input, 100, ImageExtent::new(640, 480, 1, 1));
        assert_eq!(patch, [112, 112, 1]);
    }

    #[test]
    fn cli_patch_caps_depth_at_image_depth() {
        let input = TensorDescriptor::new("volume", "bczyx").unwrap();
        let patch = cli_patch(&input, 64, ImageExtent::new(200, 200, 1, 12));
        assert_eq!(patch, [64, 64, 12]);
    }

    #[test]
    fn image_title_uses_file_stem() {
        assert_eq!(image_title(Path::new("/data/cells.v2.tif")), "cells.v2");
        assert_eq!(image_title(Path::new("/")), "image");
    }
}
