//! Command-line host for the upres engine.
//!
//! `upscale` drives the tiled super-resolution pipeline over a single
//! image file; `shader` runs a chain of directive-annotated GLSL passes.
//! Like any host, the CLI converts to packed RGBA8 at the boundary and
//! falls back to the original image when a request fails.

mod resample;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use upres_core::config::EngineConfig;
use upres_core::logging::{select_filter, LogOptions};
use upres_core::{Engine, InitOptions, ModelFamily, OutputImage, PackedImage};

use resample::ResampleFactory;

#[derive(Parser)]
#[command(name = "upres", version, about = "Tiled image super-resolution")]
struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Explicit tracing filter, e.g. "upres_core=debug"
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upscale an image with a convolutional model
    Upscale(UpscaleArgs),
    /// Run a GLSL shader chain over an image
    Shader(ShaderArgs),
}

#[derive(Args)]
struct UpscaleArgs {
    input: PathBuf,
    output: PathBuf,

    /// Config file with defaults (models dir, tile settings)
    #[arg(long, default_value = "upres.toml")]
    config: PathBuf,

    /// Directory holding the model's .param/.bin pair
    #[arg(long)]
    models_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "real-cugan")]
    family: FamilyArg,

    /// Denoise level (-1..=4 depending on the family)
    #[arg(long, default_value_t = 0)]
    noise: i32,

    #[arg(long, default_value_t = 2)]
    scale: u32,

    /// Per-tile sleep in milliseconds (thermal governor)
    #[arg(long)]
    tile_sleep_ms: Option<u64>,

    /// Tile edge length
    #[arg(long)]
    tile_size: Option<u32>,

    /// Never collapse near-gray images to pure grayscale
    #[arg(long)]
    disable_grayscale_check: bool,
}

#[derive(Args)]
struct ShaderArgs {
    input: PathBuf,
    output: PathBuf,

    /// Shader source file; repeat to chain passes in order
    #[arg(long = "shader", required = true)]
    shaders: Vec<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum FamilyArg {
    #[value(name = "waifu2x-cunet")]
    Waifu2xCunet,
    #[value(name = "waifu2x-upconv7")]
    UpConv7,
    #[value(name = "real-cugan")]
    RealCugan,
    #[value(name = "real-esrgan")]
    RealEsrgan,
    #[value(name = "nose")]
    Nose,
}

impl From<FamilyArg> for ModelFamily {
    fn from(value: FamilyArg) -> Self {
        match value {
            FamilyArg::Waifu2xCunet => ModelFamily::Waifu2xCunet,
            FamilyArg::UpConv7 => ModelFamily::UpConv7,
            FamilyArg::RealCugan => ModelFamily::RealCugan,
            FamilyArg::RealEsrgan => ModelFamily::RealEsrgan,
            FamilyArg::Nose => ModelFamily::Nose,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = select_filter(&LogOptions {
        cli_filter: cli.log_filter.clone(),
        verbose: cli.verbose,
        rust_log_env: std::env::var("RUST_LOG").ok(),
    });
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let result = match cli.command {
        Command::Upscale(args) => run_upscale(args),
        Command::Shader(args) => run_shader(args),
    };

    if let Err(err) = result {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn run_upscale(args: UpscaleArgs) -> Result<()> {
    let engine = Engine::install(Box::new(ResampleFactory));

    let config = EngineConfig::load_from_path(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let models_dir = args
        .models_dir
        .unwrap_or_else(|| config.paths.models_dir.clone());
    let tile_sleep_ms = args
        .tile_sleep_ms
        .unwrap_or(config.performance.tile_sleep_ms);
    let tile_size = args.tile_size.unwrap_or(config.performance.tile_size);

    let mut options = InitOptions::new(args.family.into(), &models_dir, args.noise, args.scale);
    options.tile_sleep_ms = tile_sleep_ms;
    options.disable_grayscale_check = args.disable_grayscale_check;
    engine
        .init(options)
        .context("failed to initialize the engine")?;
    engine.update_performance_config(tile_sleep_ms, tile_size);

    let source = image::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?
        .to_rgba8();
    let (w, h) = source.dimensions();
    let input = PackedImage::from_rgba8(source.as_raw(), w, h)
        .context("input image is not a valid RGBA8 buffer")?;

    let out_w = w * args.scale;
    let out_h = h * args.scale;
    let mut out_buf = vec![0u8; (out_w * out_h * 4) as usize];
    let mut out = OutputImage::new(&mut out_buf, out_w, out_h, out_w as usize * 4)
        .context("failed to set up the output buffer")?;

    info!(input = %args.input.display(), w, h, out_w, out_h, "upscaling");
    if let Err(err) = engine.process(&input, &mut out, 0) {
        // Host contract: the caller gets the original image back on any
        // fatal failure, never a black frame.
        warn!("process failed ({err}), writing the original image");
        source
            .save(&args.output)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        return Ok(());
    }

    let out_image = image::RgbaImage::from_raw(out_w, out_h, out_buf)
        .context("output buffer has unexpected size")?;
    out_image
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!(output = %args.output.display(), "done");
    Ok(())
}

fn run_shader(args: ShaderArgs) -> Result<()> {
    let engine = Engine::install(Box::new(ResampleFactory));

    let mut sources = Vec::with_capacity(args.shaders.len());
    let mut names = Vec::with_capacity(args.shaders.len());
    for path in &args.shaders {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read shader {}", path.display()))?;
        sources.push(source);
        names.push(
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "shader".to_string()),
        );
    }

    engine
        .init_shader_chain(&sources, &names)
        .context("failed to compile the shader chain")?;

    let source = image::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?
        .to_rgba8();
    let (w, h) = source.dimensions();

    if let Some((out_w, out_h)) = engine.shader_chain_output_size(w, h) {
        info!(w, h, out_w, out_h, passes = args.shaders.len(), "running shader chain");
    }

    let (pixels, out_w, out_h) = engine
        .process_shader_chain(source.as_raw(), w, h)
        .context("shader chain execution failed")?;

    let Some(out_image) = image::RgbaImage::from_raw(out_w, out_h, pixels) else {
        bail!("shader chain returned a malformed buffer");
    };
    out_image
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!(output = %args.output.display(), out_w, out_h, "done");
    Ok(())
}
