//! Particle Lab CLI
//!
//! Run the particle simulation headless, push still images through the
//! particle filter, inspect the GPU, or open a live window.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use particle_lab::{
    FrameDriver, FrameObserver, FrameOutcome, GpuContext, ImageFilterBridge, ParticleCamFilter,
    ShaderLibrary,
};

mod config;
#[cfg(feature = "windowed")]
mod window;

use config::Overrides;

#[derive(Parser)]
#[command(name = "particle-lab")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "GPU particle simulation and image filters", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulation offscreen
    Run {
        /// Simulation config (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of frames to run
        #[arg(short, long, default_value = "300")]
        frames: u32,

        /// Particle count (262144, 524288, 1048576, 2097152 or 4194304)
        #[arg(long)]
        count: Option<usize>,

        /// Seed for reproducible initial state
        #[arg(long)]
        seed: Option<u64>,

        /// Fade trails by this factor instead of clearing every frame
        #[arg(long)]
        darken: Option<f32>,

        /// Camera image modulating particle colors
        #[arg(long)]
        camera: Option<PathBuf>,

        /// Write the final frame as PNG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the particle filter over a still image
    Filter {
        /// Input image
        #[arg(short, long)]
        input: PathBuf,

        /// Number of filter applications
        #[arg(short, long, default_value = "60")]
        frames: u32,

        /// Particle count
        #[arg(long, default_value = "262144")]
        count: usize,

        /// Per-step velocity multiplier
        #[arg(long)]
        drag: Option<f32>,

        /// Seed for reproducible initial state
        #[arg(long)]
        seed: Option<u64>,

        /// Write the last filtered frame as PNG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show adapter and dispatch information
    Info,

    /// Present the simulation in a window
    #[cfg(feature = "windowed")]
    Window {
        /// Simulation config (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Routes frame notifications into the log
struct LogObserver;

impl FrameObserver for LogObserver {
    fn on_device_unavailable(&mut self, reason: &str) {
        error!("GPU unavailable: {}", reason);
    }

    fn on_statistics(&mut self, _fps: u32, label: &str) {
        info!("{}", label);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            config,
            frames,
            count,
            seed,
            darken,
            camera,
            output,
        } => {
            let overrides = Overrides {
                count,
                seed,
                darken,
            };
            cmd_run(
                config.as_deref(),
                &overrides,
                frames,
                camera.as_deref(),
                output.as_deref(),
            )
        }

        Commands::Filter {
            input,
            frames,
            count,
            drag,
            seed,
            output,
        } => cmd_filter(&input, frames, count, drag, seed, output.as_deref()),

        Commands::Info => cmd_info(),

        #[cfg(feature = "windowed")]
        Commands::Window { config } => {
            let config = config::load(config.as_deref(), &Overrides::default())?;
            window::run(config)
        }
    }
}

fn load_image(path: &Path) -> Result<image::RgbaImage> {
    let image = image::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(image.to_rgba8())
}

fn save_image(image: &image::RgbaImage, path: &Path) -> Result<()> {
    image
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {}x{} frame to {}", image.width(), image.height(), path.display());
    Ok(())
}

fn cmd_run(
    config_path: Option<&Path>,
    overrides: &Overrides,
    frames: u32,
    camera: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let config = config::load(config_path, overrides)?;
    let camera = camera.map(load_image).transpose()?;

    info!(
        "Running {} particles over {}x{} for {} frames",
        config.particle_count.get(),
        config.width,
        config.height,
        frames
    );

    let mut driver = FrameDriver::headless(config, Box::new(LogObserver))
        .context("Failed to start simulation")?;
    if let Some(image) = camera {
        driver.submit_image(image);
    }

    let mut dropped = 0u32;
    for _ in 0..frames {
        if let FrameOutcome::Dropped(reason) = driver.step() {
            dropped += 1;
            tracing::debug!("Frame dropped: {:?}", reason);
        }
    }
    driver.wait_idle();

    if dropped > 0 {
        warn!("{} of {} frames were dropped", dropped, frames);
    }
    info!("{} frames completed on the device", driver.completed_frames());

    if let Some(path) = output {
        let frame = driver.read_output().context("Failed to read back frame")?;
        save_image(&frame, path)?;
    }

    Ok(())
}

fn cmd_filter(
    input: &Path,
    frames: u32,
    count: usize,
    drag: Option<f32>,
    seed: Option<u64>,
    output: Option<&Path>,
) -> Result<()> {
    let image = load_image(input)?;
    let gpu = GpuContext::new().context("Failed to acquire GPU")?;

    let particles = ParticleCamFilter::seed_particles(count, image.width(), image.height(), seed)?;
    let mut bridge = ImageFilterBridge::new(gpu, ParticleCamFilter::camera(particles))
        .context("Failed to build particle filter")?;
    if let Some(drag) = drag {
        bridge.set_scalar(ParticleCamFilter::DRAG, drag)?;
    }

    info!(
        "Filtering {} ({}x{}) with {} particles for {} frames",
        input.display(),
        image.width(),
        image.height(),
        count,
        frames
    );

    let mut last = None;
    for _ in 0..frames {
        last = Some(bridge.apply(Some(&image))?);
    }

    if let (Some(filtered), Some(path)) = (last, output) {
        let frame = filtered.read_back().context("Failed to read back frame")?;
        save_image(&frame, path)?;
    }

    Ok(())
}

fn cmd_info() -> Result<()> {
    println!("Particle Lab");
    println!("============");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    let gpu = match GpuContext::new() {
        Ok(gpu) => gpu,
        Err(e) => {
            println!("GPU: unavailable ({})", e);
            return Ok(());
        }
    };

    let limits = gpu.limits();
    println!("Adapter: {}", gpu.adapter_info());
    println!("Execution granularity: {}", gpu.execution_granularity(None));
    println!(
        "Max invocations per workgroup: {}",
        limits.max_compute_invocations_per_workgroup
    );
    println!("Max texture dimension: {}", limits.max_texture_dimension_2d);
    println!();
    println!("Built-in programs:");
    for name in ShaderLibrary::builtin().names() {
        println!("  - {}", name);
    }

    Ok(())
}
