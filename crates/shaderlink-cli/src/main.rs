mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::ImageEncoder;

use shaderlink_core::hash::hash_image;
use shaderlink_core::ShaderlinkConfig;
use shaderlink_render::{run_benchmark, spawn_gpu_engine, BenchmarkRequest, ResetOptions, ShutdownMode};

const DEFAULT_CONFIG: &str = "shaderlink.toml";

#[derive(Parser)]
#[command(
    name = "shaderlink",
    version,
    about = "Shaderlink: remote control plane for a live shader engine",
    long_about = "Shaderlink drives a single-threaded GPU render engine over HTTP.\nEdit shaders and uniforms live, render screenshots and variant batches, measure frame times."
)]
struct Cli {
    /// Path to the configuration file (default: ./shaderlink.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP control server
    Serve {
        /// Address to listen on
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Render one frame of the default scene to a PNG file
    Capture {
        #[arg(long)]
        width: Option<u32>,

        #[arg(long)]
        height: Option<u32>,

        /// Output PNG path
        #[arg(short, long, default_value = "capture.png")]
        output: PathBuf,
    },

    /// Measure the mean frame time of the default scene
    Bench {
        #[arg(long, default_value_t = 1024)]
        width: u32,

        #[arg(long, default_value_t = 1024)]
        height: u32,

        /// Timed frames
        #[arg(long, default_value_t = 100)]
        frames: u32,

        /// Untimed frames before measuring
        #[arg(long, default_value_t = 100)]
        warmup: u32,
    },

    /// Write the default configuration file
    Init {
        /// Where to write it
        #[arg(default_value = DEFAULT_CONFIG)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Serve { host, port } => cmd_serve(cli.config.as_deref(), host, port),
        Commands::Capture {
            width,
            height,
            output,
        } => cmd_capture(cli.config.as_deref(), width, height, &output),
        Commands::Bench {
            width,
            height,
            frames,
            warmup,
        } => cmd_bench(
            cli.config.as_deref(),
            BenchmarkRequest {
                width,
                height,
                frames,
                warmup,
            },
        ),
        Commands::Init { path, force } => cmd_init(&path, force),
    }
}

fn load_config(path: Option<&Path>) -> Result<ShaderlinkConfig> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG).exists() => Path::new(DEFAULT_CONFIG),
        None => {
            tracing::info!("no {} found, using the built-in material", DEFAULT_CONFIG);
            return Ok(ShaderlinkConfig::default());
        }
    };
    let config = ShaderlinkConfig::load_from_file(path)
        .with_context(|| format!("failed to load config: {}", path.display()))?;
    tracing::info!("loaded {} ({} materials)", path.display(), config.materials.len());
    Ok(config)
}

/// Start the engine thread and bind every material's generated program.
fn start_engine(config: &ShaderlinkConfig) -> Result<shaderlink_render::GpuEngineHandle> {
    let started = Instant::now();
    let engine = spawn_gpu_engine(config).context("failed to start render engine")?;
    engine
        .call_blocking(|s| s.reset(ResetOptions::default()))
        .context("failed to build default programs")?;
    println!(
        "   ✓ Engine ready in {:.1}ms",
        started.elapsed().as_secs_f64() * 1000.0
    );
    Ok(engine)
}

fn cmd_serve(config: Option<&Path>, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = load_config(config)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    println!("🎛  Starting Shaderlink server...");
    let engine = Arc::new(start_engine(&config)?);
    run_async(server::run_server(engine, &config))
}

fn cmd_capture(
    config: Option<&Path>,
    width: Option<u32>,
    height: Option<u32>,
    output: &Path,
) -> Result<()> {
    let config = load_config(config)?;
    let width = width.unwrap_or(config.render.width);
    let height = height.unwrap_or(config.render.height);

    println!("📸 Capturing {}x{}", width, height);
    let engine = start_engine(&config)?;
    let image = engine
        .call_blocking(move |s| s.render(width, height))
        .context("render failed")?;
    engine.shutdown(ShutdownMode::Drain);

    let file = std::fs::File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    image::codecs::png::PngEncoder::new(std::io::BufWriter::new(file))
        .write_image(
            &image.pixels,
            image.width,
            image.height,
            image::ExtendedColorType::Rgb8,
        )
        .with_context(|| format!("failed to encode {}", output.display()))?;

    println!("   ✓ Wrote {}", output.display());
    println!("   sha256: {}", hash_image(&image));
    Ok(())
}

fn cmd_bench(config: Option<&Path>, request: BenchmarkRequest) -> Result<()> {
    request.validate()?;
    let config = load_config(config)?;

    println!("⚡ Shaderlink Frame Benchmark");
    println!(
        "   {}x{}, {} warmup + {} timed frames",
        request.width, request.height, request.warmup, request.frames
    );
    let engine = start_engine(&config)?;
    let report = engine
        .call_blocking(move |s| run_benchmark(s, &request))
        .context("benchmark failed")?;
    engine.shutdown(ShutdownMode::Drain);

    println!("\n📊 Benchmark Report:");
    println!("{:<14} | {:>14}", "Metric", "Value");
    println!("{:-<14}-+-{:->14}", "", "");
    println!("{:<14} | {:>14}", "ns / frame", report.speed);
    println!("{:<14} | {:>14.1}", "fps", report.fps());
    println!(
        "{:<14} | {:>14.1}",
        "total (ms)",
        report.total_ns as f64 / 1e6
    );
    Ok(())
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    ShaderlinkConfig::default()
        .save_to_file(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("✓ Wrote {}", path.display());
    Ok(())
}

fn run_async<F>(future: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to initialize async runtime")?;
    runtime.block_on(future)
}
