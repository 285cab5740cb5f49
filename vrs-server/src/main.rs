//! VR screen streamer entry point.
//!
//! ```text
//! vrs-server                          Stream monitor 0 with vrs-server.toml
//! vrs-server --preset balanced        Start from a named preset
//! vrs-server --window "firefox"       Capture a window by title
//! vrs-server --list-sources           Print monitors and windows and exit
//! vrs-server --gen-config             Write default config to stdout
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vrs_core::QualityPreset;
use vrs_server::config::StreamerConfig;
use vrs_server::service::{self, Overrides, StreamerService};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vrs-server", about = "Stream the desktop to VR headsets as side-by-side stereo")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "vrs-server.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Print capturable monitors and windows and exit.
    #[arg(long)]
    list_sources: bool,

    /// WebSocket port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Port of the web viewer; 0 disables it.
    #[arg(long)]
    http_port: Option<u16>,

    /// Named preset, applied before --quality, --fps and --scale.
    #[arg(long, value_parser = clap::value_parser!(QualityPreset))]
    preset: Option<QualityPreset>,

    /// JPEG quality (1-100).
    #[arg(short, long)]
    quality: Option<u8>,

    /// Capture frame rate.
    #[arg(long)]
    fps: Option<u32>,

    /// Downscale factor (0.1-1.0).
    #[arg(long)]
    scale: Option<f32>,

    /// Monitor index to capture.
    #[arg(short, long)]
    monitor: Option<u32>,

    /// Capture the first window whose title contains this text.
    #[arg(short, long, conflicts_with = "hwnd")]
    window: Option<String>,

    /// Capture a window by raw handle (decimal or 0x hex).
    #[arg(long, value_parser = service::parse_handle)]
    hwnd: Option<u64>,

    /// Send flat frames instead of side-by-side stereo.
    #[arg(long)]
    no_vr: bool,

    /// Skip GPU stereo and JPEG backends.
    #[arg(long)]
    no_gpu: bool,

    /// Use the synthetic test source instead of the desktop.
    #[arg(long)]
    synthetic: bool,

    /// Directory served by the web viewer.
    #[arg(long)]
    web_root: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            port: self.port,
            http_port: self.http_port,
            preset: self.preset,
            quality: self.quality,
            fps: self.fps,
            scale: self.scale,
            monitor: self.monitor,
            hwnd: self.hwnd,
            no_vr: self.no_vr,
            no_gpu: self.no_gpu,
            web_root: self.web_root.clone(),
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

fn main() -> Result<(), service::BoxError> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        println!("{}", StreamerConfig::default_toml()?);
        return Ok(());
    }

    let file = StreamerConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&file.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let backend = service::select_backend(cli.synthetic);

    // --list-sources: enumerate and exit.
    if cli.list_sources {
        print!("{}", service::describe_sources(backend.as_ref())?);
        return Ok(());
    }

    let mut config = file.to_pipeline_config();
    cli.overrides().apply(&mut config);

    info!("vrs-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        port = config.network.port,
        http_port = config.network.http_port,
        preset = %config.encoder.preset,
        quality = config.encoder.quality,
        fps = config.capture.target_fps,
        stereo = config.encoder.stereo,
        "starting"
    );

    let mut service = StreamerService::new(
        config,
        backend,
        cli.window.as_deref(),
        Duration::from_secs(file.logging.stats_interval_secs),
    )?;
    if let Err(e) = service.start() {
        error!("startup failed: {e}");
        service.stop();
        return Err(e);
    }

    // Park the main thread until Ctrl-C.
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(tokio::signal::ctrl_c())?;
    info!("Ctrl-C received, shutting down");

    service.stop();
    let stats = service.streamer().stats();
    info!(
        frames_captured = stats.frames_captured,
        frames_encoded = stats.frames_encoded,
        frames_sent = stats.frames_sent,
        uptime_s = format_args!("{:.0}", stats.uptime_seconds),
        "stopped"
    );
    Ok(())
}
