//! Streamer service: turns file configuration plus command-line
//! overrides into a running [`VrStreamer`].

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

use vrs_core::capture::{Rect, SyntheticBackend};
use vrs_core::{
    CaptureBackend, PipelineConfig, PipelineStats, QualityPreset, VrStreamer, WindowInfo,
    default_backend,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ── Overrides ────────────────────────────────────────────────────

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub http_port: Option<u16>,
    pub preset: Option<QualityPreset>,
    pub quality: Option<u8>,
    pub fps: Option<u32>,
    pub scale: Option<f32>,
    pub monitor: Option<u32>,
    pub hwnd: Option<u64>,
    pub no_vr: bool,
    pub no_gpu: bool,
    pub web_root: Option<PathBuf>,
}

impl Overrides {
    /// A preset is applied first so explicit quality, fps and scale
    /// values can refine it.
    pub fn apply(&self, cfg: &mut PipelineConfig) {
        if let Some(preset) = self.preset {
            cfg.apply_preset(preset);
        }
        if let Some(q) = self.quality {
            cfg.encoder.quality = q;
        }
        if let Some(fps) = self.fps {
            cfg.capture.target_fps = fps;
        }
        if let Some(scale) = self.scale {
            cfg.encoder.downscale = scale;
        }
        if let Some(port) = self.port {
            cfg.network.port = port;
        }
        if let Some(port) = self.http_port {
            cfg.network.http_port = port;
        }
        if let Some(index) = self.monitor {
            cfg.capture.monitor_index = index;
            cfg.capture.window_handle = None;
        }
        if let Some(hwnd) = self.hwnd {
            cfg.capture.window_handle = Some(hwnd);
        }
        if self.no_vr {
            cfg.encoder.stereo = false;
        }
        if self.no_gpu {
            cfg.encoder.use_gpu = false;
        }
        if let Some(root) = &self.web_root {
            cfg.network.web_root = root.clone();
        }
    }
}

/// Parse a window handle given as decimal or `0x`-prefixed hex.
pub fn parse_handle(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid window handle {s:?}: {e}"))
}

// ── Sources ──────────────────────────────────────────────────────

/// Capture backend for this run.
pub fn select_backend(synthetic: bool) -> Box<dyn CaptureBackend> {
    if !synthetic {
        return default_backend();
    }
    let backend = SyntheticBackend::with_monitors(vec![
        Rect::from_size(0, 0, 1920, 1080),
        Rect::from_size(1920, 0, 1280, 1024),
    ]);
    let desktop = backend.desktop();
    desktop.add_window("Synthetic Terminal", Rect::from_size(120, 80, 960, 600));
    desktop.add_window("Synthetic Browser", Rect::from_size(2000, 100, 1100, 800));
    Box::new(backend)
}

/// First window whose title contains `needle`, ignoring case.
pub fn find_window<'a>(windows: &'a [WindowInfo], needle: &str) -> Option<&'a WindowInfo> {
    let needle = needle.to_lowercase();
    windows
        .iter()
        .find(|w| w.title.to_lowercase().contains(&needle))
}

/// Human-readable listing of monitors and capturable windows.
pub fn describe_sources(backend: &dyn CaptureBackend) -> Result<String, BoxError> {
    let mut out = String::new();
    writeln!(out, "Monitors ({}):", backend.name())?;
    for m in backend.monitors()? {
        writeln!(
            out,
            "  [{}] {} {}x{} at ({}, {}){}",
            m.index,
            m.name,
            m.rect.width(),
            m.rect.height(),
            m.rect.left,
            m.rect.top,
            if m.primary { " primary" } else { "" },
        )?;
    }
    writeln!(out, "Windows:")?;
    for w in backend.windows()? {
        writeln!(
            out,
            "  {} {:?} {}x{}",
            w.handle,
            w.title,
            w.rect.width(),
            w.rect.height(),
        )?;
    }
    Ok(out)
}

// ── StreamerService ──────────────────────────────────────────────

/// Owns the pipeline for the lifetime of the process.
pub struct StreamerService {
    streamer: VrStreamer,
    stats_interval: Duration,
}

impl StreamerService {
    /// Build the pipeline. `window_title` is resolved against the
    /// backend's window list before anything is bound.
    pub fn new(
        mut config: PipelineConfig,
        backend: Box<dyn CaptureBackend>,
        window_title: Option<&str>,
        stats_interval: Duration,
    ) -> Result<Self, BoxError> {
        if let Some(title) = window_title {
            let windows = backend.windows()?;
            let window = find_window(&windows, title)
                .ok_or_else(|| format!("no capturable window matches {title:?}"))?;
            info!(handle = %window.handle, title = %window.title, "capturing window");
            config.capture.window_handle = Some(window.handle.0);
        }
        let streamer = VrStreamer::new(config, backend)?;
        Ok(Self {
            streamer,
            stats_interval,
        })
    }

    /// Bind capture, start the server and the pipeline threads.
    pub fn start(&mut self) -> Result<(), BoxError> {
        self.streamer.init()?;
        if !self.stats_interval.is_zero() {
            let interval = self.stats_interval;
            let last = Mutex::new(Instant::now());
            self.streamer.on_stats(move |s| {
                let mut last = last.lock().unwrap_or_else(|e| e.into_inner());
                if last.elapsed() + Duration::from_millis(100) >= interval {
                    *last = Instant::now();
                    log_stats(s);
                }
            });
        }
        self.streamer.start()?;
        info!("viewer: {}", self.streamer.connection_url());
        Ok(())
    }

    pub fn stop(&mut self) {
        self.streamer.stop();
    }

    pub fn streamer(&self) -> &VrStreamer {
        &self.streamer
    }
}

fn log_stats(s: &PipelineStats) {
    info!(
        capture_fps = format_args!("{:.1}", s.capture_fps),
        encode_fps = format_args!("{:.1}", s.encode_fps),
        stream_fps = format_args!("{:.1}", s.stream_fps),
        clients = s.connected_clients,
        mbps = format_args!("{:.2}", s.bitrate_mbps),
        latency_ms = format_args!("{:.1}", s.avg_latency_ms),
        quality = s.current_quality,
        drops = s.capture_drops + s.frames_dropped,
        "stats"
    );
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_then_explicit_values() {
        let mut cfg = PipelineConfig::default();
        Overrides {
            preset: Some(QualityPreset::Quality),
            quality: Some(33),
            no_vr: true,
            port: Some(9000),
            ..Overrides::default()
        }
        .apply(&mut cfg);

        assert_eq!(cfg.encoder.quality, 33);
        assert_eq!(cfg.encoder.downscale, 0.8);
        assert_eq!(cfg.capture.target_fps, 45);
        assert!(!cfg.encoder.stereo);
        assert_eq!(cfg.network.port, 9000);
        assert_eq!(cfg.network.http_port, 8080);
    }

    #[test]
    fn monitor_clears_window_but_hwnd_wins() {
        let mut cfg = PipelineConfig::default();
        cfg.capture.window_handle = Some(7);
        Overrides {
            monitor: Some(1),
            ..Overrides::default()
        }
        .apply(&mut cfg);
        assert_eq!(cfg.capture.monitor_index, 1);
        assert_eq!(cfg.capture.window_handle, None);

        Overrides {
            monitor: Some(1),
            hwnd: Some(0x2a),
            ..Overrides::default()
        }
        .apply(&mut cfg);
        assert_eq!(cfg.capture.window_handle, Some(42));
    }

    #[test]
    fn handles_parse_as_hex_or_decimal() {
        assert_eq!(parse_handle("0x1A2B"), Ok(0x1a2b));
        assert_eq!(parse_handle("4660"), Ok(4660));
        assert!(parse_handle("0xZZ").is_err());
        assert!(parse_handle("").is_err());
    }

    #[test]
    fn synthetic_sources_are_listed() {
        let backend = select_backend(true);
        let text = describe_sources(backend.as_ref()).unwrap();
        assert!(text.contains("[0]"));
        assert!(text.contains("[1]"));
        assert!(text.contains("Synthetic Browser"));
        assert!(text.contains("Synthetic Terminal"));
    }

    #[test]
    fn window_lookup_ignores_case() {
        let backend = select_backend(true);
        let windows = backend.windows().unwrap();
        let found = find_window(&windows, "terminal").unwrap();
        assert_eq!(found.title, "Synthetic Terminal");
        assert!(find_window(&windows, "notepad").is_none());
    }

    #[test]
    fn unknown_window_title_is_an_error() {
        let result = StreamerService::new(
            PipelineConfig::default(),
            select_backend(true),
            Some("no such window"),
            Duration::ZERO,
        );
        assert!(result.is_err());
    }
}
