//! Pipeline configuration, named quality presets and the runtime view
//! shared between stages.
//!
//! [`PipelineConfig`] is the static, serializable configuration used to
//! construct a pipeline. [`SharedConfig`] holds the fields control
//! operations may change while streaming; every stage reads it once per
//! iteration. Each field is applied independently, so a reader may see
//! a new quality with the previous downscale for one frame.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::CaptureTarget;
use crate::error::VrsError;

// ── Limits ───────────────────────────────────────────────────────

pub const QUALITY_RANGE: (u8, u8) = (1, 100);
pub const DOWNSCALE_RANGE: (f32, f32) = (0.1, 1.0);
pub const FPS_RANGE: (u32, u32) = (1, 240);
pub const EYE_SEPARATION_RANGE: (f32, f32) = (0.0, 0.1);

pub fn clamp_quality(q: u8) -> u8 {
    q.clamp(QUALITY_RANGE.0, QUALITY_RANGE.1)
}

pub fn clamp_downscale(f: f32) -> f32 {
    if f.is_nan() {
        return DOWNSCALE_RANGE.1;
    }
    f.clamp(DOWNSCALE_RANGE.0, DOWNSCALE_RANGE.1)
}

pub fn clamp_fps(fps: u32) -> u32 {
    fps.clamp(FPS_RANGE.0, FPS_RANGE.1)
}

pub fn clamp_eye_separation(sep: f32) -> f32 {
    if sep.is_nan() {
        return 0.0;
    }
    sep.clamp(EYE_SEPARATION_RANGE.0, EYE_SEPARATION_RANGE.1)
}

// ── EncoderBackend ───────────────────────────────────────────────

/// Preferred JPEG backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderBackend {
    /// Hardware encoder on the GPU.
    Gpu,
    /// Vectorized CPU encoder.
    Simd,
    /// Portable encoder, always available.
    Generic,
}

impl EncoderBackend {
    pub const ALL: [EncoderBackend; 3] = [Self::Gpu, Self::Simd, Self::Generic];

    pub fn name(self) -> &'static str {
        match self {
            Self::Gpu => "gpu",
            Self::Simd => "simd",
            Self::Generic => "generic",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Gpu => 0,
            Self::Simd => 1,
            Self::Generic => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Gpu,
            1 => Self::Simd,
            _ => Self::Generic,
        }
    }
}

impl fmt::Display for EncoderBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Sampling ─────────────────────────────────────────────────────

/// Resampling filter used by the stereo transform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
    #[default]
    Nearest,
    Bilinear,
}

// ── QualityPreset ────────────────────────────────────────────────

/// The fixed tuple a preset applies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresetSettings {
    pub quality: u8,
    pub downscale: f32,
    pub fps: u32,
    pub backend: EncoderBackend,
}

/// Named quality presets, from fastest to sharpest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreset {
    UltraPerformance,
    #[default]
    LowLatency,
    Balanced,
    Quality,
    MaximumQuality,
}

impl QualityPreset {
    pub const ALL: [QualityPreset; 5] = [
        Self::UltraPerformance,
        Self::LowLatency,
        Self::Balanced,
        Self::Quality,
        Self::MaximumQuality,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::UltraPerformance => "ultra_performance",
            Self::LowLatency => "low_latency",
            Self::Balanced => "balanced",
            Self::Quality => "quality",
            Self::MaximumQuality => "maximum_quality",
        }
    }

    pub fn settings(self) -> PresetSettings {
        let (quality, downscale, fps, backend) = match self {
            Self::UltraPerformance => (40, 0.35, 90, EncoderBackend::Simd),
            Self::LowLatency => (55, 0.5, 60, EncoderBackend::Simd),
            Self::Balanced => (70, 0.65, 60, EncoderBackend::Gpu),
            Self::Quality => (80, 0.8, 45, EncoderBackend::Gpu),
            Self::MaximumQuality => (95, 1.0, 30, EncoderBackend::Gpu),
        };
        PresetSettings {
            quality,
            downscale,
            fps,
            backend,
        }
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for QualityPreset {
    type Err = VrsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "ultra_performance" => Ok(Self::UltraPerformance),
            // Older viewers still send this name.
            "low_latency" | "ultra_low_latency" => Ok(Self::LowLatency),
            "balanced" => Ok(Self::Balanced),
            "quality" => Ok(Self::Quality),
            "maximum_quality" | "max_quality" => Ok(Self::MaximumQuality),
            _ => Err(VrsError::UnknownPreset(s.to_string())),
        }
    }
}

// ── PipelineConfig ───────────────────────────────────────────────

/// Static configuration used to build a pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
    pub network: NetworkConfig,
    pub buffers: BufferConfig,
}

/// Capture stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub target_fps: u32,
    /// Monitor index (0 = primary).
    pub monitor_index: u32,
    /// Raw window handle to capture instead of a monitor.
    pub window_handle: Option<u64>,
    pub capture_cursor: bool,
    /// Upper bound for one `capture_next` wait.
    pub timeout_ms: u32,
    /// Consecutive rebind attempts after access loss.
    pub recovery_attempts: u32,
    /// Delay before each rebind attempt.
    pub recovery_backoff_ms: u64,
}

/// Stereo and compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Preset the fields below were last filled from.
    pub preset: QualityPreset,
    pub quality: u8,
    pub downscale: f32,
    /// Explicit output size; 0 derives it from `downscale`.
    pub output_width: u32,
    pub output_height: u32,
    pub stereo: bool,
    pub eye_separation: f32,
    pub sampling: Sampling,
    /// Allow GPU stereo and GPU JPEG backends.
    pub use_gpu: bool,
    pub backend: EncoderBackend,
}

/// Broadcast server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    /// WebSocket port.
    pub port: u16,
    /// Static file port; 0 disables the HTTP surface.
    pub http_port: u16,
    pub max_clients: usize,
    pub ping_interval_ms: u64,
    /// A session with no pong for this long is torn down.
    pub keepalive_timeout_ms: u64,
    /// Frames buffered per session before drops begin.
    pub session_queue_depth: usize,
    pub tcp_nodelay: bool,
    /// Address advertised to viewers instead of the detected one.
    pub static_ip: Option<String>,
    /// Directory served by the HTTP surface.
    pub web_root: PathBuf,
}

/// Pool and queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub raw_pool_size: usize,
    /// Initial capacity of each raw buffer.
    pub raw_buffer_bytes: usize,
    pub compressed_pool_size: usize,
    pub compressed_buffer_bytes: usize,
    /// Capture-to-encode queue slots (power of two).
    pub queue_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_fps: 60,
            monitor_index: 0,
            window_handle: None,
            capture_cursor: true,
            timeout_ms: 16,
            recovery_attempts: 3,
            recovery_backoff_ms: 100,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        let preset = QualityPreset::default();
        let s = preset.settings();
        Self {
            preset,
            quality: s.quality,
            downscale: s.downscale,
            output_width: 0,
            output_height: 0,
            stereo: true,
            eye_separation: 0.03,
            sampling: Sampling::Nearest,
            use_gpu: true,
            backend: s.backend,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8765,
            http_port: 8080,
            max_clients: 4,
            ping_interval_ms: 1000,
            keepalive_timeout_ms: 10_000,
            session_queue_depth: 4,
            tcp_nodelay: true,
            static_ip: None,
            web_root: PathBuf::from("web"),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            raw_pool_size: 6,
            raw_buffer_bytes: 3840 * 2160 * 4,
            compressed_pool_size: 6,
            compressed_buffer_bytes: 1024 * 1024,
            queue_capacity: 4,
        }
    }
}

impl NetworkConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms.max(1))
    }
}

impl PipelineConfig {
    /// Apply `preset` to the encoder and capture fields.
    pub fn apply_preset(&mut self, preset: QualityPreset) {
        let s = preset.settings();
        self.encoder.preset = preset;
        self.encoder.quality = s.quality;
        self.encoder.downscale = s.downscale;
        self.encoder.backend = s.backend;
        self.capture.target_fps = s.fps;
    }

    /// Clamp every bounded field into range and check the rest.
    pub fn validated(mut self) -> Result<Self, VrsError> {
        self.capture.target_fps = clamp_fps(self.capture.target_fps);
        self.capture.recovery_attempts = self.capture.recovery_attempts.max(1);
        self.encoder.quality = clamp_quality(self.encoder.quality);
        self.encoder.downscale = clamp_downscale(self.encoder.downscale);
        self.encoder.eye_separation = clamp_eye_separation(self.encoder.eye_separation);
        self.encoder.output_width &= !1;
        self.encoder.output_height &= !1;
        self.network.session_queue_depth = self.network.session_queue_depth.max(1);
        self.buffers.raw_pool_size = self.buffers.raw_pool_size.max(1);
        self.buffers.compressed_pool_size = self.buffers.compressed_pool_size.max(1);
        if self.network.max_clients == 0 {
            return Err(VrsError::InvalidConfig("max_clients must be at least 1"));
        }
        if self.buffers.queue_capacity < 2 || !self.buffers.queue_capacity.is_power_of_two() {
            return Err(VrsError::InvalidConfig(
                "queue_capacity must be a power of two >= 2",
            ));
        }
        Ok(self)
    }
}

// ── SharedConfig ─────────────────────────────────────────────────

/// Per-frame encode parameters read by the encode loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeSettings {
    pub quality: u8,
    pub downscale: f32,
    pub output_width: u32,
    pub output_height: u32,
    pub stereo: bool,
    pub eye_separation: f32,
    pub backend: EncoderBackend,
}

/// Runtime-mutable configuration, shared by reference between the
/// orchestrator's control operations and the stage loops.
#[derive(Debug)]
pub struct SharedConfig {
    quality: AtomicU8,
    downscale_bits: AtomicU32,
    target_fps: AtomicU32,
    output_width: AtomicU32,
    output_height: AtomicU32,
    stereo: AtomicBool,
    eye_separation_bits: AtomicU32,
    backend: AtomicU8,
    preset: Mutex<Option<QualityPreset>>,
    pending_target: Mutex<Option<CaptureTarget>>,
    target_generation: AtomicU64,
}

impl SharedConfig {
    pub fn new(config: &PipelineConfig) -> Self {
        let enc = &config.encoder;
        Self {
            quality: AtomicU8::new(clamp_quality(enc.quality)),
            downscale_bits: AtomicU32::new(clamp_downscale(enc.downscale).to_bits()),
            target_fps: AtomicU32::new(clamp_fps(config.capture.target_fps)),
            output_width: AtomicU32::new(enc.output_width),
            output_height: AtomicU32::new(enc.output_height),
            stereo: AtomicBool::new(enc.stereo),
            eye_separation_bits: AtomicU32::new(clamp_eye_separation(enc.eye_separation).to_bits()),
            backend: AtomicU8::new(enc.backend.to_u8()),
            preset: Mutex::new(Some(enc.preset)),
            pending_target: Mutex::new(None),
            target_generation: AtomicU64::new(0),
        }
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn quality(&self) -> u8 {
        self.quality.load(Ordering::Relaxed)
    }

    pub fn downscale(&self) -> f32 {
        f32::from_bits(self.downscale_bits.load(Ordering::Relaxed))
    }

    pub fn target_fps(&self) -> u32 {
        self.target_fps.load(Ordering::Relaxed)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps() as f64)
    }

    pub fn stereo(&self) -> bool {
        self.stereo.load(Ordering::Relaxed)
    }

    pub fn eye_separation(&self) -> f32 {
        f32::from_bits(self.eye_separation_bits.load(Ordering::Relaxed))
    }

    pub fn backend(&self) -> EncoderBackend {
        EncoderBackend::from_u8(self.backend.load(Ordering::Relaxed))
    }

    /// The last preset applied, or `None` after a manual override.
    pub fn preset(&self) -> Option<QualityPreset> {
        *self.preset.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn encode_settings(&self) -> EncodeSettings {
        EncodeSettings {
            quality: self.quality(),
            downscale: self.downscale(),
            output_width: self.output_width.load(Ordering::Relaxed),
            output_height: self.output_height.load(Ordering::Relaxed),
            stereo: self.stereo(),
            eye_separation: self.eye_separation(),
            backend: self.backend(),
        }
    }

    // ── Writes ───────────────────────────────────────────────────

    pub fn set_quality(&self, quality: u8) -> u8 {
        let q = clamp_quality(quality);
        self.quality.store(q, Ordering::Relaxed);
        self.clear_preset();
        q
    }

    pub fn set_downscale(&self, factor: f32) -> f32 {
        let f = clamp_downscale(factor);
        self.downscale_bits.store(f.to_bits(), Ordering::Relaxed);
        self.clear_preset();
        f
    }

    pub fn set_target_fps(&self, fps: u32) -> u32 {
        let fps = clamp_fps(fps);
        self.target_fps.store(fps, Ordering::Relaxed);
        fps
    }

    /// Force an output size; `(0, 0)` returns to downscale-derived sizing.
    pub fn set_output_size(&self, width: u32, height: u32) {
        self.output_width.store(width & !1, Ordering::Relaxed);
        self.output_height.store(height & !1, Ordering::Relaxed);
    }

    pub fn set_stereo(&self, enabled: bool) {
        self.stereo.store(enabled, Ordering::Relaxed);
    }

    pub fn set_eye_separation(&self, sep: f32) -> f32 {
        let s = clamp_eye_separation(sep);
        self.eye_separation_bits.store(s.to_bits(), Ordering::Relaxed);
        s
    }

    pub fn set_backend(&self, backend: EncoderBackend) {
        self.backend.store(backend.to_u8(), Ordering::Relaxed);
    }

    /// Apply every field of `preset`.
    pub fn apply_preset(&self, preset: QualityPreset) {
        let s = preset.settings();
        self.quality.store(s.quality, Ordering::Relaxed);
        self.downscale_bits.store(s.downscale.to_bits(), Ordering::Relaxed);
        self.target_fps.store(s.fps, Ordering::Relaxed);
        self.backend.store(s.backend.to_u8(), Ordering::Relaxed);
        *self.preset.lock().unwrap_or_else(|e| e.into_inner()) = Some(preset);
    }

    fn clear_preset(&self) {
        *self.preset.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    // ── Capture source ───────────────────────────────────────────

    /// Request a new capture source. The capture loop picks it up on its
    /// next iteration.
    pub fn request_target(&self, target: CaptureTarget) -> u64 {
        *self.pending_target.lock().unwrap_or_else(|e| e.into_inner()) = Some(target);
        self.target_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Take a pending source change, if any.
    pub fn take_target(&self) -> Option<CaptureTarget> {
        self.pending_target
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Bumped on every `request_target`.
    pub fn target_generation(&self) -> u64 {
        self.target_generation.load(Ordering::Acquire)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::WindowHandle;

    #[test]
    fn preset_names_round_trip() {
        for p in QualityPreset::ALL {
            assert_eq!(p.name().parse::<QualityPreset>().unwrap(), p);
        }
        assert_eq!(
            "Ultra-Performance".parse::<QualityPreset>().unwrap(),
            QualityPreset::UltraPerformance
        );
        assert!("turbo".parse::<QualityPreset>().is_err());
    }

    #[test]
    fn apply_preset_reads_back_exact_tuple() {
        let shared = SharedConfig::new(&PipelineConfig::default());
        for first in QualityPreset::ALL {
            for second in QualityPreset::ALL {
                shared.apply_preset(first);
                shared.set_quality(3);
                shared.set_downscale(0.15);
                shared.set_target_fps(200);
                shared.apply_preset(second);

                let s = second.settings();
                assert_eq!(shared.quality(), s.quality);
                assert_eq!(shared.downscale(), s.downscale);
                assert_eq!(shared.target_fps(), s.fps);
                assert_eq!(shared.backend(), s.backend);
                assert_eq!(shared.preset(), Some(second));
            }
        }
    }

    #[test]
    fn setters_clamp() {
        let shared = SharedConfig::new(&PipelineConfig::default());
        assert_eq!(shared.set_quality(0), 1);
        assert_eq!(shared.set_quality(250), 100);
        assert_eq!(shared.set_downscale(0.0), 0.1);
        assert_eq!(shared.set_downscale(4.0), 1.0);
        assert_eq!(shared.set_downscale(f32::NAN), 1.0);
        assert_eq!(shared.set_target_fps(0), 1);
        assert_eq!(shared.set_eye_separation(0.5), 0.1);
        assert_eq!(shared.preset(), None);
    }

    #[test]
    fn default_config_uses_low_latency() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.encoder.preset, QualityPreset::LowLatency);
        assert_eq!(cfg.encoder.quality, 55);
        assert_eq!(cfg.encoder.downscale, 0.5);
        assert_eq!(cfg.network.port, 8765);
        assert_eq!(cfg.network.max_clients, 4);
    }

    #[test]
    fn validated_rejects_bad_queue_capacity() {
        let mut cfg = PipelineConfig::default();
        cfg.buffers.queue_capacity = 3;
        assert!(cfg.validated().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.encoder.quality = 0;
        cfg.encoder.output_width = 1281;
        let cfg = cfg.validated().unwrap();
        assert_eq!(cfg.encoder.quality, 1);
        assert_eq!(cfg.encoder.output_width, 1280);
    }

    #[test]
    fn target_requests_bump_generation() {
        let shared = SharedConfig::new(&PipelineConfig::default());
        assert_eq!(shared.target_generation(), 0);
        assert_eq!(shared.request_target(CaptureTarget::Monitor(1)), 1);
        assert_eq!(
            shared.request_target(CaptureTarget::Window(WindowHandle(42))),
            2
        );
        assert_eq!(
            shared.take_target(),
            Some(CaptureTarget::Window(WindowHandle(42)))
        );
        assert_eq!(shared.take_target(), None);
    }

    #[test]
    fn config_serializes_to_json() {
        let cfg = PipelineConfig::default();
        let text = serde_json::to_string(&cfg).unwrap();
        assert!(text.contains("\"low_latency\""));
        let back: PipelineConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.network.http_port, 8080);
    }
}
