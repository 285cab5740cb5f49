//! The streaming pipeline: capture thread → SPSC queue → encode thread →
//! broadcast server, plus a statistics thread.
//!
//! ```text
//!  capture ──try_push──► [ring] ──try_pop──► encode ──push_frame──► server
//!     ▲                                         │
//!     └────────── FramePool ◄───── release ─────┘
//! ```
//!
//! Stage loops never block on each other: a full ring drops the newest
//! frame and an empty ring is a short backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use tracing::{debug, info, warn};

use crate::capture::{
    CaptureBackend, CaptureTarget, Capturer, MonitorInfo, RecoveryPolicy, WindowHandle,
    WindowInfo,
};
use crate::config::{EncoderBackend, PipelineConfig, QualityPreset, SharedConfig};
use crate::encoder::VrFrameEncoder;
use crate::error::VrsError;
use crate::frame::{CompressedFrame, RawFrame};
use crate::pool::{CompressedPool, FramePool};
use crate::queue::{Consumer, Producer, spsc_queue};
use crate::server::{ServerConfig, ServerHandle, ServerStats, StreamingServer};
use crate::stats::{PipelineCounters, PipelineStats, RateMeter};
use crate::stereo::output_dimensions;

pub type StatsCallback = Arc<dyn Fn(&PipelineStats) + Send + Sync>;

const STATS_INTERVAL: Duration = Duration::from_secs(1);
/// Sleep while the capture source is unavailable.
const UNAVAILABLE_SLEEP: Duration = Duration::from_millis(50);
/// Compressed frames tracked for reclamation before the oldest are let go.
const MAX_IN_FLIGHT: usize = 64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Loop context ─────────────────────────────────────────────────

/// State shared by the three pipeline threads.
struct LoopContext {
    config: Arc<SharedConfig>,
    counters: PipelineCounters,
    running: AtomicBool,
    capture_available: AtomicBool,
    raw_pool: FramePool,
    compressed_pool: CompressedPool,
    capture_timeout: Duration,
    stereo_backend: &'static str,
    /// JPEG backend each preference resolves to, indexed like
    /// `EncoderBackend::ALL`.
    jpeg_backends: [&'static str; 3],
    started: Mutex<Instant>,
}

impl LoopContext {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn jpeg_backend(&self, pref: EncoderBackend) -> &'static str {
        let i = EncoderBackend::ALL
            .iter()
            .position(|b| *b == pref)
            .unwrap_or(0);
        self.jpeg_backends[i]
    }

    fn snapshot(&self, capture_fps: f64, encode_fps: f64, server: &ServerStats) -> PipelineStats {
        let c = &self.counters;
        let bytes_encoded = PipelineCounters::get(&c.bytes_encoded);
        let bytes_raw = PipelineCounters::get(&c.bytes_raw);
        let settings = self.config.encode_settings();
        PipelineStats {
            capture_fps,
            capture_time_ms: c.capture_time.avg_ms(),
            frames_captured: PipelineCounters::get(&c.frames_captured),
            capture_drops: PipelineCounters::get(&c.capture_drops),
            capture_failures: PipelineCounters::get(&c.capture_failures),
            capture_available: self.capture_available.load(Ordering::Relaxed),

            encode_fps,
            stereo_time_ms: c.stereo_time.avg_ms(),
            jpeg_time_ms: c.jpeg_time.avg_ms(),
            total_encode_time_ms: c.encode_time.avg_ms(),
            frames_encoded: PipelineCounters::get(&c.frames_encoded),
            encode_failures: PipelineCounters::get(&c.encode_failures),
            compression_ratio: if bytes_encoded == 0 {
                0.0
            } else {
                bytes_raw as f64 / bytes_encoded as f64
            },

            stream_fps: server.fps,
            connected_clients: server.connected_clients,
            avg_latency_ms: server.avg_latency_ms,
            bitrate_mbps: server.bitrate_mbps,
            frames_sent: server.frames_sent,
            frames_dropped: server.frames_dropped,
            bytes_sent: server.bytes_sent,

            uptime_seconds: lock(&self.started).elapsed().as_secs_f64(),
            current_quality: settings.quality,
            downscale_factor: settings.downscale,
            stereo_enabled: settings.stereo,
            stereo_backend: self.stereo_backend.to_string(),
            jpeg_backend: self.jpeg_backend(settings.backend).to_string(),
        }
    }
}

// ── VrStreamer ───────────────────────────────────────────────────

/// Owns the pipeline threads and the broadcast server.
pub struct VrStreamer {
    config: PipelineConfig,
    shared: Arc<SharedConfig>,
    backend: Option<Box<dyn CaptureBackend>>,
    capturer: Option<Arc<Mutex<Capturer>>>,
    encoder: Option<VrFrameEncoder>,
    context: Option<Arc<LoopContext>>,
    server: StreamingServer,
    stats_callback: Arc<Mutex<Option<StatsCallback>>>,
    latest: Arc<Mutex<PipelineStats>>,

    capture_thread: Option<JoinHandle<()>>,
    encode_thread: Option<JoinHandle<VrFrameEncoder>>,
    stats_thread: Option<JoinHandle<()>>,
}

impl VrStreamer {
    pub fn new(config: PipelineConfig, backend: Box<dyn CaptureBackend>) -> Result<Self, VrsError> {
        let config = config.validated()?;
        let shared = Arc::new(SharedConfig::new(&config));
        let server = StreamingServer::new(ServerConfig::from_network(&config.network));

        let preset_target = Arc::clone(&shared);
        server.on_quality_request(move |name| match name.parse::<QualityPreset>() {
            Ok(preset) => {
                preset_target.apply_preset(preset);
                info!(preset = %preset, "applied client-requested preset");
            }
            Err(e) => warn!(error = %e, "ignoring quality request"),
        });

        Ok(Self {
            config,
            shared,
            backend: Some(backend),
            capturer: None,
            encoder: None,
            context: None,
            server,
            stats_callback: Arc::new(Mutex::new(None)),
            latest: Arc::new(Mutex::new(PipelineStats::default())),
            capture_thread: None,
            encode_thread: None,
            stats_thread: None,
        })
    }

    /// Bind the capture source, probe stereo and JPEG backends and
    /// allocate the pools. Failures here are fatal.
    pub fn init(&mut self) -> Result<(), VrsError> {
        if self.context.is_some() {
            return Ok(());
        }
        let cfg = &self.config;

        let capturer = match &self.capturer {
            Some(c) => Arc::clone(c),
            None => {
                let backend = self.backend.take().ok_or(VrsError::NotInitialized)?;
                let policy = RecoveryPolicy {
                    max_attempts: cfg.capture.recovery_attempts,
                    backoff: Duration::from_millis(cfg.capture.recovery_backoff_ms),
                };
                Arc::new(Mutex::new(Capturer::new(backend, policy)))
            }
        };
        self.capturer = Some(Arc::clone(&capturer));

        let target = match cfg.capture.window_handle {
            Some(h) => CaptureTarget::Window(WindowHandle(h)),
            None => CaptureTarget::Monitor(cfg.capture.monitor_index),
        };
        {
            let mut cap = lock(&capturer);
            cap.set_capture_cursor(cfg.capture.capture_cursor);
            cap.initialize(target)?;
        }

        let encoder = VrFrameEncoder::new(cfg.encoder.use_gpu, cfg.encoder.sampling)?;
        let jpeg_backends = EncoderBackend::ALL.map(|b| encoder.jpeg_name(b));
        let bufs = &cfg.buffers;

        let context = LoopContext {
            config: Arc::clone(&self.shared),
            counters: PipelineCounters::default(),
            running: AtomicBool::new(false),
            capture_available: AtomicBool::new(true),
            raw_pool: FramePool::new(bufs.raw_buffer_bytes, bufs.raw_pool_size),
            compressed_pool: CompressedPool::new(bufs.compressed_buffer_bytes, bufs.compressed_pool_size),
            capture_timeout: Duration::from_millis(cfg.capture.timeout_ms as u64),
            stereo_backend: encoder.stereo_name(),
            jpeg_backends,
            started: Mutex::new(Instant::now()),
        };
        info!(
            capture = lock(&capturer).backend_name(),
            stereo = context.stereo_backend,
            jpeg = context.jpeg_backend(self.shared.backend()),
            "pipeline initialized"
        );
        self.encoder = Some(encoder);
        self.context = Some(Arc::new(context));
        Ok(())
    }

    /// Start the server and the pipeline threads.
    pub fn start(&mut self) -> Result<(), VrsError> {
        if self.is_streaming() {
            return Err(VrsError::AlreadyRunning);
        }
        let ctx = self.context.clone().ok_or(VrsError::NotInitialized)?;
        let capturer = self.capturer.clone().ok_or(VrsError::NotInitialized)?;
        if self.encoder.is_none() {
            return Err(VrsError::NotInitialized);
        }
        let (producer, consumer) = spsc_queue::<RawFrame>(self.config.buffers.queue_capacity)?;

        self.advertise_stream_geometry();
        self.server.start()?;
        let net = &self.config.network;
        if net.http_port != 0 {
            if let Err(e) = self.server.start_http(net.web_root.clone(), net.http_port) {
                warn!(error = %e, "web viewer unavailable");
            }
        }

        *lock(&ctx.started) = Instant::now();
        ctx.running.store(true, Ordering::Release);
        if let Err(e) = self.spawn_threads(&ctx, capturer, producer, consumer) {
            self.stop();
            return Err(e);
        }
        info!(url = %self.server.connection_url(), "streaming started");
        Ok(())
    }

    fn spawn_threads(
        &mut self,
        ctx: &Arc<LoopContext>,
        capturer: Arc<Mutex<Capturer>>,
        producer: Producer<RawFrame>,
        consumer: Consumer<RawFrame>,
    ) -> Result<(), VrsError> {
        let c = Arc::clone(ctx);
        self.capture_thread = Some(
            thread::Builder::new()
                .name("vrs-capture".into())
                .spawn(move || capture_loop(&c, &capturer, producer))
                .map_err(|source| VrsError::Spawn {
                    name: "capture",
                    source,
                })?,
        );

        let encoder = self.encoder.take().ok_or(VrsError::NotInitialized)?;
        let c = Arc::clone(ctx);
        let server = self.server.handle();
        self.encode_thread = Some(
            thread::Builder::new()
                .name("vrs-encode".into())
                .spawn(move || encode_loop(&c, encoder, consumer, &server))
                .map_err(|source| VrsError::Spawn {
                    name: "encode",
                    source,
                })?,
        );

        let c = Arc::clone(ctx);
        let server = self.server.handle();
        let callback = Arc::clone(&self.stats_callback);
        let latest = Arc::clone(&self.latest);
        self.stats_thread = Some(
            thread::Builder::new()
                .name("vrs-stats".into())
                .spawn(move || stats_loop(&c, &server, &callback, &latest))
                .map_err(|source| VrsError::Spawn {
                    name: "stats",
                    source,
                })?,
        );
        Ok(())
    }

    /// Stop the threads, then the server. Safe to call more than once.
    pub fn stop(&mut self) {
        let Some(ctx) = &self.context else {
            return;
        };
        let was_running = ctx.running.swap(false, Ordering::AcqRel);

        if let Some(t) = self.stats_thread.take() {
            t.thread().unpark();
            if t.join().is_err() {
                warn!("stats thread panicked");
            }
        }
        if let Some(t) = self.capture_thread.take() {
            if t.join().is_err() {
                warn!("capture thread panicked");
            }
        }
        if let Some(t) = self.encode_thread.take() {
            match t.join() {
                Ok(encoder) => self.encoder = Some(encoder),
                Err(_) => warn!("encode thread panicked; pipeline needs re-init"),
            }
        }
        self.server.stop();
        if was_running {
            info!("streaming stopped");
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.context.as_ref().is_some_and(|c| c.running())
    }

    /// Fresh counters; rates come from the last published snapshot.
    pub fn stats(&self) -> PipelineStats {
        let Some(ctx) = &self.context else {
            return PipelineStats::default();
        };
        let (capture_fps, encode_fps) = {
            let latest = lock(&self.latest);
            (latest.capture_fps, latest.encode_fps)
        };
        ctx.snapshot(capture_fps, encode_fps, &self.server.stats())
    }

    /// Called once per second from the statistics thread.
    pub fn on_stats(&self, f: impl Fn(&PipelineStats) + Send + Sync + 'static) {
        *lock(&self.stats_callback) = Some(Arc::new(f));
    }

    pub fn server(&self) -> &StreamingServer {
        &self.server
    }

    pub fn shared_config(&self) -> &Arc<SharedConfig> {
        &self.shared
    }

    // ── Control ──────────────────────────────────────────────────

    pub fn set_quality(&self, quality: u8) -> u8 {
        let q = self.shared.set_quality(quality);
        info!(quality = q, "quality changed");
        q
    }

    pub fn set_downscale(&self, factor: f32) -> f32 {
        let f = self.shared.set_downscale(factor);
        info!(downscale = f, "downscale changed");
        self.advertise_stream_geometry();
        f
    }

    pub fn set_eye_separation(&self, sep: f32) -> f32 {
        self.shared.set_eye_separation(sep)
    }

    pub fn set_stereo(&self, enabled: bool) {
        self.shared.set_stereo(enabled);
        info!(stereo = enabled, "stereo mode changed");
        self.advertise_stream_geometry();
    }

    pub fn apply_preset(&self, preset: QualityPreset) {
        self.shared.apply_preset(preset);
        let s = preset.settings();
        info!(
            preset = %preset,
            quality = s.quality,
            downscale = s.downscale,
            fps = s.fps,
            backend = %s.backend,
            "preset applied"
        );
        self.advertise_stream_geometry();
    }

    pub fn set_capture_monitor(&mut self, index: u32) -> Result<(), VrsError> {
        self.set_capture_target(CaptureTarget::Monitor(index))
    }

    pub fn set_capture_window(&mut self, handle: WindowHandle) -> Result<(), VrsError> {
        self.set_capture_target(CaptureTarget::Window(handle))
    }

    /// While streaming the switch happens on the capture thread's next
    /// iteration and errors are only logged; otherwise it is immediate.
    fn set_capture_target(&mut self, target: CaptureTarget) -> Result<(), VrsError> {
        if self.is_streaming() {
            let generation = self.shared.request_target(target);
            debug!(%target, generation, "capture source change requested");
        } else if let Some(capturer) = &self.capturer {
            lock(capturer).set_target(target)?;
            if let Some(ctx) = &self.context {
                ctx.capture_available.store(true, Ordering::Relaxed);
            }
        }

        // Remembered so a later init() binds the same source.
        match target {
            CaptureTarget::Monitor(i) => {
                self.config.capture.monitor_index = i;
                self.config.capture.window_handle = None;
            }
            CaptureTarget::Window(h) => self.config.capture.window_handle = Some(h.0),
        }
        self.advertise_stream_geometry();
        Ok(())
    }

    pub fn monitors(&self) -> Result<Vec<MonitorInfo>, VrsError> {
        match (&self.capturer, &self.backend) {
            (Some(c), _) => Ok(lock(c).monitors()?),
            (None, Some(b)) => Ok(b.monitors()?),
            (None, None) => Ok(Vec::new()),
        }
    }

    pub fn windows(&self) -> Result<Vec<WindowInfo>, VrsError> {
        match (&self.capturer, &self.backend) {
            (Some(c), _) => Ok(lock(c).windows()?),
            (None, Some(b)) => Ok(b.windows()?),
            (None, None) => Ok(Vec::new()),
        }
    }

    pub fn connection_url(&self) -> String {
        self.server.connection_url()
    }

    /// Tell new clients what geometry to expect, from the bound monitor
    /// and the current settings.
    fn advertise_stream_geometry(&self) {
        let Some(capturer) = &self.capturer else {
            return;
        };
        let Some(rect) = lock(capturer).monitor().map(|m| m.rect) else {
            return;
        };
        let s = self.shared.encode_settings();
        let (w, h) = if s.stereo {
            output_dimensions(
                rect.width(),
                rect.height(),
                s.downscale,
                (s.output_width, s.output_height),
            )
            .unwrap_or((rect.width(), rect.height()))
        } else {
            (rect.width(), rect.height())
        };
        self.server.set_stream_info(w, h, s.stereo);
    }
}

impl Drop for VrStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Loops ────────────────────────────────────────────────────────

fn capture_loop(ctx: &LoopContext, capturer: &Mutex<Capturer>, mut producer: Producer<RawFrame>) {
    let backoff = Backoff::new();
    let counters = &ctx.counters;
    debug!("capture loop started");

    while ctx.running() {
        let frame_start = Instant::now();
        let interval = ctx.config.frame_interval();
        let mut cap = lock(capturer);

        if let Some(target) = ctx.config.take_target() {
            match cap.set_target(target) {
                Ok(()) => info!(%target, "capture source switched"),
                Err(e) => warn!(%target, error = %e, "capture source switch failed"),
            }
        }
        let available = cap.is_available();
        if ctx.capture_available.swap(available, Ordering::Relaxed) && !available {
            warn!("capture unavailable; skipping frames until the source is reconfigured");
        }
        if !available {
            drop(cap);
            thread::sleep(UNAVAILABLE_SLEEP);
            continue;
        }

        let mut produced = false;
        match cap.capture_next(ctx.capture_timeout) {
            Ok(Some(mut held)) => {
                let mut frame = ctx.raw_pool.acquire();
                let copied = held.copy_to_host(&mut frame);
                drop(held);
                match copied {
                    Ok(_) => {
                        PipelineCounters::bump(&counters.frames_captured);
                        counters.capture_time.record(frame_start.elapsed());
                        if let Err(frame) = producer.try_push(frame) {
                            ctx.raw_pool.release(frame);
                            PipelineCounters::bump(&counters.capture_drops);
                        }
                        produced = true;
                    }
                    Err(e) => {
                        ctx.raw_pool.release(frame);
                        PipelineCounters::bump(&counters.capture_failures);
                        debug!(error = %e, "frame skipped");
                    }
                }
            }
            Ok(None) => PipelineCounters::bump(&counters.capture_timeouts),
            Err(e) => {
                PipelineCounters::bump(&counters.capture_failures);
                warn!(error = %e, "capture failed");
            }
        }
        drop(cap);

        if produced {
            backoff.reset();
            let elapsed = frame_start.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        } else {
            backoff.snooze();
        }
    }
    debug!("capture loop stopped");
}

fn encode_loop(
    ctx: &LoopContext,
    mut encoder: VrFrameEncoder,
    mut consumer: Consumer<RawFrame>,
    server: &ServerHandle,
) -> VrFrameEncoder {
    let backoff = Backoff::new();
    let counters = &ctx.counters;
    let mut in_flight: Vec<Arc<CompressedFrame>> = Vec::with_capacity(MAX_IN_FLIGHT);
    debug!("encode loop started");

    loop {
        let Some(raw) = consumer.try_pop() else {
            if !ctx.running() {
                break;
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
            continue;
        };
        backoff.reset();

        let settings = ctx.config.encode_settings();
        let mut out = ctx.compressed_pool.acquire();
        let result = encoder.encode(&raw, &settings, &mut out);
        let raw_bytes = raw.packed_row_len() as u64 * raw.height as u64;
        ctx.raw_pool.release(raw);

        match result {
            Ok(()) => {
                let s = encoder.stats();
                PipelineCounters::bump(&counters.frames_encoded);
                PipelineCounters::add(&counters.bytes_encoded, out.len() as u64);
                PipelineCounters::add(&counters.bytes_raw, raw_bytes);
                counters.stereo_time.record(s.stereo_time);
                counters.jpeg_time.record(s.encode_time);
                counters.encode_time.record(s.total_time);

                ctx.compressed_pool.reclaim(&mut in_flight);
                if in_flight.len() >= MAX_IN_FLIGHT {
                    in_flight.remove(0);
                }
                let frame = Arc::new(out);
                server.push_frame(Arc::clone(&frame));
                in_flight.push(frame);
            }
            Err(e) => {
                PipelineCounters::bump(&counters.encode_failures);
                debug!(error = %e, "encode failed; frame skipped");
                ctx.compressed_pool.release(out);
            }
        }
    }

    ctx.compressed_pool.reclaim(&mut in_flight);
    debug!("encode loop stopped");
    encoder
}

fn stats_loop(
    ctx: &LoopContext,
    server: &ServerHandle,
    callback: &Mutex<Option<StatsCallback>>,
    latest: &Mutex<PipelineStats>,
) {
    let mut capture_rate = RateMeter::new();
    let mut encode_rate = RateMeter::new();

    while ctx.running() {
        thread::park_timeout(STATS_INTERVAL);
        if !ctx.running() {
            break;
        }
        let capture_fps = capture_rate.update(PipelineCounters::get(&ctx.counters.frames_captured));
        let encode_fps = encode_rate.update(PipelineCounters::get(&ctx.counters.frames_encoded));
        let stats = ctx.snapshot(capture_fps, encode_fps, &server.stats());

        debug!(
            capture_fps = format_args!("{:.1}", stats.capture_fps),
            encode_fps = format_args!("{:.1}", stats.encode_fps),
            clients = stats.connected_clients,
            mbps = format_args!("{:.2}", stats.bitrate_mbps),
            "pipeline stats"
        );
        *lock(latest) = stats.clone();
        let cb = lock(callback).clone();
        if let Some(cb) = cb {
            cb(&stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticBackend;

    fn test_config() -> PipelineConfig {
        let mut cfg = PipelineConfig::default();
        cfg.network.host = "127.0.0.1".into();
        cfg.network.port = 0;
        cfg.network.http_port = 0;
        cfg.network.static_ip = Some("127.0.0.1".into());
        cfg.buffers.raw_buffer_bytes = 320 * 240 * 4;
        cfg.buffers.compressed_buffer_bytes = 64 * 1024;
        cfg
    }

    fn streamer(cfg: PipelineConfig) -> VrStreamer {
        let backend = SyntheticBackend::new(320, 240).with_frame_rate(120);
        VrStreamer::new(cfg, Box::new(backend)).unwrap()
    }

    #[test]
    fn start_requires_init() {
        let mut s = streamer(test_config());
        assert!(matches!(s.start(), Err(VrsError::NotInitialized)));
    }

    #[test]
    fn init_fails_for_missing_monitor() {
        let mut cfg = test_config();
        cfg.capture.monitor_index = 5;
        let mut s = streamer(cfg);
        assert!(matches!(s.init(), Err(VrsError::Capture(_))));
        assert!(!s.is_streaming());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = test_config();
        cfg.buffers.queue_capacity = 3;
        let backend = SyntheticBackend::new(64, 64);
        assert!(matches!(
            VrStreamer::new(cfg, Box::new(backend)),
            Err(VrsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn runs_encodes_and_stops() {
        let mut s = streamer(test_config());
        s.init().unwrap();
        s.start().unwrap();
        assert!(s.is_streaming());
        assert!(matches!(s.start(), Err(VrsError::AlreadyRunning)));

        let deadline = Instant::now() + Duration::from_secs(10);
        while s.stats().frames_encoded < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let stats = s.stats();
        assert!(stats.frames_encoded >= 5, "{stats:?}");
        assert!(stats.capture_available);
        assert!(stats.compression_ratio > 1.0);
        assert_eq!(stats.current_quality, 55);

        s.stop();
        assert!(!s.is_streaming());
        s.stop();

        // Restartable after stop.
        s.start().unwrap();
        s.stop();
    }

    #[test]
    fn control_ops_reach_shared_config() {
        let s = streamer(test_config());
        assert_eq!(s.set_quality(250), 100);
        assert_eq!(s.set_downscale(0.0), 0.1);
        assert_eq!(s.set_eye_separation(1.0), 0.1);
        s.set_stereo(false);
        assert!(!s.shared_config().stereo());

        s.apply_preset(QualityPreset::Quality);
        let cfg = s.shared_config();
        assert_eq!(cfg.quality(), 80);
        assert_eq!(cfg.target_fps(), 45);
        assert_eq!(cfg.preset(), Some(QualityPreset::Quality));
    }

    #[test]
    fn monitor_switch_before_start_is_immediate() {
        let backend = SyntheticBackend::with_monitors(vec![
            crate::capture::Rect::from_size(0, 0, 320, 240),
            crate::capture::Rect::from_size(320, 0, 320, 240),
        ]);
        let mut s = VrStreamer::new(test_config(), Box::new(backend)).unwrap();
        assert_eq!(s.monitors().unwrap().len(), 2);
        s.init().unwrap();
        s.set_capture_monitor(1).unwrap();
        assert!(matches!(s.set_capture_monitor(9), Err(VrsError::Capture(_))));
    }
}
