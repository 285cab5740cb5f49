//! Counters, rolling estimators and the aggregate statistics snapshot.
//!
//! Stage loops bump lock-free counters in [`PipelineCounters`]; the
//! statistics loop turns counter deltas into rates once per second and
//! publishes a [`PipelineStats`] snapshot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

// ── BandwidthEstimator ───────────────────────────────────────────

/// Rolling-window throughput estimator with a smoothed RTT.
///
/// Records `(timestamp, bytes)` samples and computes the average
/// throughput over the most recent `window`.
#[derive(Debug)]
pub struct BandwidthEstimator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    /// Running total of bytes in the window.
    total_bytes: u64,
    smoothed_rtt_us: u64,
}

impl BandwidthEstimator {
    /// Create an estimator with a 1-second rolling window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(256),
            window,
            total_bytes: 0,
            smoothed_rtt_us: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    /// Record with an explicit timestamp (useful for testing).
    pub fn record_at(&mut self, when: Instant, bytes: u64) {
        self.samples.push_back((when, bytes));
        self.total_bytes += bytes;
        self.evict(when);
    }

    /// Update the smoothed RTT (EWMA, α = 1/8).
    pub fn record_rtt(&mut self, rtt: Duration) {
        let rtt_us = rtt.as_micros() as u64;
        if self.smoothed_rtt_us == 0 {
            self.smoothed_rtt_us = rtt_us;
        } else {
            self.smoothed_rtt_us = self.smoothed_rtt_us * 7 / 8 + rtt_us / 8;
        }
    }

    /// Throughput in bytes/second over the window ending at `now`.
    pub fn bytes_per_sec_at(&mut self, now: Instant) -> u64 {
        self.evict(now);
        let Some(&(first, _)) = self.samples.front() else {
            return 0;
        };
        let span = now.duration_since(first).max(Duration::from_millis(1));
        (self.total_bytes as f64 / span.as_secs_f64().max(self.window.as_secs_f64())) as u64
    }

    pub fn bytes_per_sec(&mut self) -> u64 {
        self.bytes_per_sec_at(Instant::now())
    }

    pub fn megabits_per_sec(&mut self) -> f64 {
        self.bytes_per_sec() as f64 * 8.0 / 1_000_000.0
    }

    /// Smoothed round-trip time, or `Duration::ZERO` if not yet measured.
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.smoothed_rtt_us)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, bytes)) = self.samples.front() {
            if now.saturating_duration_since(ts) > self.window {
                self.samples.pop_front();
                self.total_bytes = self.total_bytes.saturating_sub(bytes);
            } else {
                break;
            }
        }
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// ── RateMeter ────────────────────────────────────────────────────

/// Turns a monotonically increasing counter into a per-second rate.
#[derive(Debug)]
pub struct RateMeter {
    last_count: u64,
    last_at: Instant,
    rate: f64,
}

impl RateMeter {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            last_count: 0,
            last_at: now,
            rate: 0.0,
        }
    }

    /// Feed the current counter value and return the rate since the
    /// previous call.
    pub fn update_at(&mut self, count: u64, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_at).as_secs_f64();
        if elapsed > 0.0 {
            self.rate = count.saturating_sub(self.last_count) as f64 / elapsed;
            self.last_count = count;
            self.last_at = now;
        }
        self.rate
    }

    pub fn update(&mut self, count: u64) -> f64 {
        self.update_at(count, Instant::now())
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

// ── TimingStat ───────────────────────────────────────────────────

/// Last and smoothed duration of a repeated operation.
///
/// Written by one stage thread, read by anyone.
#[derive(Debug, Default)]
pub struct TimingStat {
    last_us: AtomicU64,
    avg_us: AtomicU64,
}

impl TimingStat {
    pub fn record(&self, d: Duration) {
        let us = d.as_micros() as u64;
        self.last_us.store(us, Ordering::Relaxed);
        let avg = self.avg_us.load(Ordering::Relaxed);
        let next = if avg == 0 { us } else { (avg * 9 + us) / 10 };
        self.avg_us.store(next, Ordering::Relaxed);
    }

    pub fn last_ms(&self) -> f64 {
        self.last_us.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn avg_ms(&self) -> f64 {
        self.avg_us.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

// ── PipelineCounters ─────────────────────────────────────────────

/// Counters shared by the capture and encode loops.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub frames_captured: AtomicU64,
    /// Capture-to-encode queue was full.
    pub capture_drops: AtomicU64,
    /// Per-frame capture failures (window gone or too small).
    pub capture_failures: AtomicU64,
    /// `capture_next` returned without a new frame.
    pub capture_timeouts: AtomicU64,
    pub frames_encoded: AtomicU64,
    /// Frames skipped because encoding failed or produced nothing.
    pub encode_failures: AtomicU64,
    pub bytes_encoded: AtomicU64,
    pub bytes_raw: AtomicU64,
    pub capture_time: TimingStat,
    pub stereo_time: TimingStat,
    pub jpeg_time: TimingStat,
    pub encode_time: TimingStat,
}

impl PipelineCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

// ── PipelineStats ────────────────────────────────────────────────

/// Aggregate statistics published once per second.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    // Capture
    pub capture_fps: f64,
    pub capture_time_ms: f64,
    pub frames_captured: u64,
    pub capture_drops: u64,
    pub capture_failures: u64,
    pub capture_available: bool,

    // Encoding
    pub encode_fps: f64,
    pub stereo_time_ms: f64,
    pub jpeg_time_ms: f64,
    pub total_encode_time_ms: f64,
    pub frames_encoded: u64,
    pub encode_failures: u64,
    pub compression_ratio: f64,

    // Network
    pub stream_fps: f64,
    pub connected_clients: usize,
    pub avg_latency_ms: f64,
    pub bitrate_mbps: f64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub bytes_sent: u64,

    // Overall
    pub uptime_seconds: f64,
    pub current_quality: u8,
    pub downscale_factor: f32,
    pub stereo_enabled: bool,
    pub stereo_backend: String,
    pub jpeg_backend: String,
}

// ── Tests ────────────────────────────────────────────────────────
