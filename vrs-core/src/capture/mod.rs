//! Capture stage.
//!
//! A [`CaptureBackend`] wraps one platform capture API: it binds to a
//! monitor, hands out GPU-resident frames, copies them to host memory on
//! request and releases them. [`Capturer`] sits on top of a backend and
//! adds what every backend needs:
//!
//! - window capture by clipping the monitor image to the window's
//!   current rectangle on every frame,
//! - monotonic sequence ids that survive rebinds,
//! - bounded recovery after the platform invalidates the session,
//! - the [`HeldFrame`] guard, which releases the hardware frame exactly
//!   once on every exit path.

pub mod dxgi;
pub mod region;
pub mod synthetic;

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::CaptureError;
use crate::frame::{CursorInfo, RawFrame};

pub use dxgi::DxgiBackend;
pub use region::{Rect, WindowCandidate, clip_to_monitor, copy_region, is_capturable};
pub use synthetic::{SyntheticBackend, SyntheticDesktop};

// ── Sources ──────────────────────────────────────────────────────

/// Opaque top-level window handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WindowHandle(pub u64);

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// What to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTarget {
    /// A whole monitor by index (0 = first enumerated output).
    Monitor(u32),
    /// One window, clipped to the monitor it sits on.
    Window(WindowHandle),
}

impl fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Monitor(i) => write!(f, "monitor {i}"),
            Self::Window(h) => write!(f, "window {h}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorInfo {
    pub index: u32,
    pub name: String,
    /// Position and size on the virtual desktop.
    pub rect: Rect,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowInfo {
    pub handle: WindowHandle,
    pub title: String,
    pub class_name: String,
    pub rect: Rect,
    /// Monitor the window is mostly on.
    pub monitor: Option<u32>,
}

/// Metadata of a frame the backend currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquiredFrame {
    /// Cursor in monitor coordinates.
    pub cursor: CursorInfo,
}

// ── CaptureBackend ───────────────────────────────────────────────

/// A platform capture API.
///
/// Calls come from a single thread. `copy_to_host` and `release_frame`
/// are only valid after `acquire` returned a frame.
pub trait CaptureBackend: Send {
    fn name(&self) -> &'static str;

    /// Bind to monitor `index`, replacing any previous binding.
    fn bind(&mut self, index: u32) -> Result<MonitorInfo, CaptureError>;

    /// Drop the current binding and its platform resources.
    fn unbind(&mut self);

    /// Wait up to `timeout` for a new frame. `Ok(None)` means nothing new.
    fn acquire(&mut self, timeout: Duration) -> Result<Option<AcquiredFrame>, CaptureError>;

    /// Copy the held frame into `dst` (whole monitor, native pitch).
    fn copy_to_host(&mut self, dst: &mut RawFrame) -> Result<(), CaptureError>;

    /// Return the held frame to the platform. No-op when nothing is held.
    fn release_frame(&mut self);

    fn monitors(&self) -> Result<Vec<MonitorInfo>, CaptureError>;

    /// Capturable top-level windows, sorted by title.
    fn windows(&self) -> Result<Vec<WindowInfo>, CaptureError>;

    /// Current desktop rectangle of `handle`, or `None` if it is gone.
    fn window_rect(&self, handle: WindowHandle) -> Option<Rect>;

    fn monitor_for_window(&self, handle: WindowHandle) -> Option<u32>;
}

/// The best backend for this host: DXGI on Windows, otherwise a
/// synthetic test pattern.
pub fn default_backend() -> Box<dyn CaptureBackend> {
    if cfg!(target_os = "windows") {
        Box::new(DxgiBackend::new())
    } else {
        warn!("no desktop capture API on this platform; using synthetic source");
        Box::new(SyntheticBackend::new(1920, 1080))
    }
}

// ── Capturer ─────────────────────────────────────────────────────

/// How hard to try after the platform invalidates a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    /// Sleep before each rebind.
    pub backoff: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub timeouts: u64,
    /// Frames lost to window errors.
    pub frames_dropped: u64,
    pub recoveries: u64,
    pub avg_capture_time_ms: f64,
    pub avg_copy_time_ms: f64,
}

/// The capture stage.
pub struct Capturer {
    backend: Box<dyn CaptureBackend>,
    target: Option<CaptureTarget>,
    monitor: Option<MonitorInfo>,
    policy: RecoveryPolicy,
    available: bool,
    capture_cursor: bool,
    next_sequence: u64,
    /// Whole-monitor image used as the clip source in window mode.
    scratch: RawFrame,
    stats: CaptureStats,
}

impl Capturer {
    pub fn new(backend: Box<dyn CaptureBackend>, policy: RecoveryPolicy) -> Self {
        Self {
            backend,
            target: None,
            monitor: None,
            policy,
            available: false,
            capture_cursor: true,
            next_sequence: 1,
            scratch: RawFrame::with_capacity(0),
            stats: CaptureStats::default(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn set_capture_cursor(&mut self, enabled: bool) {
        self.capture_cursor = enabled;
    }

    /// Bind to `target`. On failure the previous binding is gone and the
    /// stage reports unavailable.
    pub fn initialize(&mut self, target: CaptureTarget) -> Result<(), CaptureError> {
        self.backend.unbind();
        self.available = false;
        self.monitor = None;
        self.target = Some(target);

        let index = match target {
            CaptureTarget::Monitor(i) => i,
            CaptureTarget::Window(h) => self
                .backend
                .monitor_for_window(h)
                .ok_or(CaptureError::WindowInvalid)?,
        };
        let monitor = self.backend.bind(index)?;
        info!(
            backend = self.backend.name(),
            %target,
            monitor = %monitor.name,
            width = monitor.rect.width(),
            height = monitor.rect.height(),
            "capture initialized"
        );
        self.monitor = Some(monitor);
        self.available = true;
        Ok(())
    }

    /// Switch sources at runtime. Same as [`initialize`](Self::initialize).
    pub fn set_target(&mut self, target: CaptureTarget) -> Result<(), CaptureError> {
        self.initialize(target)
    }

    pub fn target(&self) -> Option<CaptureTarget> {
        self.target
    }

    pub fn monitor(&self) -> Option<&MonitorInfo> {
        self.monitor.as_ref()
    }

    /// `false` before initialization and after recovery gave up.
    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn monitors(&self) -> Result<Vec<MonitorInfo>, CaptureError> {
        self.backend.monitors()
    }

    pub fn windows(&self) -> Result<Vec<WindowInfo>, CaptureError> {
        self.backend.windows()
    }

    /// Wait up to `timeout` for the next frame.
    ///
    /// `Ok(None)` means no new frame (including right after a successful
    /// recovery); the caller should retry.
    pub fn capture_next(&mut self, timeout: Duration) -> Result<Option<HeldFrame<'_>>, CaptureError> {
        if !self.available {
            return Err(CaptureError::Unavailable(
                "no capture source bound".into(),
            ));
        }
        let start = Instant::now();
        match self.backend.acquire(timeout) {
            Ok(Some(info)) => Ok(Some(HeldFrame {
                capturer: self,
                info,
                acquired_at: start,
            })),
            Ok(None) => {
                self.stats.timeouts += 1;
                Ok(None)
            }
            Err(CaptureError::AccessLost) => {
                self.recover()?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn recover(&mut self) -> Result<(), CaptureError> {
        warn!("capture access lost; rebinding");
        self.backend.unbind();
        let index = self.monitor.as_ref().map_or(0, |m| m.index);

        for attempt in 1..=self.policy.max_attempts {
            thread::sleep(self.policy.backoff);
            match self.backend.bind(index) {
                Ok(monitor) => {
                    info!(attempt, monitor = index, "capture recovered");
                    self.monitor = Some(monitor);
                    self.stats.recoveries += 1;
                    return Ok(());
                }
                Err(e) => warn!(attempt, error = %e, "capture rebind failed"),
            }
        }

        self.available = false;
        Err(CaptureError::RecoveryExhausted {
            attempts: self.policy.max_attempts,
        })
    }

    fn record_timing(avg_ms: &mut f64, frames: u64, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        *avg_ms += (ms - *avg_ms) / frames.max(1) as f64;
    }
}

// ── HeldFrame ────────────────────────────────────────────────────

/// A frame the backend is holding for us. Dropping it releases the frame.
pub struct HeldFrame<'a> {
    capturer: &'a mut Capturer,
    info: AcquiredFrame,
    acquired_at: Instant,
}

impl HeldFrame<'_> {
    /// Cursor metadata in monitor coordinates.
    pub fn cursor(&self) -> CursorInfo {
        self.info.cursor
    }

    /// Copy the frame (or the window's part of it) into `dst` and stamp
    /// it with the next sequence id, which is returned.
    ///
    /// Window errors only fail this frame.
    pub fn copy_to_host(&mut self, dst: &mut RawFrame) -> Result<u64, CaptureError> {
        let copy_start = Instant::now();
        let c = &mut *self.capturer;
        let mut cursor = if c.capture_cursor {
            self.info.cursor
        } else {
            CursorInfo::default()
        };

        let result = match c.target {
            Some(CaptureTarget::Window(handle)) => {
                let monitor = c.monitor.as_ref().map(|m| m.rect).unwrap_or_default();
                c.backend.copy_to_host(&mut c.scratch).and_then(|()| {
                    let window = c
                        .backend
                        .window_rect(handle)
                        .ok_or(CaptureError::WindowInvalid)?;
                    let region = clip_to_monitor(window, monitor)?;
                    copy_region(&c.scratch, region, dst);
                    cursor.x -= region.left;
                    cursor.y -= region.top;
                    cursor.visible &= region.contains(self.info.cursor.x, self.info.cursor.y);
                    Ok(())
                })
            }
            _ => c.backend.copy_to_host(dst),
        };

        if let Err(e) = result {
            if e.is_per_frame() {
                c.stats.frames_dropped += 1;
            }
            return Err(e);
        }

        let sequence = c.next_sequence;
        c.next_sequence += 1;
        dst.sequence = sequence;
        dst.timestamp = self.acquired_at;
        dst.cursor = cursor;

        c.stats.frames_captured += 1;
        let frames = c.stats.frames_captured;
        Capturer::record_timing(&mut c.stats.avg_copy_time_ms, frames, copy_start.elapsed());
        Capturer::record_timing(
            &mut c.stats.avg_capture_time_ms,
            frames,
            self.acquired_at.elapsed(),
        );
        Ok(sequence)
    }
}

impl Drop for HeldFrame<'_> {
    fn drop(&mut self) {
        self.capturer.backend.release_frame();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Scripted backend: acquire call numbers in `lost_on` report access
    /// lost; `failing_binds` rebinds fail before one succeeds.
    struct ScriptedBackend {
        calls: u64,
        lost_on: Vec<u64>,
        failing_binds: u32,
        bound: bool,
        held: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ScriptedBackend {
        fn new(lost_on: Vec<u64>, failing_binds: u32) -> (Self, Arc<Mutex<Vec<&'static str>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    calls: 0,
                    lost_on,
                    failing_binds,
                    bound: false,
                    held: false,
                    log: Arc::clone(&log),
                },
                log,
            )
        }
    }

    impl CaptureBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn bind(&mut self, index: u32) -> Result<MonitorInfo, CaptureError> {
            self.log.lock().unwrap().push("bind");
            if self.calls > 0 && self.failing_binds > 0 {
                self.failing_binds -= 1;
                return Err(CaptureError::AccessDenied("busy".into()));
            }
            self.bound = true;
            Ok(MonitorInfo {
                index,
                name: "scripted".into(),
                rect: Rect::from_size(0, 0, 64, 32),
                primary: true,
            })
        }

        fn unbind(&mut self) {
            self.bound = false;
        }

        fn acquire(&mut self, _timeout: Duration) -> Result<Option<AcquiredFrame>, CaptureError> {
            assert!(!self.held, "acquire while holding a frame");
            self.calls += 1;
            if self.lost_on.contains(&self.calls) {
                return Err(CaptureError::AccessLost);
            }
            assert!(self.bound);
            self.held = true;
            Ok(Some(AcquiredFrame::default()))
        }

        fn copy_to_host(&mut self, dst: &mut RawFrame) -> Result<(), CaptureError> {
            if !self.held {
                return Err(CaptureError::NoFrameHeld);
            }
            dst.prepare(64, 32, 256, crate::frame::PixelFormat::Bgra8);
            Ok(())
        }

        fn release_frame(&mut self) {
            if self.held {
                self.log.lock().unwrap().push("release");
            }
            self.held = false;
        }

        fn monitors(&self) -> Result<Vec<MonitorInfo>, CaptureError> {
            Ok(Vec::new())
        }

        fn windows(&self) -> Result<Vec<WindowInfo>, CaptureError> {
            Ok(Vec::new())
        }

        fn window_rect(&self, _handle: WindowHandle) -> Option<Rect> {
            None
        }

        fn monitor_for_window(&self, _handle: WindowHandle) -> Option<u32> {
            None
        }
    }

    fn fast_policy() -> RecoveryPolicy {
        RecoveryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn uninitialized_capturer_is_unavailable() {
        let (backend, _) = ScriptedBackend::new(vec![], 0);
        let mut cap = Capturer::new(Box::new(backend), fast_policy());
        assert!(!cap.is_available());
        assert!(matches!(
            cap.capture_next(Duration::ZERO),
            Err(CaptureError::Unavailable(_))
        ));
    }

    #[test]
    fn held_frame_releases_exactly_once() {
        let (backend, log) = ScriptedBackend::new(vec![], 0);
        let mut cap = Capturer::new(Box::new(backend), fast_policy());
        cap.initialize(CaptureTarget::Monitor(0)).unwrap();

        let mut dst = RawFrame::with_capacity(0);
        {
            let mut held = cap.capture_next(Duration::ZERO).unwrap().unwrap();
            assert_eq!(held.copy_to_host(&mut dst).unwrap(), 1);
        }
        {
            // Dropped without copying.
            let _held = cap.capture_next(Duration::ZERO).unwrap().unwrap();
        }
        let releases = log.lock().unwrap().iter().filter(|e| **e == "release").count();
        assert_eq!(releases, 2);
    }

    #[test]
    fn access_lost_recovers_with_monotonic_ids() {
        let (backend, log) = ScriptedBackend::new(vec![5], 1);
        let mut cap = Capturer::new(Box::new(backend), fast_policy());
        cap.initialize(CaptureTarget::Monitor(0)).unwrap();

        let mut dst = RawFrame::with_capacity(0);
        let mut ids = Vec::new();
        for _ in 0..100 {
            match cap.capture_next(Duration::ZERO).unwrap() {
                Some(mut held) => ids.push(held.copy_to_host(&mut dst).unwrap()),
                None => continue,
            }
        }

        assert_eq!(ids.len(), 99);
        assert!(ids.windows(2).all(|w| w[1] > w[0]));
        assert!(cap.is_available());
        assert_eq!(cap.stats().recoveries, 1);
        // Initial bind, one failed rebind, one successful rebind.
        let binds = log.lock().unwrap().iter().filter(|e| **e == "bind").count();
        assert_eq!(binds, 3);
    }

    #[test]
    fn exhausted_recovery_marks_unavailable_until_reinitialized() {
        let (backend, _) = ScriptedBackend::new(vec![2], 10);
        let mut cap = Capturer::new(Box::new(backend), fast_policy());
        cap.initialize(CaptureTarget::Monitor(0)).unwrap();

        assert!(cap.capture_next(Duration::ZERO).unwrap().is_some());
        assert_eq!(
            cap.capture_next(Duration::ZERO).err(),
            Some(CaptureError::RecoveryExhausted { attempts: 3 })
        );
        assert!(!cap.is_available());
        assert!(matches!(
            cap.capture_next(Duration::ZERO),
            Err(CaptureError::Unavailable(_))
        ));
    }

    #[test]
    fn window_target_requires_live_window() {
        let (backend, _) = ScriptedBackend::new(vec![], 0);
        let mut cap = Capturer::new(Box::new(backend), fast_policy());
        assert_eq!(
            cap.initialize(CaptureTarget::Window(WindowHandle(7))),
            Err(CaptureError::WindowInvalid)
        );
        assert!(!cap.is_available());
    }
}
