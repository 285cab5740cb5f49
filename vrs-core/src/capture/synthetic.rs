//! Synthetic capture backend.
//!
//! Renders a moving BGRA test pattern at a fixed rate on virtual
//! monitors, and keeps a list of virtual windows that can be moved or
//! closed through a [`SyntheticDesktop`] handle while capture runs. Used
//! on hosts without a desktop capture API and by tests.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use super::region::{Rect, WindowCandidate, is_capturable};
use super::{AcquiredFrame, CaptureBackend, MonitorInfo, WindowHandle, WindowInfo};
use crate::error::CaptureError;
use crate::frame::{CursorInfo, PixelFormat, RawFrame};

/// Row alignment of the rendered image, mimicking GPU staging pitch.
const ROW_ALIGN: usize = 64;

#[derive(Debug, Clone)]
struct SyntheticWindow {
    handle: WindowHandle,
    title: String,
    class_name: String,
    rect: Rect,
    visible: bool,
    minimized: bool,
}

#[derive(Debug, Default)]
struct Scene {
    monitors: Vec<Rect>,
    windows: Vec<SyntheticWindow>,
    next_handle: u64,
}

/// Shared handle to the virtual desktop of a [`SyntheticBackend`].
#[derive(Debug, Clone, Default)]
pub struct SyntheticDesktop {
    scene: Arc<RwLock<Scene>>,
}

impl SyntheticDesktop {
    fn read(&self) -> RwLockReadGuard<'_, Scene> {
        self.scene.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Scene> {
        self.scene.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a visible window and return its handle.
    pub fn add_window(&self, title: &str, rect: Rect) -> WindowHandle {
        let mut scene = self.write();
        scene.next_handle += 1;
        let handle = WindowHandle(0x1000 + scene.next_handle);
        scene.windows.push(SyntheticWindow {
            handle,
            title: title.to_string(),
            class_name: "SyntheticWindow".into(),
            rect,
            visible: true,
            minimized: false,
        });
        handle
    }

    pub fn move_window(&self, handle: WindowHandle, rect: Rect) {
        if let Some(w) = self.write().windows.iter_mut().find(|w| w.handle == handle) {
            w.rect = rect;
        }
    }

    pub fn minimize_window(&self, handle: WindowHandle, minimized: bool) {
        if let Some(w) = self.write().windows.iter_mut().find(|w| w.handle == handle) {
            w.minimized = minimized;
        }
    }

    pub fn close_window(&self, handle: WindowHandle) {
        self.write().windows.retain(|w| w.handle != handle);
    }
}

/// Test-pattern capture backend.
pub struct SyntheticBackend {
    desktop: SyntheticDesktop,
    bound: Option<MonitorInfo>,
    frame_interval: Duration,
    next_due: Option<Instant>,
    frame_counter: u64,
    held: bool,
    started: Instant,
}

impl SyntheticBackend {
    /// One primary monitor of `width x height`, 60 frames per second.
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_monitors(vec![Rect::from_size(0, 0, width, height)])
    }

    /// Monitors laid out at the given desktop rectangles. The first one
    /// is primary.
    pub fn with_monitors(monitors: Vec<Rect>) -> Self {
        let desktop = SyntheticDesktop::default();
        desktop.write().monitors = monitors;
        Self {
            desktop,
            bound: None,
            frame_interval: Duration::from_micros(16_667),
            next_due: None,
            frame_counter: 0,
            held: false,
            started: Instant::now(),
        }
    }

    /// Produce frames at `fps`; 0 means every `acquire` returns a frame.
    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.frame_interval = if fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / fps as f64)
        };
        self
    }

    pub fn desktop(&self) -> SyntheticDesktop {
        self.desktop.clone()
    }

    fn render(&self, rect: Rect, dst: &mut RawFrame) {
        let w = rect.width();
        let h = rect.height();
        let stride = (w as usize * 4).div_ceil(ROW_ALIGN) * ROW_ALIGN;
        dst.prepare(w, h, stride as u32, PixelFormat::Bgra8);
        let t = self.frame_counter as usize;
        let (ox, oy) = (rect.left as usize, rect.top as usize);
        dst.data
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(y, row)| {
                let gy = (y + oy) as u8;
                for (x, px) in row[..w as usize * 4].chunks_exact_mut(4).enumerate() {
                    let gx = x + ox;
                    px[0] = (gx + t) as u8;
                    px[1] = gy.wrapping_add(t as u8);
                    px[2] = ((gx / 64 + y / 64) % 2 * 255) as u8;
                    px[3] = 255;
                }
            });
    }

    fn cursor(&self, rect: Rect) -> CursorInfo {
        let t = self.started.elapsed().as_millis() as i64;
        let w = rect.width().max(1) as i64;
        let h = rect.height().max(1) as i64;
        CursorInfo {
            visible: true,
            x: (t / 4 % w) as i32,
            y: (t / 8 % h) as i32,
        }
    }
}

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn bind(&mut self, index: u32) -> Result<MonitorInfo, CaptureError> {
        let rect = *self
            .desktop
            .read()
            .monitors
            .get(index as usize)
            .ok_or(CaptureError::MonitorNotFound(index))?;
        let info = MonitorInfo {
            index,
            name: format!("SYNTHETIC{}", index + 1),
            rect,
            primary: index == 0,
        };
        self.bound = Some(info.clone());
        self.next_due = None;
        Ok(info)
    }

    fn unbind(&mut self) {
        self.release_frame();
        self.bound = None;
    }

    fn acquire(&mut self, timeout: Duration) -> Result<Option<AcquiredFrame>, CaptureError> {
        let Some(monitor) = &self.bound else {
            return Err(CaptureError::Unavailable("not bound".into()));
        };
        if self.held {
            return Err(CaptureError::Platform("previous frame not released".into()));
        }
        let rect = monitor.rect;

        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(None);
            }
            thread::sleep(wait);
        }

        self.next_due = Some(due.max(now) + self.frame_interval);
        self.frame_counter += 1;
        self.held = true;
        Ok(Some(AcquiredFrame {
            cursor: self.cursor(rect),
        }))
    }

    fn copy_to_host(&mut self, dst: &mut RawFrame) -> Result<(), CaptureError> {
        if !self.held {
            return Err(CaptureError::NoFrameHeld);
        }
        let rect = self
            .bound
            .as_ref()
            .map(|m| m.rect)
            .ok_or(CaptureError::NoFrameHeld)?;
        self.render(rect, dst);
        Ok(())
    }

    fn release_frame(&mut self) {
        self.held = false;
    }

    fn monitors(&self) -> Result<Vec<MonitorInfo>, CaptureError> {
        Ok(self
            .desktop
            .read()
            .monitors
            .iter()
            .enumerate()
            .map(|(i, rect)| MonitorInfo {
                index: i as u32,
                name: format!("SYNTHETIC{}", i + 1),
                rect: *rect,
                primary: i == 0,
            })
            .collect())
    }

    fn windows(&self) -> Result<Vec<WindowInfo>, CaptureError> {
        let scene = self.desktop.read();
        let mut out: Vec<WindowInfo> = scene
            .windows
            .iter()
            .filter(|w| {
                is_capturable(&WindowCandidate {
                    title: &w.title,
                    class_name: &w.class_name,
                    visible: w.visible,
                    minimized: w.minimized,
                    cloaked: false,
                    tool_window: false,
                    app_window: false,
                    rect: w.rect,
                })
            })
            .map(|w| WindowInfo {
                handle: w.handle,
                title: w.title.clone(),
                class_name: w.class_name.clone(),
                rect: w.rect,
                monitor: monitor_for(&scene.monitors, w.rect),
            })
            .collect();
        out.sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()));
        Ok(out)
    }

    fn window_rect(&self, handle: WindowHandle) -> Option<Rect> {
        self.desktop
            .read()
            .windows
            .iter()
            .find(|w| w.handle == handle)
            .map(|w| w.rect)
    }

    fn monitor_for_window(&self, handle: WindowHandle) -> Option<u32> {
        let scene = self.desktop.read();
        let window = scene.windows.iter().find(|w| w.handle == handle)?;
        monitor_for(&scene.monitors, window.rect)
    }
}

/// The monitor with the largest overlap with `rect`.
fn monitor_for(monitors: &[Rect], rect: Rect) -> Option<u32> {
    monitors
        .iter()
        .enumerate()
        .map(|(i, m)| (i, m.intersect(&rect).area()))
        .filter(|(_, area)| *area > 0)
        .max_by_key(|(_, area)| *area)
        .map(|(i, _)| i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureTarget, Capturer, RecoveryPolicy};

    fn capturer(backend: SyntheticBackend) -> Capturer {
        Capturer::new(Box::new(backend), RecoveryPolicy::default())
    }

    #[test]
    fn renders_padded_bgra_frames() {
        let mut cap = capturer(SyntheticBackend::new(100, 50).with_frame_rate(0));
        cap.initialize(CaptureTarget::Monitor(0)).unwrap();
        let mut dst = RawFrame::with_capacity(0);
        let mut held = cap.capture_next(Duration::from_millis(5)).unwrap().unwrap();
        held.copy_to_host(&mut dst).unwrap();
        assert_eq!((dst.width, dst.height), (100, 50));
        assert_eq!(dst.stride, 448);
        assert_eq!(dst.pixel(0, 0)[3], 255);
    }

    #[test]
    fn paces_to_frame_rate() {
        let mut backend = SyntheticBackend::new(16, 16).with_frame_rate(10);
        backend.bind(0).unwrap();
        assert!(backend.acquire(Duration::ZERO).unwrap().is_some());
        backend.release_frame();
        // Next frame is due in ~100 ms.
        assert!(backend.acquire(Duration::from_millis(1)).unwrap().is_none());
        assert!(backend.acquire(Duration::from_millis(500)).unwrap().is_some());
    }

    #[test]
    fn unknown_monitor_fails_bind() {
        let mut cap = capturer(SyntheticBackend::new(64, 64));
        assert_eq!(
            cap.initialize(CaptureTarget::Monitor(3)),
            Err(CaptureError::MonitorNotFound(3))
        );
    }

    #[test]
    fn window_capture_follows_window_and_fails_per_frame() {
        let backend = SyntheticBackend::with_monitors(vec![
            Rect::from_size(0, 0, 640, 480),
            Rect::from_size(640, 0, 640, 480),
        ])
        .with_frame_rate(0);
        let desktop = backend.desktop();
        let win = desktop.add_window("Game", Rect::from_size(700, 40, 200, 120));

        let mut cap = capturer(backend);
        cap.initialize(CaptureTarget::Window(win)).unwrap();
        assert_eq!(cap.monitor().unwrap().index, 1);

        let mut dst = RawFrame::with_capacity(0);
        let grab = |cap: &mut Capturer, dst: &mut RawFrame| {
            let mut held = cap.capture_next(Duration::ZERO).unwrap().unwrap();
            held.copy_to_host(dst)
        };

        grab(&mut cap, &mut dst).unwrap();
        assert_eq!((dst.width, dst.height), (200, 120));
        assert_eq!(dst.stride, 800);

        // Moved so only 6 px remain on the bound monitor.
        desktop.move_window(win, Rect::from_size(1274, 40, 200, 120));
        assert!(matches!(
            grab(&mut cap, &mut dst),
            Err(CaptureError::WindowTooSmall { width: 6, .. })
        ));

        desktop.move_window(win, Rect::from_size(640, 0, 320, 240));
        grab(&mut cap, &mut dst).unwrap();
        assert_eq!((dst.width, dst.height), (320, 240));

        desktop.close_window(win);
        assert_eq!(grab(&mut cap, &mut dst), Err(CaptureError::WindowInvalid));

        // Session survives window errors.
        assert!(cap.is_available());
        assert_eq!(cap.stats().frames_dropped, 2);
        assert_eq!(cap.stats().frames_captured, 2);
    }

    #[test]
    fn lists_capturable_windows_sorted() {
        let backend = SyntheticBackend::new(1920, 1080);
        let desktop = backend.desktop();
        desktop.add_window("zeta", Rect::from_size(0, 0, 300, 300));
        let hidden = desktop.add_window("Hidden", Rect::from_size(0, 0, 300, 300));
        desktop.minimize_window(hidden, true);
        desktop.add_window("tiny", Rect::from_size(0, 0, 50, 50));
        desktop.add_window("Alpha", Rect::from_size(10, 10, 400, 300));

        let titles: Vec<String> = backend.windows().unwrap().into_iter().map(|w| w.title).collect();
        assert_eq!(titles, vec!["Alpha", "zeta"]);
    }
}
