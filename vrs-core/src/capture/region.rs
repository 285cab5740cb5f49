//! Rectangle math for window capture and the capturable-window filter.

use serde::Serialize;

use crate::error::CaptureError;
use crate::frame::RawFrame;

/// Smallest clipped window region worth encoding, per side.
pub const MIN_REGION_SIZE: u32 = 10;

/// Smallest window offered for selection, per side.
pub const MIN_WINDOW_SIZE: u32 = 100;

/// Shell surfaces that look like windows but are never capture targets.
pub const SHELL_CLASSES: [&str; 4] = [
    "Progman",
    "WorkerW",
    "Shell_TrayWnd",
    "Windows.UI.Core.CoreWindow",
];

// ── Rect ─────────────────────────────────────────────────────────

/// Edge-exclusive rectangle in desktop or monitor coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub const fn from_size(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self::new(left, top, left + width as i32, top + height as i32)
    }

    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        let r = Rect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        );
        if r.right <= r.left || r.bottom <= r.top {
            Rect::default()
        } else {
            r
        }
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.left + dx, self.top + dy, self.right + dx, self.bottom + dy)
    }

    pub fn center(&self) -> (i32, i32) {
        (
            self.left + (self.right - self.left) / 2,
            self.top + (self.bottom - self.top) / 2,
        )
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }
}

// ── Clipping ─────────────────────────────────────────────────────

/// Clip a window's desktop rectangle to the captured monitor and return
/// it in monitor-relative coordinates.
pub fn clip_to_monitor(window: Rect, monitor: Rect) -> Result<Rect, CaptureError> {
    let visible = window
        .intersect(&monitor)
        .translate(-monitor.left, -monitor.top);
    if visible.width() < MIN_REGION_SIZE || visible.height() < MIN_REGION_SIZE {
        return Err(CaptureError::WindowTooSmall {
            width: visible.width(),
            height: visible.height(),
        });
    }
    Ok(visible)
}

/// Row-copy `region` of `src` into `dst`, packed.
///
/// `region` must lie inside `src`.
pub fn copy_region(src: &RawFrame, region: Rect, dst: &mut RawFrame) {
    let bpp = src.format.bytes_per_pixel();
    let w = region.width();
    let h = region.height();
    let row_len = w as usize * bpp;
    dst.prepare(w, h, row_len as u32, src.format);
    let x_off = region.left as usize * bpp;
    for (y, out) in dst.data.chunks_exact_mut(row_len).enumerate() {
        let start = (region.top as usize + y) * src.stride as usize + x_off;
        out.copy_from_slice(&src.data[start..start + row_len]);
    }
}

// ── Window filter ────────────────────────────────────────────────

/// The attributes the capturable-window filter looks at.
#[derive(Debug, Clone)]
pub struct WindowCandidate<'a> {
    pub title: &'a str,
    pub class_name: &'a str,
    pub visible: bool,
    pub minimized: bool,
    pub cloaked: bool,
    pub tool_window: bool,
    pub app_window: bool,
    pub rect: Rect,
}

/// Whether a top-level window should be offered as a capture source.
pub fn is_capturable(c: &WindowCandidate<'_>) -> bool {
    if !c.visible || c.minimized || c.cloaked {
        return false;
    }
    if c.title.trim().is_empty() {
        return false;
    }
    if c.tool_window && !c.app_window {
        return false;
    }
    if c.rect.width() < MIN_WINDOW_SIZE || c.rect.height() < MIN_WINDOW_SIZE {
        return false;
    }
    !SHELL_CLASSES.contains(&c.class_name)
}
