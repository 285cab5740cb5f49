//! Frame types that move between pipeline stages.
//!
//! [`RawFrame`] and [`CompressedFrame`] are deliberately not `Clone`:
//! a frame has exactly one owning stage until the broadcast step wraps
//! the compressed result in an `Arc` for fan-out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha (DXGI default).
    Bgra8,
    /// 3 bytes per pixel: Blue, Green, Red.
    Bgr8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Bgr8 => 3,
        }
    }

    /// Byte offsets of the blue, green and red channels.
    pub const fn bgr_offsets(self) -> [usize; 3] {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Bgr8 => [0, 1, 2],
            PixelFormat::Rgba8 => [2, 1, 0],
        }
    }
}

// ── CursorInfo ───────────────────────────────────────────────────

/// Cursor metadata reported alongside a captured frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorInfo {
    pub visible: bool,
    /// Position relative to the captured region.
    pub x: i32,
    pub y: i32,
}

// ── RawFrame ─────────────────────────────────────────────────────

/// An uncompressed captured frame in host memory.
///
/// `data` holds `height` rows of `stride` bytes. `stride` may exceed
/// `width * bytes_per_pixel` because GPU staging textures pad rows.
#[derive(Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Row pitch in **bytes**.
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    pub timestamp: Instant,
    /// Monotonic capture sequence id.
    pub sequence: u64,
    pub cursor: CursorInfo,
}

impl RawFrame {
    /// An empty frame whose buffer can hold `capacity` bytes without
    /// reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            width: 0,
            height: 0,
            stride: 0,
            format: PixelFormat::Bgra8,
            data: Vec::with_capacity(capacity),
            timestamp: Instant::now(),
            sequence: 0,
            cursor: CursorInfo::default(),
        }
    }

    /// Set the geometry and size the buffer to `stride * height`.
    ///
    /// Existing capacity is reused; the contents are unspecified.
    pub fn prepare(&mut self, width: u32, height: u32, stride: u32, format: PixelFormat) {
        self.width = width;
        self.height = height;
        self.stride = stride;
        self.format = format;
        self.data.resize(stride as usize * height as usize, 0);
    }

    /// Drop the logical contents while keeping the allocation.
    pub fn reset(&mut self) {
        self.width = 0;
        self.height = 0;
        self.stride = 0;
        self.sequence = 0;
        self.cursor = CursorInfo::default();
        self.data.clear();
    }

    /// Total byte size the bitmap occupies.
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// Bytes of pixel data in one row, excluding padding.
    pub fn packed_row_len(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Row `y` without its trailing padding.
    ///
    /// # Panics
    ///
    /// Panics if `y >= height`.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.data[start..start + self.packed_row_len()]
    }

    /// The bytes of the pixel at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.format.bytes_per_pixel();
        let offset = y as usize * self.stride as usize + x as usize * bpp;
        &self.data[offset..offset + bpp]
    }

    /// Borrow the frame as an [`ImageView`].
    pub fn view(&self) -> ImageView<'_> {
        ImageView {
            data: &self.data,
            width: self.width,
            height: self.height,
            stride: self.stride as usize,
            format: self.format,
        }
    }
}

// ── ImageView ────────────────────────────────────────────────────

/// A borrowed image, used as the input of the stereo and JPEG stages.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes.
    pub stride: usize,
    pub format: PixelFormat,
}

impl<'a> ImageView<'a> {
    /// A view over a tightly packed buffer.
    pub fn packed(data: &'a [u8], width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            stride: width as usize * format.bytes_per_pixel(),
            format,
        }
    }

    /// Whether rows carry no padding.
    pub fn is_packed(&self) -> bool {
        self.stride == self.width as usize * self.format.bytes_per_pixel()
    }

    /// Minimum buffer length the view's geometry requires.
    pub fn required_len(&self) -> usize {
        if self.height == 0 {
            return 0;
        }
        (self.height as usize - 1) * self.stride
            + self.width as usize * self.format.bytes_per_pixel()
    }
}

// ── CompressedFrame ──────────────────────────────────────────────

/// One encoded image, ready for broadcast.
#[derive(Debug)]
pub struct CompressedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture timestamp of the source frame.
    pub timestamp: Instant,
    /// Sequence id of the source frame.
    pub sequence: u64,
    pub encode_duration: Duration,
}

impl CompressedFrame {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            width: 0,
            height: 0,
            timestamp: Instant::now(),
            sequence: 0,
            encode_duration: Duration::ZERO,
        }
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.width = 0;
        self.height = 0;
        self.sequence = 0;
        self.encode_duration = Duration::ZERO;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ── SharedFrame ──────────────────────────────────────────────────

/// Owner wrapper so a `Bytes` can borrow straight out of an
/// `Arc<CompressedFrame>` without copying the payload.
struct SharedPayload(Arc<CompressedFrame>);

impl AsRef<[u8]> for SharedPayload {
    fn as_ref(&self) -> &[u8] {
        &self.0.data
    }
}

/// Zero-copy payload view of a shared compressed frame.
///
/// Every session that receives the frame holds one `Bytes` clone; the
/// frame itself is released when the last clone is dropped.
pub fn shared_payload(frame: &Arc<CompressedFrame>) -> Bytes {
    Bytes::from_owner(SharedPayload(Arc::clone(frame)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frame(w: u32, h: u32, pad: u32) -> RawFrame {
        let mut f = RawFrame::with_capacity(0);
        f.prepare(w, h, w * 4 + pad, PixelFormat::Bgra8);
        for y in 0..h {
            for x in 0..w {
                let off = (y * f.stride + x * 4) as usize;
                f.data[off] = x as u8;
                f.data[off + 1] = y as u8;
            }
        }
        f
    }

    #[test]
    fn row_excludes_padding() {
        let f = test_frame(3, 2, 8);
        assert_eq!(f.stride, 20);
        assert_eq!(f.row(1).len(), 12);
        assert_eq!(f.pixel(2, 1)[..2], [2, 1]);
        assert_eq!(f.byte_len(), 40);
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut f = test_frame(16, 16, 0);
        let cap = f.data.capacity();
        f.reset();
        assert!(f.data.is_empty());
        assert_eq!(f.data.capacity(), cap);
    }

    #[test]
    fn view_required_len_ignores_last_row_padding() {
        let f = test_frame(4, 3, 16);
        let v = f.view();
        assert!(!v.is_packed());
        assert_eq!(v.required_len(), 2 * 32 + 16);
    }

    #[test]
    fn shared_payload_keeps_frame_alive() {
        let mut cf = CompressedFrame::with_capacity(4);
        cf.data.extend_from_slice(&[1, 2, 3]);
        let shared = Arc::new(cf);
        let bytes = shared_payload(&shared);
        assert_eq!(Arc::strong_count(&shared), 2);
        assert_eq!(&bytes[..], &[1, 2, 3]);
        drop(bytes);
        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
