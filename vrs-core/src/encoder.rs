//! JPEG compression stage.
//!
//! Three interchangeable backends implement [`JpegBackend`]:
//!
//! | Backend | Crate | Notes |
//! |---------|-------|-------|
//! | [`GpuJpegBackend`] | none | hardware encoder probe |
//! | [`SimdJpegBackend`] | `jpeg-encoder` | AVX2 when the CPU has it |
//! | [`GenericJpegBackend`] | `image` | portable fallback |
//!
//! [`AutoJpegEncoder`] probes them once, in that order, and caches the
//! result. [`VrFrameEncoder`] chains the stereo transform with the
//! selected backend and produces [`CompressedFrame`]s.
//!
//! Chroma is always subsampled 4:2:0.

use std::time::{Duration, Instant};

use jpeg_encoder::{ColorType, Encoder, SamplingFactor};

use crate::config::{EncodeSettings, EncoderBackend, Sampling};
use crate::error::EncodeError;
use crate::frame::{CompressedFrame, ImageView, PixelFormat, RawFrame};
use crate::stereo::{
    AutoStereoProcessor, StereoParams, StereoProcessor, output_dimensions, to_packed_bgr,
};

// ── JpegBackend ──────────────────────────────────────────────────

/// One JPEG implementation.
pub trait JpegBackend: Send {
    fn kind(&self) -> EncoderBackend;

    fn name(&self) -> &'static str;

    /// Whether the backend initialized on this host.
    fn available(&self) -> bool;

    /// Encode `image` into `output` (cleared first) and return the byte
    /// count.
    fn encode(
        &mut self,
        image: &ImageView<'_>,
        quality: u8,
        output: &mut Vec<u8>,
    ) -> Result<usize, EncodeError>;
}

/// Copy a padded view into `scratch` so rows are contiguous.
fn packed<'a>(image: &ImageView<'a>, scratch: &'a mut Vec<u8>) -> &'a [u8] {
    let row_len = image.width as usize * image.format.bytes_per_pixel();
    if image.is_packed() {
        return &image.data[..row_len * image.height as usize];
    }
    scratch.clear();
    for y in 0..image.height as usize {
        let start = y * image.stride;
        scratch.extend_from_slice(&image.data[start..start + row_len]);
    }
    scratch
}

fn check_image(image: &ImageView<'_>, max_side: u32) -> Result<(), EncodeError> {
    if image.width == 0 || image.height == 0 || image.width > max_side || image.height > max_side
    {
        return Err(EncodeError::InvalidDimensions {
            width: image.width,
            height: image.height,
        });
    }
    let needed = image.required_len();
    if image.data.len() < needed {
        return Err(EncodeError::BufferTooShort {
            needed,
            actual: image.data.len(),
        });
    }
    Ok(())
}

// ── GPU ──────────────────────────────────────────────────────────

/// Hardware JPEG encoder.
///
/// No hardware encoder binding is compiled in; the probe reports
/// unavailable so selection moves on to the CPU backends.
#[derive(Debug)]
pub struct GpuJpegBackend {
    available: bool,
}

impl GpuJpegBackend {
    pub fn probe() -> Self {
        Self { available: false }
    }
}

impl JpegBackend for GpuJpegBackend {
    fn kind(&self) -> EncoderBackend {
        EncoderBackend::Gpu
    }

    fn name(&self) -> &'static str {
        "gpu"
    }

    fn available(&self) -> bool {
        self.available
    }

    fn encode(
        &mut self,
        _image: &ImageView<'_>,
        _quality: u8,
        _output: &mut Vec<u8>,
    ) -> Result<usize, EncodeError> {
        Err(EncodeError::Backend {
            backend: "gpu",
            message: "hardware encoder unavailable".into(),
        })
    }
}

// ── SIMD ─────────────────────────────────────────────────────────

/// `jpeg-encoder` backend. Takes BGR, BGRA and RGBA input directly.
#[derive(Debug)]
pub struct SimdJpegBackend {
    available: bool,
    scratch: Vec<u8>,
}

impl SimdJpegBackend {
    /// Initialize and verify with a tiny test encode.
    pub fn probe() -> Self {
        let mut backend = Self {
            available: true,
            scratch: Vec::new(),
        };
        let pixels = [0u8; 16 * 16 * 3];
        let view = ImageView::packed(&pixels, 16, 16, PixelFormat::Bgr8);
        let mut out = Vec::new();
        if let Err(e) = backend.encode(&view, 50, &mut out) {
            tracing::warn!("simd jpeg probe failed: {e}");
            backend.available = false;
        }
        backend
    }
}

impl JpegBackend for SimdJpegBackend {
    fn kind(&self) -> EncoderBackend {
        EncoderBackend::Simd
    }

    fn name(&self) -> &'static str {
        "simd"
    }

    fn available(&self) -> bool {
        self.available
    }

    fn encode(
        &mut self,
        image: &ImageView<'_>,
        quality: u8,
        output: &mut Vec<u8>,
    ) -> Result<usize, EncodeError> {
        check_image(image, u16::MAX as u32)?;
        let color = match image.format {
            PixelFormat::Bgr8 => ColorType::Bgr,
            PixelFormat::Bgra8 => ColorType::Bgra,
            PixelFormat::Rgba8 => ColorType::Rgba,
        };
        let data = packed(image, &mut self.scratch);

        output.clear();
        let mut encoder = Encoder::new(&mut *output, quality.clamp(1, 100));
        encoder.set_sampling_factor(SamplingFactor::R_4_2_0);
        encoder
            .encode(data, image.width as u16, image.height as u16, color)
            .map_err(|e| EncodeError::Backend {
                backend: "simd",
                message: e.to_string(),
            })?;
        Ok(output.len())
    }
}

// ── Generic ──────────────────────────────────────────────────────

/// `image` crate backend. Always available.
#[derive(Debug, Default)]
pub struct GenericJpegBackend {
    rgb: Vec<u8>,
}

impl GenericJpegBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JpegBackend for GenericJpegBackend {
    fn kind(&self) -> EncoderBackend {
        EncoderBackend::Generic
    }

    fn name(&self) -> &'static str {
        "generic"
    }

    fn available(&self) -> bool {
        true
    }

    fn encode(
        &mut self,
        image: &ImageView<'_>,
        quality: u8,
        output: &mut Vec<u8>,
    ) -> Result<usize, EncodeError> {
        check_image(image, u16::MAX as u32)?;

        // The image encoder only takes RGB.
        let bpp = image.format.bytes_per_pixel();
        let [ob, og, or] = image.format.bgr_offsets();
        self.rgb.clear();
        self.rgb
            .reserve(image.width as usize * image.height as usize * 3);
        for y in 0..image.height as usize {
            let start = y * image.stride;
            let row = &image.data[start..start + image.width as usize * bpp];
            for px in row.chunks_exact(bpp) {
                self.rgb.extend_from_slice(&[px[or], px[og], px[ob]]);
            }
        }

        output.clear();
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut *output, quality.clamp(1, 100));
        encoder
            .encode(
                &self.rgb,
                image.width,
                image.height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| EncodeError::Backend {
                backend: "generic",
                message: e.to_string(),
            })?;
        Ok(output.len())
    }
}

// ── AutoJpegEncoder ──────────────────────────────────────────────

/// Holds every backend that initialized, best first.
pub struct AutoJpegEncoder {
    backends: Vec<Box<dyn JpegBackend>>,
    last_encode: Duration,
}

impl AutoJpegEncoder {
    /// Probe GPU (when allowed), then SIMD, then the generic fallback.
    pub fn new(allow_gpu: bool) -> Result<Self, EncodeError> {
        let mut candidates: Vec<Box<dyn JpegBackend>> = Vec::with_capacity(3);
        if allow_gpu {
            candidates.push(Box::new(GpuJpegBackend::probe()));
        }
        candidates.push(Box::new(SimdJpegBackend::probe()));
        candidates.push(Box::new(GenericJpegBackend::new()));
        Self::with_backends(candidates)
    }

    /// Keep the available entries of `candidates`, in order.
    pub fn with_backends(candidates: Vec<Box<dyn JpegBackend>>) -> Result<Self, EncodeError> {
        let backends: Vec<_> = candidates.into_iter().filter(|b| b.available()).collect();
        match backends.first() {
            Some(best) => tracing::info!(backend = best.name(), "jpeg encoder selected"),
            None => return Err(EncodeError::NoBackend),
        }
        Ok(Self {
            backends,
            last_encode: Duration::ZERO,
        })
    }

    /// Name of the default (best) backend.
    pub fn name(&self) -> &'static str {
        self.backends.first().map_or("none", |b| b.name())
    }

    /// Names of every usable backend, best first.
    pub fn available(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Backend that would serve `preference`: the preferred one if it
    /// initialized, else the best.
    pub fn resolve(&self, preference: EncoderBackend) -> &'static str {
        self.index_for(preference)
            .and_then(|i| self.backends.get(i))
            .map_or("none", |b| b.name())
    }

    fn index_for(&self, preference: EncoderBackend) -> Option<usize> {
        if self.backends.is_empty() {
            return None;
        }
        Some(
            self.backends
                .iter()
                .position(|b| b.kind() == preference)
                .unwrap_or(0),
        )
    }

    pub fn encode(
        &mut self,
        image: &ImageView<'_>,
        quality: u8,
        preference: EncoderBackend,
        output: &mut Vec<u8>,
    ) -> Result<usize, EncodeError> {
        let idx = self.index_for(preference).ok_or(EncodeError::NoBackend)?;
        let start = Instant::now();
        let n = self.backends[idx].encode(image, quality, output)?;
        self.last_encode = start.elapsed();
        if n == 0 {
            return Err(EncodeError::Empty);
        }
        Ok(n)
    }

    pub fn last_encode_time(&self) -> Duration {
        self.last_encode
    }
}

// ── VrFrameEncoder ───────────────────────────────────────────────

/// Timing and size of the most recent encode.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_encoded: u64,
    pub stereo_time: Duration,
    pub encode_time: Duration,
    pub total_time: Duration,
    /// Uncompressed input bytes over compressed bytes, last frame.
    pub compression_ratio: f64,
}

/// Stereo transform plus JPEG compression.
pub struct VrFrameEncoder {
    stereo: AutoStereoProcessor,
    jpeg: AutoJpegEncoder,
    sampling: Sampling,
    stereo_buffer: Vec<u8>,
    stats: EncoderStats,
}

impl VrFrameEncoder {
    /// Probe stereo and JPEG backends. Fails only when no JPEG backend
    /// initializes.
    pub fn new(allow_gpu: bool, sampling: Sampling) -> Result<Self, EncodeError> {
        Ok(Self::with_parts(
            AutoStereoProcessor::new(allow_gpu),
            AutoJpegEncoder::new(allow_gpu)?,
            sampling,
        ))
    }

    pub fn with_parts(stereo: AutoStereoProcessor, jpeg: AutoJpegEncoder, sampling: Sampling) -> Self {
        Self {
            stereo,
            jpeg,
            sampling,
            stereo_buffer: Vec::with_capacity(1920 * 1080 * 3),
            stats: EncoderStats::default(),
        }
    }

    pub fn stereo_name(&self) -> &'static str {
        self.stereo.name()
    }

    pub fn jpeg_name(&self, preference: EncoderBackend) -> &'static str {
        self.jpeg.resolve(preference)
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    /// Encode `frame` into `out`.
    ///
    /// On error `out` holds no valid image and the caller should skip the
    /// frame. `out` keeps its allocation either way.
    pub fn encode(
        &mut self,
        frame: &RawFrame,
        settings: &EncodeSettings,
        out: &mut CompressedFrame,
    ) -> Result<(), EncodeError> {
        let total = Instant::now();
        let input = frame.view();

        let stereo_start = Instant::now();
        let image = if settings.stereo {
            let (w, h) = output_dimensions(
                frame.width,
                frame.height,
                settings.downscale,
                (settings.output_width, settings.output_height),
            )?;
            let params = StereoParams {
                output_width: w,
                output_height: h,
                eye_separation: settings.eye_separation,
                sampling: self.sampling,
            };
            self.stereo.process(&input, &params, &mut self.stereo_buffer)?;
            ImageView::packed(&self.stereo_buffer, w, h, PixelFormat::Bgr8)
        } else if frame.format == PixelFormat::Bgra8 || frame.format == PixelFormat::Bgr8 {
            input
        } else {
            to_packed_bgr(&input, &mut self.stereo_buffer)?;
            ImageView::packed(&self.stereo_buffer, frame.width, frame.height, PixelFormat::Bgr8)
        };
        let stereo_time = stereo_start.elapsed();

        let encode_start = Instant::now();
        let n = self
            .jpeg
            .encode(&image, settings.quality, settings.backend, &mut out.data)?;
        let encode_time = encode_start.elapsed();

        out.width = image.width;
        out.height = image.height;
        out.timestamp = frame.timestamp;
        out.sequence = frame.sequence;
        out.encode_duration = total.elapsed();

        let raw = image.width as u64 * image.height as u64 * image.format.bytes_per_pixel() as u64;
        let s = &mut self.stats;
        s.frames_encoded += 1;
        s.bytes_encoded += n as u64;
        s.stereo_time = stereo_time;
        s.encode_time = encode_time;
        s.total_time = out.encode_duration;
        s.compression_ratio = raw as f64 / n as f64;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
