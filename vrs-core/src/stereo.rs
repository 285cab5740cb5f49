//! Side-by-side stereo transform.
//!
//! One resampling pass turns a monoscopic capture into a BGR frame whose
//! left and right halves each show the whole source, scaled to half the
//! output width. The right eye samples `eye_separation * source_width`
//! pixels further right than the left eye, clamped at the edge, which
//! gives a fixed parallax. Downscaling happens in the same pass.
//!
//! Two strategies sit behind [`StereoProcessor`]: a row-parallel CPU
//! resampler and a GPU kernel. [`AutoStereoProcessor`] probes once at
//! construction and keeps whichever is usable.

use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::config::Sampling;
use crate::error::EncodeError;
use crate::frame::ImageView;

/// Output bytes per pixel (BGR).
pub const OUTPUT_CHANNELS: usize = 3;

// ── Geometry ─────────────────────────────────────────────────────

/// Output size for an input of `width x height`.
///
/// An explicit `forced` size (both non-zero) wins over `downscale`. The
/// result never exceeds the input and both sides are even.
pub fn output_dimensions(
    width: u32,
    height: u32,
    downscale: f32,
    forced: (u32, u32),
) -> Result<(u32, u32), EncodeError> {
    if width < 2 || height < 2 {
        return Err(EncodeError::InvalidDimensions { width, height });
    }
    let (w, h) = if forced.0 > 0 && forced.1 > 0 {
        (forced.0.min(width), forced.1.min(height))
    } else if downscale < 1.0 {
        let f = downscale.max(f32::MIN_POSITIVE);
        (
            (width as f32 * f) as u32,
            (height as f32 * f) as u32,
        )
    } else {
        (width, height)
    };
    Ok(((w / 2 * 2).max(2), (h / 2 * 2).max(2)))
}

/// Parameters of one stereo pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoParams {
    /// Full output width (both eyes). Must be even.
    pub output_width: u32,
    pub output_height: u32,
    /// Horizontal parallax as a fraction of the source width.
    pub eye_separation: f32,
    pub sampling: Sampling,
}

impl StereoParams {
    pub fn output_pitch(&self) -> usize {
        self.output_width as usize * OUTPUT_CHANNELS
    }
}

// ── StereoProcessor ──────────────────────────────────────────────

/// A stereo transform strategy.
pub trait StereoProcessor: Send {
    fn name(&self) -> &'static str;

    /// Whether the strategy initialized on this host.
    fn is_available(&self) -> bool;

    /// Resample `input` into `output` and return the output row pitch.
    fn process(
        &mut self,
        input: &ImageView<'_>,
        params: &StereoParams,
        output: &mut Vec<u8>,
    ) -> Result<usize, EncodeError>;
}

fn check_input(input: &ImageView<'_>, params: &StereoParams) -> Result<(), EncodeError> {
    if input.width == 0 || input.height == 0 {
        return Err(EncodeError::InvalidDimensions {
            width: input.width,
            height: input.height,
        });
    }
    if params.output_width < 2 || params.output_width % 2 != 0 || params.output_height == 0 {
        return Err(EncodeError::InvalidDimensions {
            width: params.output_width,
            height: params.output_height,
        });
    }
    let needed = input.required_len();
    if input.data.len() < needed {
        return Err(EncodeError::BufferTooShort {
            needed,
            actual: input.data.len(),
        });
    }
    Ok(())
}

// ── CPU strategy ─────────────────────────────────────────────────

/// Horizontal sample for one output column: two source columns and the
/// weight of the second.
#[derive(Debug, Clone, Copy)]
struct Tap {
    x0: usize,
    x1: usize,
    frac: f32,
}

/// Row-parallel CPU resampler.
#[derive(Debug, Default)]
pub struct CpuStereoProcessor {
    /// Per-output-column taps for the left then the right eye.
    taps: Vec<Tap>,
    taps_key: Option<(u32, u32, u32, Sampling)>,
}

impl CpuStereoProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_taps(&mut self, in_w: u32, out_w: u32, separation: u32, sampling: Sampling) {
        let key = (in_w, out_w, separation, sampling);
        if self.taps_key == Some(key) {
            return;
        }
        let half = out_w as usize / 2;
        let last = in_w as usize - 1;
        let sep = separation as usize;
        self.taps.clear();
        self.taps.reserve(half * 2);

        match sampling {
            Sampling::Nearest => {
                let scale = in_w as f32 / half as f32;
                for eye_offset in [0, sep] {
                    for x in 0..half {
                        let src = ((x as f32 * scale) as usize + eye_offset).min(last);
                        self.taps.push(Tap {
                            x0: src,
                            x1: src,
                            frac: 0.0,
                        });
                    }
                }
            }
            Sampling::Bilinear => {
                let scale = if half > 1 {
                    last as f32 / (half - 1) as f32
                } else {
                    0.0
                };
                for eye_offset in [0, sep] {
                    for x in 0..half {
                        let src = (x as f32 * scale + eye_offset as f32).min(last as f32);
                        let x0 = src as usize;
                        self.taps.push(Tap {
                            x0,
                            x1: (x0 + 1).min(last),
                            frac: src - x0 as f32,
                        });
                    }
                }
            }
        }
        self.taps_key = Some(key);
    }
}

impl StereoProcessor for CpuStereoProcessor {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn process(
        &mut self,
        input: &ImageView<'_>,
        params: &StereoParams,
        output: &mut Vec<u8>,
    ) -> Result<usize, EncodeError> {
        check_input(input, params)?;

        let separation = (input.width as f32 * params.eye_separation.max(0.0)) as u32;
        self.build_taps(input.width, params.output_width, separation, params.sampling);

        let pitch = params.output_pitch();
        let out_h = params.output_height as usize;
        output.resize(pitch * out_h, 0);

        let in_h = input.height as usize;
        let bpp = input.format.bytes_per_pixel();
        let [ob, og, or] = input.format.bgr_offsets();
        let taps = &self.taps;
        let src = input.data;
        let stride = input.stride;

        match params.sampling {
            Sampling::Nearest => {
                let y_scale = in_h as f32 / out_h as f32;
                output
                    .par_chunks_mut(pitch)
                    .enumerate()
                    .for_each(|(y, dst)| {
                        let sy = ((y as f32 * y_scale) as usize).min(in_h - 1);
                        let row = &src[sy * stride..];
                        for (px, tap) in dst.chunks_exact_mut(OUTPUT_CHANNELS).zip(taps) {
                            let p = tap.x0 * bpp;
                            px[0] = row[p + ob];
                            px[1] = row[p + og];
                            px[2] = row[p + or];
                        }
                    });
            }
            Sampling::Bilinear => {
                let y_scale = if out_h > 1 {
                    (in_h - 1) as f32 / (out_h - 1) as f32
                } else {
                    0.0
                };
                output
                    .par_chunks_mut(pitch)
                    .enumerate()
                    .for_each(|(y, dst)| {
                        let sy = y as f32 * y_scale;
                        let y0 = (sy as usize).min(in_h - 1);
                        let y1 = (y0 + 1).min(in_h - 1);
                        let fy = sy - y0 as f32;
                        let r0 = &src[y0 * stride..];
                        let r1 = &src[y1 * stride..];
                        for (px, tap) in dst.chunks_exact_mut(OUTPUT_CHANNELS).zip(taps) {
                            let (p0, p1) = (tap.x0 * bpp, tap.x1 * bpp);
                            let fx = tap.frac;
                            for (c, off) in [ob, og, or].into_iter().enumerate() {
                                let top = r0[p0 + off] as f32 * (1.0 - fx) + r0[p1 + off] as f32 * fx;
                                let bot = r1[p0 + off] as f32 * (1.0 - fx) + r1[p1 + off] as f32 * fx;
                                px[c] = (top * (1.0 - fy) + bot * fy + 0.5) as u8;
                            }
                        }
                    });
            }
        }
        Ok(pitch)
    }
}

// ── GPU strategy ─────────────────────────────────────────────────

/// GPU resampler, one kernel thread per output pixel.
///
/// No compute backend is wired in, so the probe always reports
/// unavailable and [`AutoStereoProcessor`] falls back to the CPU.
#[derive(Debug)]
pub struct GpuStereoProcessor {
    available: bool,
}

impl GpuStereoProcessor {
    pub fn probe() -> Self {
        Self { available: false }
    }
}

impl StereoProcessor for GpuStereoProcessor {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn process(
        &mut self,
        _input: &ImageView<'_>,
        _params: &StereoParams,
        _output: &mut Vec<u8>,
    ) -> Result<usize, EncodeError> {
        Err(EncodeError::Backend {
            backend: "gpu",
            message: "stereo kernel unavailable".into(),
        })
    }
}

// ── AutoStereoProcessor ──────────────────────────────────────────

/// Running timing for the selected strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StereoStats {
    pub frames_processed: u64,
    pub last_process_ms: f64,
    pub avg_process_ms: f64,
}

/// Picks the best available strategy once and delegates to it.
pub struct AutoStereoProcessor {
    selected: Box<dyn StereoProcessor>,
    stats: StereoStats,
}

impl AutoStereoProcessor {
    /// Probe the GPU (when allowed) and fall back to the CPU.
    pub fn new(allow_gpu: bool) -> Self {
        if allow_gpu {
            let gpu = GpuStereoProcessor::probe();
            if gpu.is_available() {
                tracing::info!("stereo: using GPU kernel");
                return Self::with_processor(Box::new(gpu));
            }
            tracing::debug!("stereo: GPU kernel unavailable, using CPU");
        }
        Self::with_processor(Box::new(CpuStereoProcessor::new()))
    }

    pub fn with_processor(selected: Box<dyn StereoProcessor>) -> Self {
        Self {
            selected,
            stats: StereoStats::default(),
        }
    }

    pub fn stats(&self) -> StereoStats {
        self.stats
    }

    fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let s = &mut self.stats;
        s.frames_processed += 1;
        s.last_process_ms = ms;
        s.avg_process_ms += (ms - s.avg_process_ms) / s.frames_processed as f64;
    }
}

impl StereoProcessor for AutoStereoProcessor {
    fn name(&self) -> &'static str {
        self.selected.name()
    }

    fn is_available(&self) -> bool {
        self.selected.is_available()
    }

    fn process(
        &mut self,
        input: &ImageView<'_>,
        params: &StereoParams,
        output: &mut Vec<u8>,
    ) -> Result<usize, EncodeError> {
        let start = Instant::now();
        let pitch = self.selected.process(input, params, output)?;
        self.record(start.elapsed());
        Ok(pitch)
    }
}

// ── Passthrough ──────────────────────────────────────────────────

/// Repack `input` as tightly packed BGR without resampling. Used when
/// stereo output is disabled.
pub fn to_packed_bgr(input: &ImageView<'_>, output: &mut Vec<u8>) -> Result<usize, EncodeError> {
    let needed = input.required_len();
    if input.data.len() < needed {
        return Err(EncodeError::BufferTooShort {
            needed,
            actual: input.data.len(),
        });
    }
    let w = input.width as usize;
    let pitch = w * OUTPUT_CHANNELS;
    output.resize(pitch * input.height as usize, 0);
    if pitch == 0 {
        return Ok(0);
    }
    let bpp = input.format.bytes_per_pixel();
    let [ob, og, or] = input.format.bgr_offsets();
    output
        .par_chunks_mut(pitch)
        .enumerate()
        .for_each(|(y, dst)| {
            let row = &input.data[y * input.stride..y * input.stride + w * bpp];
            for (px, sp) in dst.chunks_exact_mut(OUTPUT_CHANNELS).zip(row.chunks_exact(bpp)) {
                px[0] = sp[ob];
                px[1] = sp[og];
                px[2] = sp[or];
            }
        });
    Ok(pitch)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PixelFormat, RawFrame};

    /// BGRA gradient with row padding; B = x, G = y, R = x ^ y.
    fn test_frame(w: u32, h: u32) -> RawFrame {
        let mut f = RawFrame::with_capacity(0);
        f.prepare(w, h, w * 4 + 16, PixelFormat::Bgra8);
        for y in 0..h {
            for x in 0..w {
                let off = (y * f.stride + x * 4) as usize;
                f.data[off] = x as u8;
                f.data[off + 1] = y as u8;
                f.data[off + 2] = (x ^ y) as u8;
                f.data[off + 3] = 255;
            }
        }
        f
    }

    fn params(w: u32, h: u32, sep: f32, sampling: Sampling) -> StereoParams {
        StereoParams {
            output_width: w,
            output_height: h,
            eye_separation: sep,
            sampling,
        }
    }

    fn halves(out: &[u8], pitch: usize) -> Vec<(&[u8], &[u8])> {
        out.chunks(pitch)
            .map(|row| row.split_at(pitch / 2))
            .collect()
    }

    #[test]
    fn zero_separation_gives_identical_eyes() {
        let frame = test_frame(200, 100);
        for sampling in [Sampling::Nearest, Sampling::Bilinear] {
            let mut cpu = CpuStereoProcessor::new();
            let mut out = Vec::new();
            let p = params(160, 80, 0.0, sampling);
            let pitch = cpu.process(&frame.view(), &p, &mut out).unwrap();
            assert_eq!(pitch, 480);
            assert_eq!(out.len(), 480 * 80);
            for (left, right) in halves(&out, pitch) {
                assert_eq!(left, right);
            }
        }
    }

    #[test]
    fn separation_shifts_right_eye() {
        let frame = test_frame(100, 10);
        let mut cpu = CpuStereoProcessor::new();
        let mut out = Vec::new();
        // Full-size eyes: half = 100 would need 200 wide output.
        let p = params(200, 10, 0.05, Sampling::Nearest);
        let pitch = cpu.process(&frame.view(), &p, &mut out).unwrap();
        let (left, right) = halves(&out, pitch)[0];
        // Left eye column 10 samples x = 10, right eye samples x = 15.
        assert_eq!(left[10 * 3], 10);
        assert_eq!(right[10 * 3], 15);
        // Right edge is clamped to the last source column.
        assert_eq!(right[99 * 3], 99);
    }

    #[test]
    fn drops_alpha_and_keeps_bgr_order() {
        let frame = test_frame(8, 4);
        let mut cpu = CpuStereoProcessor::new();
        let mut out = Vec::new();
        cpu.process(&frame.view(), &params(16, 4, 0.0, Sampling::Nearest), &mut out)
            .unwrap();
        // Output pixel (3, 2) of the left eye is source (3, 2).
        let px = &out[2 * 48 + 3 * 3..2 * 48 + 3 * 3 + 3];
        assert_eq!(px, &[3, 2, 3 ^ 2]);
    }

    #[test]
    fn rgba_input_is_swizzled_to_bgr() {
        let data = [10u8, 20, 30, 255, 40, 50, 60, 255];
        let view = ImageView::packed(&data, 2, 1, PixelFormat::Rgba8);
        let mut out = Vec::new();
        to_packed_bgr(&view, &mut out).unwrap();
        assert_eq!(out, vec![30, 20, 10, 60, 50, 40]);
    }

    #[test]
    fn bilinear_corners_match_source() {
        let frame = test_frame(64, 32);
        let mut cpu = CpuStereoProcessor::new();
        let mut out = Vec::new();
        let pitch = cpu
            .process(&frame.view(), &params(64, 16, 0.0, Sampling::Bilinear), &mut out)
            .unwrap();
        let last_row = &out[15 * pitch..];
        // Left eye, last column maps to source (63, 31).
        assert_eq!(&last_row[31 * 3..31 * 3 + 2], &[63, 31]);
        assert_eq!(&out[0..2], &[0, 0]);
    }

    #[test]
    fn output_dimensions_are_even_and_bounded() {
        for (w, h) in [(1920, 1080), (1921, 1081), (3, 3), (2, 2), (3840, 2160)] {
            for f in [0.1f32, 0.33, 0.35, 0.5, 0.65, 0.8, 0.999, 1.0] {
                let (ow, oh) = output_dimensions(w, h, f, (0, 0)).unwrap();
                assert!(ow <= w && oh <= h, "{w}x{h} @ {f} -> {ow}x{oh}");
                assert_eq!(ow % 2, 0);
                assert_eq!(oh % 2, 0);
                assert!(ow >= 2 && oh >= 2);
            }
        }
        assert_eq!(output_dimensions(1920, 1080, 0.5, (0, 0)).unwrap(), (960, 540));
        assert_eq!(output_dimensions(1920, 1080, 0.5, (1281, 721)).unwrap(), (1280, 720));
        assert!(output_dimensions(1, 100, 1.0, (0, 0)).is_err());
    }

    #[test]
    fn rejects_short_buffer_and_odd_width() {
        let frame = test_frame(10, 10);
        let mut view = frame.view();
        view.data = &frame.data[..50];
        let mut cpu = CpuStereoProcessor::new();
        let mut out = Vec::new();
        assert!(matches!(
            cpu.process(&view, &params(10, 10, 0.0, Sampling::Nearest), &mut out),
            Err(EncodeError::BufferTooShort { .. })
        ));
        assert!(matches!(
            cpu.process(&frame.view(), &params(9, 10, 0.0, Sampling::Nearest), &mut out),
            Err(EncodeError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn auto_falls_back_to_cpu_and_tracks_time() {
        let mut auto = AutoStereoProcessor::new(true);
        assert_eq!(auto.name(), "cpu");
        assert!(!GpuStereoProcessor::probe().is_available());
        let frame = test_frame(32, 32);
        let mut out = Vec::new();
        auto.process(&frame.view(), &params(32, 16, 0.03, Sampling::Nearest), &mut out)
            .unwrap();
        assert_eq!(auto.stats().frames_processed, 1);
    }
}
