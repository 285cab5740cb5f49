//! # vrs-core
//!
//! Desktop-to-headset streaming pipeline.
//!
//! This crate contains:
//! - **Capture**: `CaptureBackend` (DXGI desktop duplication on Windows,
//!   a synthetic source elsewhere) driven by `Capturer`
//! - **Buffers**: `FramePool`, `CompressedPool` and the lock-free
//!   `spsc_queue` between the capture and encode threads
//! - **Encoding**: side-by-side stereo transform plus JPEG compression
//!   (`VrFrameEncoder`) with automatic backend selection
//! - **Server**: `StreamingServer`, a WebSocket broadcast hub with a static
//!   file surface for the browser viewer
//! - **Pipeline**: `VrStreamer`, which owns the stage threads
//! - **Config**: `PipelineConfig`, quality presets and the runtime-mutable
//!   `SharedConfig`
//! - **Error**: `VrsError`, a `thiserror`-based error hierarchy

pub mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod server;
pub mod stats;
pub mod stereo;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{
    CaptureBackend, CaptureTarget, Capturer, MonitorInfo, Rect, SyntheticBackend, WindowHandle,
    WindowInfo, default_backend,
};
pub use config::{
    EncodeSettings, EncoderBackend, PipelineConfig, QualityPreset, Sampling, SharedConfig,
};
pub use encoder::{AutoJpegEncoder, VrFrameEncoder};
pub use error::{CaptureError, EncodeError, VrsError};
pub use frame::{CompressedFrame, PixelFormat, RawFrame};
pub use pipeline::VrStreamer;
pub use pool::{CompressedPool, FramePool};
pub use queue::spsc_queue;
pub use server::{ClientInfo, ControlMessage, ServerConfig, ServerHandle, StreamingServer};
pub use stats::PipelineStats;
pub use stereo::AutoStereoProcessor;
