//! Error types for the streaming pipeline.
//!
//! Only initialization-time failures are meant to reach the caller as
//! hard errors. Per-frame and per-connection failures use the same types
//! internally but are logged and counted by the stage that hit them.

use thiserror::Error;

/// The canonical error type for the streaming pipeline.
#[derive(Debug, Error)]
pub enum VrsError {
    // ── Stage Errors ─────────────────────────────────────────────
    /// The capture stage failed.
    #[error("capture: {0}")]
    Capture(#[from] CaptureError),

    /// The stereo or compression stage failed.
    #[error("encode: {0}")]
    Encode(#[from] EncodeError),

    // ── Network Errors ───────────────────────────────────────────
    /// The server could not bind its listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The IO layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A control message could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A session state transition was not allowed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Configuration Errors ─────────────────────────────────────
    /// A preset name did not match any known preset.
    #[error("unknown preset: {0}")]
    UnknownPreset(String),

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    // ── Lifecycle Errors ─────────────────────────────────────────
    /// An operation required `init()` to have succeeded first.
    #[error("pipeline not initialized")]
    NotInitialized,

    /// `start()` was called on a running component.
    #[error("already running")]
    AlreadyRunning,

    /// A worker thread could not be spawned.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

// ── CaptureError ──────────────────────────────────────────────────

/// Failures reported by a capture backend or the capture stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The platform capture API is not present on this host.
    #[error("capture API unavailable: {0}")]
    Unavailable(String),

    /// Another process holds the duplication, or access was refused.
    #[error("capture access denied: {0}")]
    AccessDenied(String),

    /// The capture session was invalidated (mode change, secure desktop).
    #[error("capture access lost")]
    AccessLost,

    /// The requested monitor does not exist.
    #[error("monitor {0} not found")]
    MonitorNotFound(u32),

    /// The target window no longer exists.
    #[error("target window is no longer valid")]
    WindowInvalid,

    /// The visible part of the window is below the usable minimum.
    #[error("window region too small: {width}x{height}")]
    WindowTooSmall { width: u32, height: u32 },

    /// `copy_to_host` was called without an acquired frame.
    #[error("no frame is currently held")]
    NoFrameHeld,

    /// Recovery gave up after the bounded number of rebinds.
    #[error("capture recovery exhausted after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },

    /// Any other platform failure.
    #[error("platform error: {0}")]
    Platform(String),
}

impl CaptureError {
    /// Whether the error only affects the current frame.
    pub fn is_per_frame(&self) -> bool {
        matches!(
            self,
            CaptureError::WindowInvalid
                | CaptureError::WindowTooSmall { .. }
                | CaptureError::NoFrameHeld
        )
    }
}

// ── EncodeError ───────────────────────────────────────────────────

/// Failures reported by the stereo and JPEG stages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// No JPEG backend initialized.
    #[error("no compression backend available")]
    NoBackend,

    /// The frame or output dimensions cannot be encoded.
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// The input buffer is shorter than its dimensions require.
    #[error("buffer too short: need {needed} bytes, have {actual}")]
    BufferTooShort { needed: usize, actual: usize },

    /// The backend produced zero bytes.
    #[error("encoder produced no output")]
    Empty,

    /// The backend library reported an error.
    #[error("{backend}: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = VrsError::UnknownPreset("turbo".into());
        assert!(e.to_string().contains("turbo"));

        let e = CaptureError::WindowTooSmall {
            width: 4,
            height: 9,
        };
        assert!(e.to_string().contains("4x9"));
    }

    #[test]
    fn from_capture_error() {
        let e: VrsError = CaptureError::AccessLost.into();
        assert!(matches!(e, VrsError::Capture(CaptureError::AccessLost)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: VrsError = io_err.into();
        assert!(matches!(e, VrsError::Io(_)));
    }

    #[test]
    fn per_frame_classification() {
        assert!(CaptureError::WindowInvalid.is_per_frame());
        assert!(!CaptureError::AccessLost.is_per_frame());
        assert!(!CaptureError::Unavailable("x".into()).is_per_frame());
    }
}
