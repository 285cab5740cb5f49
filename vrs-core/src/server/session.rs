//! Per-client session state.
//!
//! A [`Session`] is shared between the broadcast path (which offers it
//! frames from the encode thread) and the tokio tasks that own its
//! socket. Everything the broadcast path touches is non-blocking.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::protocol::{ControlMessage, latency_ms, unix_seconds};
use crate::error::VrsError;

/// Control messages waiting for the writer, per session.
const CONTROL_QUEUE_DEPTH: usize = 16;

// ── SessionPhase ─────────────────────────────────────────────────

/// Lifecycle of one client connection.
///
/// ```text
///  Connecting ──► Open ──► Closing ──► Closed
///       │                    ▲
///       └────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// TCP accepted, WebSocket handshake pending.
    #[default]
    Connecting,
    Open {
        since: Instant,
    },
    Closing,
    Closed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Open { .. } => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl SessionPhase {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Time spent open, `None` in any other phase.
    pub fn open_duration(&self) -> Option<Duration> {
        match self {
            Self::Open { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    /// Valid from: `Connecting`.
    pub fn open(&mut self) -> Result<(), VrsError> {
        match self {
            Self::Connecting => {
                *self = Self::Open {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(VrsError::ProtocolViolation(
                "cannot open: not in Connecting state",
            )),
        }
    }

    /// Valid from: `Connecting`, `Open`.
    pub fn begin_close(&mut self) -> Result<(), VrsError> {
        match self {
            Self::Connecting | Self::Open { .. } => {
                *self = Self::Closing;
                Ok(())
            }
            _ => Err(VrsError::ProtocolViolation(
                "cannot close: session already closing",
            )),
        }
    }

    /// Valid from: `Closing`.
    pub fn finish_close(&mut self) -> Result<(), VrsError> {
        match self {
            Self::Closing => {
                *self = Self::Closed;
                Ok(())
            }
            _ => Err(VrsError::ProtocolViolation(
                "cannot finish close: not in Closing state",
            )),
        }
    }
}

// ── ClientInfo ───────────────────────────────────────────────────

/// Snapshot of one connected client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    /// `address:port` of the peer.
    pub id: String,
    pub session_id: u64,
    pub address: String,
    /// Unix seconds.
    pub connected_at: f64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    /// Frames skipped because this client's queue was full.
    pub frames_dropped: u64,
    pub latency_ms: f64,
}

// ── Session ──────────────────────────────────────────────────────

/// Receiving halves handed to the session's writer task.
pub(crate) struct SessionChannels {
    pub frames: mpsc::Receiver<Bytes>,
    pub control: mpsc::Receiver<String>,
}

/// Result of offering a frame to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Queue full; the frame was dropped for this session.
    Dropped,
    Closed,
}

pub struct Session {
    id: u64,
    peer: SocketAddr,
    connected_at: f64,
    phase: Mutex<SessionPhase>,
    frames_tx: mpsc::Sender<Bytes>,
    control_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    closed: AtomicBool,
    last_seen: Mutex<Instant>,

    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_dropped: AtomicU64,
    /// Latest latency sample, f64 bits.
    latency_ms: AtomicU64,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        peer: SocketAddr,
        queue_depth: usize,
        parent: &CancellationToken,
    ) -> (Self, SessionChannels) {
        let (frames_tx, frames) = mpsc::channel(queue_depth.max(1));
        let (control_tx, control) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let session = Self {
            id,
            peer,
            connected_at: unix_seconds(),
            phase: Mutex::new(SessionPhase::Connecting),
            frames_tx,
            control_tx,
            cancel: parent.child_token(),
            closed: AtomicBool::new(false),
            last_seen: Mutex::new(Instant::now()),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0f64.to_bits()),
        };
        (session, SessionChannels { frames, control })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_open(&self) -> bool {
        self.phase().is_open()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn mark_open(&self) -> Result<(), VrsError> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner()).open()
    }

    /// Queue a frame without waiting. A full queue drops this frame.
    pub fn offer_frame(&self, payload: Bytes) -> Offer {
        if self.closed.load(Ordering::Acquire) {
            return Offer::Closed;
        }
        match self.frames_tx.try_send(payload) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(_)) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                Offer::Dropped
            }
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Queue a control message; these are written ahead of frames.
    pub fn send_control(&self, msg: &ControlMessage) -> bool {
        !self.closed.load(Ordering::Acquire) && self.control_tx.try_send(msg.to_json()).is_ok()
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Any inbound traffic counts as liveness.
    pub(crate) fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Record an echoed ping and return the latency sample.
    pub(crate) fn record_pong(&self, sent_time: f64) -> f64 {
        let ms = latency_ms(sent_time, unix_seconds());
        self.latency_ms.store(ms.to_bits(), Ordering::Relaxed);
        ms
    }

    pub fn latency_ms(&self) -> f64 {
        f64::from_bits(self.latency_ms.load(Ordering::Relaxed))
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.peer.to_string(),
            session_id: self.id,
            address: self.peer.ip().to_string(),
            connected_at: self.connected_at,
            frames_sent: self.frames_sent(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped(),
            latency_ms: self.latency_ms(),
        }
    }

    /// Start tearing the session down. Returns `true` only for the call
    /// that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self
            .phase
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .begin_close();
        self.cancel.cancel();
        true
    }

    /// Mark the socket as gone. Called once the session's tasks ended.
    pub(crate) fn finish(&self) {
        self.close();
        let _ = self
            .phase
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .finish_close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(depth: usize) -> (Session, SessionChannels) {
        let root = CancellationToken::new();
        Session::new(1, "192.168.1.20:50000".parse().unwrap(), depth, &root)
    }

    #[test]
    fn phase_transitions() {
        let mut p = SessionPhase::default();
        assert!(p.finish_close().is_err());
        p.open().unwrap();
        assert!(p.is_open());
        assert!(p.open_duration().is_some());
        assert!(p.open().is_err());
        p.begin_close().unwrap();
        assert!(p.begin_close().is_err());
        p.finish_close().unwrap();
        assert_eq!(p, SessionPhase::Closed);
        assert_eq!(p.to_string(), "Closed");
    }

    #[test]
    fn connecting_session_can_close_directly() {
        let mut p = SessionPhase::Connecting;
        p.begin_close().unwrap();
        assert_eq!(p, SessionPhase::Closing);
    }

    #[test]
    fn full_queue_drops_newest() {
        let (s, mut ch) = session(2);
        assert_eq!(s.offer_frame(Bytes::from_static(b"a")), Offer::Queued);
        assert_eq!(s.offer_frame(Bytes::from_static(b"b")), Offer::Queued);
        assert_eq!(s.offer_frame(Bytes::from_static(b"c")), Offer::Dropped);
        assert_eq!(s.frames_dropped(), 1);

        assert_eq!(ch.frames.try_recv().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(ch.frames.try_recv().unwrap(), Bytes::from_static(b"b"));
        assert!(ch.frames.try_recv().is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let (s, _ch) = session(4);
        s.mark_open().unwrap();
        assert!(s.close());
        assert!(!s.close());
        assert!(s.cancel_token().is_cancelled());
        assert_eq!(s.phase(), SessionPhase::Closing);
        assert_eq!(s.offer_frame(Bytes::from_static(b"x")), Offer::Closed);
        s.finish();
        s.finish();
        assert_eq!(s.phase(), SessionPhase::Closed);
    }

    #[test]
    fn parent_cancel_reaches_session() {
        let root = CancellationToken::new();
        let (s, _ch) = Session::new(9, "127.0.0.1:1".parse().unwrap(), 1, &root);
        root.cancel();
        assert!(s.cancel_token().is_cancelled());
    }

    #[test]
    fn info_reflects_counters() {
        let (s, _ch) = session(4);
        s.record_sent(1000);
        s.record_sent(500);
        let info = s.info();
        assert_eq!(info.id, "192.168.1.20:50000");
        assert_eq!(info.address, "192.168.1.20");
        assert_eq!(info.frames_sent, 2);
        assert_eq!(info.bytes_sent, 1500);
    }

    #[test]
    fn control_messages_queue_as_json() {
        let (s, mut ch) = session(1);
        assert!(s.send_control(&ControlMessage::Ping { sent_time: 1.0 }));
        assert_eq!(ch.control.try_recv().unwrap(), r#"{"type":"ping","sent_time":1.0}"#);
    }
}
