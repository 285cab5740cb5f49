//! WebSocket broadcast server.
//!
//! Runs on its own multi-thread tokio runtime so the capture and encode
//! threads never touch async code: [`StreamingServer::push_frame`] is a
//! plain synchronous call that fans a shared frame out to every open
//! session's bounded queue and returns immediately.
//!
//! Each session gets a writer task (control messages first, then
//! frames, one write in flight) and a reader task that handles control
//! messages, pings the client and enforces the keepalive timeout.

pub mod http;
pub mod protocol;
pub mod session;

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::VrsError;
use crate::frame::{CompressedFrame, shared_payload};
use crate::stats::{BandwidthEstimator, RateMeter};

pub use http::StaticFileServer;
pub use protocol::ControlMessage;
pub use session::{ClientInfo, Offer, Session, SessionPhase};

use session::SessionChannels;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// How long `stop()` waits for sessions to say goodbye.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

pub type ClientCallback = Arc<dyn Fn(&ClientInfo) + Send + Sync>;
pub type QualityCallback = Arc<dyn Fn(&str) + Send + Sync>;

// ── ServerConfig ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    pub ping_interval: Duration,
    /// Sessions silent for longer than this are closed.
    pub keepalive_timeout: Duration,
    pub session_queue_depth: usize,
    pub tcp_nodelay: bool,
    /// Runtime worker threads; 0 picks from the hardware.
    pub worker_threads: usize,
    /// Advertised address instead of the detected one.
    pub static_ip: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_network(&NetworkConfig::default())
    }
}

impl ServerConfig {
    pub fn from_network(net: &NetworkConfig) -> Self {
        Self {
            host: net.host.clone(),
            port: net.port,
            max_clients: net.max_clients,
            ping_interval: net.ping_interval(),
            keepalive_timeout: net.keepalive_timeout(),
            session_queue_depth: net.session_queue_depth,
            tcp_nodelay: net.tcp_nodelay,
            worker_threads: 0,
            static_ip: net.static_ip.clone(),
        }
    }

    fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn runtime_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        thread::available_parallelism()
            .map(|n| n.get().clamp(2, 4))
            .unwrap_or(2)
    }
}

// ── ServerStats ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerStats {
    pub frames_pushed: u64,
    /// Frame writes completed, summed over sessions.
    pub frames_sent: u64,
    /// Frames skipped at full session queues, summed over sessions.
    pub frames_dropped: u64,
    pub bytes_sent: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connected_clients: usize,
    pub avg_latency_ms: f64,
    pub bitrate_mbps: f64,
    /// Rate of `push_frame` calls.
    pub fps: f64,
    pub uptime_seconds: f64,
}

// ── Shared state ─────────────────────────────────────────────────

#[derive(Default)]
struct Callbacks {
    on_connect: Option<ClientCallback>,
    on_disconnect: Option<ClientCallback>,
    on_quality: Option<QualityCallback>,
}

#[derive(Debug, Clone, Copy, Default)]
struct StreamInfo {
    width: u32,
    height: u32,
    stereo: bool,
}

struct Shared {
    config: ServerConfig,
    server_ip: String,
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    next_id: AtomicU64,
    callbacks: RwLock<Callbacks>,
    stream_info: Mutex<StreamInfo>,
    started: Instant,

    frames_pushed: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_sent: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    bandwidth: Mutex<BandwidthEstimator>,
    push_rate: Mutex<RateMeter>,
}

impl Shared {
    fn register(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.id(), session);
    }

    /// Remove a session and fire the disconnect callback. Only the first
    /// call per id does anything.
    fn unregister(&self, id: u64) {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(session) = removed {
            session.finish();
            let info = session.info();
            info!(
                session = id,
                peer = %info.id,
                frames_sent = info.frames_sent,
                frames_dropped = info.frames_dropped,
                "client disconnected"
            );
            self.fire_disconnect(&info);
        }
    }

    fn callbacks(&self) -> std::sync::RwLockReadGuard<'_, Callbacks> {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn fire_connect(&self, info: &ClientInfo) {
        let cb = self.callbacks().on_connect.clone();
        if let Some(cb) = cb {
            cb(info);
        }
    }

    fn fire_disconnect(&self, info: &ClientInfo) {
        let cb = self.callbacks().on_disconnect.clone();
        if let Some(cb) = cb {
            cb(info);
        }
    }

    fn fire_quality(&self, preset: &str) {
        let cb = self.callbacks().on_quality.clone();
        if let Some(cb) = cb {
            cb(preset);
        }
    }

    fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.bandwidth
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(bytes as u64);
    }

    fn config_message(&self) -> ControlMessage {
        let info = *self.stream_info.lock().unwrap_or_else(|e| e.into_inner());
        ControlMessage::Config {
            server_time: protocol::unix_seconds(),
            server_ip: self.server_ip.clone(),
            width: info.width,
            height: info.height,
            stereo: info.stereo,
        }
    }
}

// ── StreamingServer ──────────────────────────────────────────────

pub struct StreamingServer {
    shared: Arc<Shared>,
    runtime: Option<Runtime>,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
    http: Option<StaticFileServer>,
}

impl StreamingServer {
    pub fn new(config: ServerConfig) -> Self {
        let server_ip = config.static_ip.clone().unwrap_or_else(detect_local_ip);
        Self {
            shared: Arc::new(Shared {
                config,
                server_ip,
                sessions: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                callbacks: RwLock::new(Callbacks::default()),
                stream_info: Mutex::new(StreamInfo::default()),
                started: Instant::now(),
                frames_pushed: AtomicU64::new(0),
                frames_sent: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                accepted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                bandwidth: Mutex::new(BandwidthEstimator::new()),
                push_rate: Mutex::new(RateMeter::new()),
            }),
            runtime: None,
            shutdown: CancellationToken::new(),
            local_addr: None,
            http: None,
        }
    }

    /// Bind the WebSocket port and start accepting clients.
    pub fn start(&mut self) -> Result<SocketAddr, VrsError> {
        if self.runtime.is_some() {
            return Err(VrsError::AlreadyRunning);
        }
        let config = &self.shared.config;
        let addr = config.bind_addr();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.runtime_threads())
            .thread_name("vrs-net")
            .enable_all()
            .build()?;

        let bind_err = |source| VrsError::Bind {
            addr: addr.clone(),
            source,
        };
        let std_listener = std::net::TcpListener::bind(&addr).map_err(bind_err)?;
        std_listener.set_nonblocking(true).map_err(bind_err)?;
        let local = std_listener.local_addr()?;

        self.shutdown = CancellationToken::new();
        runtime.spawn(accept_loop(
            std_listener,
            Arc::clone(&self.shared),
            self.shutdown.clone(),
        ));

        info!(
            addr = %local,
            url = %format!("ws://{}:{}", self.shared.server_ip, local.port()),
            max_clients = config.max_clients,
            "streaming server listening"
        );
        self.runtime = Some(runtime);
        self.local_addr = Some(local);
        Ok(local)
    }

    /// Serve `root` over HTTP on `port` from the server runtime.
    pub fn start_http(&mut self, root: impl Into<PathBuf>, port: u16) -> Result<SocketAddr, VrsError> {
        let runtime = self.runtime.as_ref().ok_or(VrsError::NotInitialized)?;
        let mut http = StaticFileServer::new(root, &self.shared.config.host, port);
        let addr = http.start(runtime.handle())?;
        self.http = Some(http);
        Ok(addr)
    }

    /// Close every session, stop accepting and shut the runtime down.
    /// Safe to call more than once.
    pub fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if let Some(mut http) = self.http.take() {
            http.stop();
        }
        self.shutdown.cancel();
        for session in self.sessions_snapshot() {
            session.close();
        }

        let in_async = Handle::try_current().is_ok();
        if !in_async {
            let deadline = Instant::now() + DRAIN_TIMEOUT;
            while self.client_count() > 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
        }
        if in_async {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(CLOSE_TIMEOUT);
        }

        // Sessions whose tasks were cut short by the shutdown.
        let ids: Vec<u64> = self.sessions_snapshot().iter().map(|s| s.id()).collect();
        for id in ids {
            self.shared.unregister(id);
        }
        self.local_addr = None;
        info!("streaming server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().and_then(StaticFileServer::local_addr)
    }

    /// Geometry advertised in the `config` message to new sessions.
    pub fn set_stream_info(&self, width: u32, height: u32, stereo: bool) {
        *self
            .shared
            .stream_info
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = StreamInfo {
            width,
            height,
            stereo,
        };
    }

    /// A clonable handle for threads that push frames or read stats.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn push_frame(&self, frame: Arc<CompressedFrame>) -> usize {
        self.handle().push_frame(frame)
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.handle().clients()
    }

    pub fn client_count(&self) -> usize {
        self.handle().client_count()
    }

    pub fn stats(&self) -> ServerStats {
        self.handle().stats()
    }

    fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.handle().sessions_snapshot()
    }

    /// Address advertised to clients.
    pub fn server_ip(&self) -> &str {
        &self.shared.server_ip
    }

    pub fn connection_url(&self) -> String {
        let port = self
            .local_addr
            .map_or(self.shared.config.port, |a| a.port());
        format!("ws://{}:{}", self.shared.server_ip, port)
    }

    pub fn on_client_connect(&self, f: impl Fn(&ClientInfo) + Send + Sync + 'static) {
        self.shared
            .callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .on_connect = Some(Arc::new(f));
    }

    pub fn on_client_disconnect(&self, f: impl Fn(&ClientInfo) + Send + Sync + 'static) {
        self.shared
            .callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .on_disconnect = Some(Arc::new(f));
    }

    /// Called with the preset name of every client `quality_request`.
    pub fn on_quality_request(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.shared
            .callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .on_quality = Some(Arc::new(f));
    }
}

impl Drop for StreamingServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── ServerHandle ─────────────────────────────────────────────────

/// Broadcast side of a [`StreamingServer`]. Valid whether or not the
/// server is running; frames pushed while stopped reach nobody.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Offer a frame to every open session. Returns how many sessions
    /// queued it; full queues drop it.
    pub fn push_frame(&self, frame: Arc<CompressedFrame>) -> usize {
        self.shared.frames_pushed.fetch_add(1, Ordering::Relaxed);
        let payload = shared_payload(&frame);
        let sessions = self
            .shared
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner());

        let mut queued = 0;
        for session in sessions.values() {
            match session.offer_frame(payload.clone()) {
                Offer::Queued => queued += 1,
                Offer::Dropped => {
                    self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Offer::Closed => {}
            }
        }
        queued
    }

    fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.shared
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut list: Vec<ClientInfo> = self.sessions_snapshot().iter().map(|s| s.info()).collect();
        list.sort_by_key(|c| c.session_id);
        list
    }

    pub fn client_count(&self) -> usize {
        self.shared
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn stats(&self) -> ServerStats {
        let shared = &self.shared;
        let sessions = self.sessions_snapshot();
        let latencies: Vec<f64> = sessions
            .iter()
            .map(|s| s.latency_ms())
            .filter(|l| *l > 0.0)
            .collect();
        let avg_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };
        let pushed = shared.frames_pushed.load(Ordering::Relaxed);

        ServerStats {
            frames_pushed: pushed,
            frames_sent: shared.frames_sent.load(Ordering::Relaxed),
            frames_dropped: shared.frames_dropped.load(Ordering::Relaxed),
            bytes_sent: shared.bytes_sent.load(Ordering::Relaxed),
            connections_accepted: shared.accepted.load(Ordering::Relaxed),
            connections_rejected: shared.rejected.load(Ordering::Relaxed),
            connected_clients: sessions.len(),
            avg_latency_ms,
            bitrate_mbps: shared
                .bandwidth
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .megabits_per_sec(),
            fps: shared
                .push_rate
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .update(pushed),
            uptime_seconds: shared.started.elapsed().as_secs_f64(),
        }
    }
}

/// LAN address of the default route, found by connecting a UDP socket
/// (no packet is sent).
fn detect_local_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|e| {
        debug!(error = %e, "no default route; advertising loopback");
        "127.0.0.1".into()
    })
}

// ── Tasks ────────────────────────────────────────────────────────

async fn accept_loop(listener: std::net::TcpListener, shared: Arc<Shared>, shutdown: CancellationToken) {
    let listener = match TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, "listener registration failed");
            return;
        }
    };
    let permits = Arc::new(Semaphore::new(shared.config.max_clients.max(1)));

    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
            shared.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(%peer, max = shared.config.max_clients, "connection rejected: client limit reached");
            continue;
        };
        if shared.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                debug!(%peer, error = %e, "TCP_NODELAY failed");
            }
        }
        shared.accepted.fetch_add(1, Ordering::Relaxed);
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&shared);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _permit = permit;
            run_session(id, socket, peer, shared, shutdown).await;
        });
    }
    debug!("accept loop stopped");
}

async fn run_session(
    id: u64,
    socket: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let (session, channels) = Session::new(id, peer, shared.config.session_queue_depth, &shutdown);
    let session = Arc::new(session);

    let ws = match tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(socket)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(session = id, %peer, error = %e, "websocket handshake failed");
            session.finish();
            return;
        }
        Err(_) => {
            debug!(session = id, %peer, "websocket handshake timed out");
            session.finish();
            return;
        }
    };
    if let Err(e) = session.mark_open() {
        warn!(session = id, error = %e, "session opened twice");
        return;
    }

    shared.register(Arc::clone(&session));
    info!(session = id, %peer, "client connected");
    session.send_control(&shared.config_message());
    shared.fire_connect(&session.info());

    let (sink, source) = ws.split();
    let writer = tokio::spawn(write_loop(
        sink,
        channels,
        Arc::clone(&session),
        Arc::clone(&shared),
    ));
    read_loop(source, &session, &shared).await;

    session.close();
    if let Err(e) = writer.await {
        debug!(session = id, error = %e, "writer task ended abnormally");
    }
    shared.unregister(id);
}

async fn write_loop(mut sink: WsSink, mut ch: SessionChannels, session: Arc<Session>, shared: Arc<Shared>) {
    let cancel = session.cancel_token().clone();
    loop {
        let (message, frame_len) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(text) = ch.control.recv() => (Message::text(text), None),
            Some(frame) = ch.frames.recv() => {
                let len = frame.len();
                (Message::Binary(frame), Some(len))
            }
            else => break,
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = sink.send(message) => sent,
        };
        match sent {
            Ok(()) => {
                if let Some(len) = frame_len {
                    session.record_sent(len);
                    shared.record_sent(len);
                }
            }
            Err(e) => {
                debug!(session = session.id(), error = %e, "write failed");
                break;
            }
        }
    }
    session.close();
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
}

async fn read_loop(mut source: WsSource, session: &Session, shared: &Shared) {
    let cancel = session.cancel_token().clone();
    let mut ticker = tokio::time::interval(shared.config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if session.idle_for() > shared.config.keepalive_timeout {
                    warn!(session = session.id(), "keepalive timeout");
                    break;
                }
                session.send_control(&ControlMessage::ping_now());
            }
            inbound = source.next() => match inbound {
                Some(Ok(message)) => {
                    session.touch();
                    if !handle_message(message, session, shared) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(session = session.id(), error = %e, "read failed");
                    break;
                }
                None => break,
            },
        }
    }
}

/// React to one inbound message. Returns `false` when the peer closed.
fn handle_message(message: Message, session: &Session, shared: &Shared) -> bool {
    let text = match message {
        Message::Text(text) => text,
        Message::Close(_) => return false,
        _ => return true,
    };
    match ControlMessage::parse(text.as_str()) {
        Some(ControlMessage::Pong { sent_time }) => {
            let ms = session.record_pong(sent_time);
            shared
                .bandwidth
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record_rtt(Duration::from_secs_f64(ms * 2.0 / 1000.0));
        }
        Some(ControlMessage::Ping { sent_time }) => {
            session.send_control(&ControlMessage::Pong { sent_time });
        }
        Some(ControlMessage::QualityRequest { preset }) => {
            info!(session = session.id(), %preset, "client requested preset");
            shared.fire_quality(&preset);
        }
        Some(ControlMessage::Config { .. }) => {}
        None => debug!(session = session.id(), "ignoring unrecognized text message"),
    }
    true
}
