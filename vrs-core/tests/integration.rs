//! Integration tests: real WebSocket and HTTP clients against the
//! broadcast server, and the whole pipeline over loopback.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_test::{assert_err, assert_ok};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use vrs_core::{
    CompressedFrame, ControlMessage, PipelineConfig, ServerConfig, StreamingServer,
    SyntheticBackend, VrStreamer,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP: Duration = Duration::from_secs(5);

// ── Helpers ──────────────────────────────────────────────────────

fn local_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        static_ip: Some("127.0.0.1".into()),
        worker_threads: 2,
        ..ServerConfig::default()
    }
}

fn start_server(config: ServerConfig) -> StreamingServer {
    let mut server = StreamingServer::new(config);
    server.start().unwrap();
    server
}

async fn connect(server: &StreamingServer) -> Client {
    let addr = server.local_addr().unwrap();
    let (ws, _) = tokio::time::timeout(STEP, connect_async(format!("ws://{addr}")))
        .await
        .expect("connect timed out")
        .expect("handshake failed");
    ws
}

/// Next JSON control message, skipping frames.
async fn next_control(ws: &mut Client) -> ControlMessage {
    loop {
        let msg = tokio::time::timeout(STEP, ws.next())
            .await
            .expect("timed out waiting for control message")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            if let Some(control) = ControlMessage::parse(text.as_str()) {
                return control;
            }
        }
    }
}

/// Next binary frame, skipping control messages.
async fn next_frame(ws: &mut Client) -> Bytes {
    loop {
        let msg = tokio::time::timeout(STEP, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Binary(data) = msg {
            return data;
        }
    }
}

fn frame(len: usize, fill: u8) -> Arc<CompressedFrame> {
    let mut f = CompressedFrame::with_capacity(len);
    f.data.resize(len, fill);
    Arc::new(f)
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + STEP;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Raw HTTP/1.1 GET; returns the whole response as text.
async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(STEP, stream.read_to_end(&mut response))
        .await
        .expect("http response timed out")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("vrs-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

// ── Session lifecycle ────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_config_greeting_then_frames() {
    let server = start_server(local_config());
    server.set_stream_info(1920, 1080, true);

    let mut ws = connect(&server).await;
    match next_control(&mut ws).await {
        ControlMessage::Config {
            server_ip,
            width,
            height,
            stereo,
            server_time,
        } => {
            assert_eq!(server_ip, "127.0.0.1");
            assert_eq!((width, height, stereo), (1920, 1080, true));
            assert!(server_time > 0.0);
        }
        other => panic!("expected config, got {other:?}"),
    }

    assert_eq!(server.push_frame(frame(32, 7)), 1);
    let data = next_frame(&mut ws).await;
    assert_eq!(data.len(), 32);
    assert!(data.iter().all(|b| *b == 7));

    assert!(wait_until(|| server.stats().frames_sent == 1).await);
    let clients = server.clients();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].frames_sent, 1);
    assert_eq!(clients[0].bytes_sent, 32);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stalled_client_does_not_hold_back_others() {
    let server = start_server(ServerConfig {
        session_queue_depth: 2,
        ..local_config()
    });

    let mut healthy = connect(&server).await;
    next_control(&mut healthy).await;
    let mut stalled = connect(&server).await;
    next_control(&mut stalled).await;
    assert!(wait_until(|| server.client_count() == 2).await);

    const FRAMES: usize = 30;
    let reader = tokio::spawn(async move {
        let mut received = 0;
        while received < FRAMES {
            next_frame(&mut healthy).await;
            received += 1;
        }
        received
    });

    // Large frames fill the stalled peer's socket buffers quickly.
    for i in 0..FRAMES {
        server.push_frame(frame(2 * 1024 * 1024, i as u8));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let received = tokio::time::timeout(Duration::from_secs(20), reader)
        .await
        .expect("healthy client starved")
        .unwrap();
    assert_eq!(received, FRAMES);
    assert!(server.stats().frames_dropped > 0);
    drop(stalled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_limit_rejects_extra_connections() {
    let server = start_server(ServerConfig {
        max_clients: 1,
        ..local_config()
    });
    let mut first = connect(&server).await;
    next_control(&mut first).await;

    let addr = server.local_addr().unwrap();
    let second = tokio::time::timeout(STEP, connect_async(format!("ws://{addr}")))
        .await
        .expect("rejection timed out");
    assert_err!(second, "second client must be refused");
    assert!(wait_until(|| server.stats().connections_rejected == 1).await);
    assert_eq!(server.client_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_fires_once_and_frees_slot() {
    let server = start_server(ServerConfig {
        max_clients: 1,
        ..local_config()
    });
    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    {
        let connects = Arc::clone(&connects);
        server.on_client_connect(move |_| {
            connects.fetch_add(1, Ordering::SeqCst);
        });
        let disconnects = Arc::clone(&disconnects);
        server.on_client_disconnect(move |_| {
            disconnects.fetch_add(1, Ordering::SeqCst);
        });
    }

    let mut ws = connect(&server).await;
    next_control(&mut ws).await;
    ws.close(None).await.unwrap();
    drop(ws);
    assert!(wait_until(|| server.client_count() == 0).await);
    assert!(wait_until(|| disconnects.load(Ordering::SeqCst) == 1).await);

    // The permit came back.
    let mut again = connect(&server).await;
    next_control(&mut again).await;
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

// ── Control messages ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_pong_and_quality_requests() {
    let server = start_server(ServerConfig {
        ping_interval: Duration::from_millis(100),
        ..local_config()
    });
    let requests = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let requests = Arc::clone(&requests);
        server.on_quality_request(move |preset| requests.lock().unwrap().push(preset.to_string()));
    }

    let mut ws = connect(&server).await;
    next_control(&mut ws).await;

    // Server ping, echoed back.
    let sent_time = loop {
        if let ControlMessage::Ping { sent_time } = next_control(&mut ws).await {
            break sent_time;
        }
    };
    assert_ok!(
        ws.send(Message::text(ControlMessage::Pong { sent_time }.to_json()))
            .await
    );

    // Client ping, echoed by the server.
    assert_ok!(ws.send(Message::text(r#"{"type":"ping","sent_time":42.5}"#)).await);
    let echoed = loop {
        if let ControlMessage::Pong { sent_time } = next_control(&mut ws).await {
            break sent_time;
        }
    };
    assert_eq!(echoed, 42.5);

    assert_ok!(
        ws.send(Message::text(r#"{"type":"quality_request","preset":"balanced"}"#))
            .await
    );
    assert_ok!(ws.send(Message::text("definitely not json")).await);
    assert!(wait_until(|| requests.lock().unwrap().len() == 1).await);
    assert_eq!(requests.lock().unwrap()[0], "balanced");

    // Garbage did not end the session.
    assert_eq!(server.client_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_client_times_out() {
    let server = start_server(ServerConfig {
        ping_interval: Duration::from_millis(50),
        keepalive_timeout: Duration::from_millis(200),
        ..local_config()
    });
    let mut ws = connect(&server).await;
    next_control(&mut ws).await;
    assert!(wait_until(|| server.client_count() == 1).await);
    // Never answer pings.
    assert!(wait_until(|| server.client_count() == 0).await);
}

// ── Static files ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_http_serves_viewer_files() {
    let root = scratch_dir("web");
    std::fs::write(root.join("index.html"), "<html>viewer</html>").unwrap();
    std::fs::create_dir_all(root.join("js")).unwrap();
    std::fs::write(root.join("js").join("app.js"), "let x = 1;").unwrap();

    let mut server = start_server(local_config());
    let addr = assert_ok!(server.start_http(&root, 0));

    let index = http_get(addr, "/").await;
    assert!(index.starts_with("HTTP/1.1 200"), "{index}");
    assert!(index.to_ascii_lowercase().contains("content-type: text/html"));
    assert!(index.to_ascii_lowercase().contains("cache-control: no-cache"));
    assert!(index.ends_with("<html>viewer</html>"));

    let script = http_get(addr, "/js/app.js").await;
    assert!(script.starts_with("HTTP/1.1 200"));
    assert!(script.contains("application/javascript"));

    assert!(http_get(addr, "/missing.css").await.starts_with("HTTP/1.1 404"));
    assert!(http_get(addr, "/js").await.starts_with("HTTP/1.1 404"));
    assert!(http_get(addr, "/../secret.txt").await.starts_with("HTTP/1.1 403"));

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
}

// ── Full pipeline ────────────────────────────────────────────────

#[test]
fn test_pipeline_streams_jpeg_to_viewer() {
    let mut cfg = PipelineConfig::default();
    cfg.network.host = "127.0.0.1".into();
    cfg.network.port = 0;
    cfg.network.http_port = 0;
    cfg.network.static_ip = Some("127.0.0.1".into());
    cfg.buffers.raw_buffer_bytes = 640 * 480 * 4;
    cfg.buffers.compressed_buffer_bytes = 256 * 1024;

    let backend = SyntheticBackend::new(640, 480).with_frame_rate(60);
    let mut streamer = VrStreamer::new(cfg, Box::new(backend)).unwrap();
    streamer.init().unwrap();
    streamer.start().unwrap();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let mut ws = connect(streamer.server()).await;
        match next_control(&mut ws).await {
            ControlMessage::Config {
                width,
                height,
                stereo,
                ..
            } => {
                assert!(stereo);
                assert_eq!((width, height), (320, 240));
            }
            other => panic!("expected config, got {other:?}"),
        }

        let jpeg = next_frame(&mut ws).await;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);

        ws.send(Message::text(r#"{"type":"quality_request","preset":"quality"}"#))
            .await
            .unwrap();
        let shared = Arc::clone(streamer.shared_config());
        assert!(wait_until(|| shared.quality() == 80).await);
        ws.close(None).await.unwrap();
    });

    let stats = streamer.stats();
    assert!(stats.frames_encoded > 0);
    assert!(stats.frames_sent > 0);
    assert_eq!(stats.jpeg_backend, "simd");
    streamer.stop();
    assert!(!streamer.is_streaming());
}
