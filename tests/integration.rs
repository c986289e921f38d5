//! Integration tests: full session lifecycle against a mock scrcpy
//! server on localhost, covering the handshake, frame delivery,
//! malformed input, clipboard correlation, and graceful shutdown.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use scry_core::{
    CodecFrame, CodecId, DeviceEvent, DeviceTransport, ErrorKind, MediaStreamId, PacketHeader,
    Scid, ScryError, ServerProcess, Session, SessionConfig, SessionSink, SessionState,
    StreamWarning, TerminationReason, Tunnel, DEVICE_NAME_LEN, PACKET_FLAG_CONFIG,
    PACKET_FLAG_KEY_FRAME,
};

// ── Mock transport ───────────────────────────────────────────────

/// Transport whose "device" is a TCP listener on localhost.
struct MockTransport {
    addr: SocketAddr,
    /// Cancelled by tests to simulate the server process dying.
    server_exit: CancellationToken,
}

impl MockTransport {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            server_exit: CancellationToken::new(),
        }
    }
}

struct MockServer {
    kill: CancellationToken,
    exit: CancellationToken,
}

#[async_trait]
impl ServerProcess for MockServer {
    async fn wait(&mut self) -> Result<(), ScryError> {
        tokio::select! {
            _ = self.kill.cancelled() => {}
            _ = self.exit.cancelled() => {}
        }
        Ok(())
    }

    async fn terminate(&mut self) {
        self.kill.cancel();
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    type Server = MockServer;

    async fn push(&self, _local_path: &Path, _remote_path: &str) -> Result<(), ScryError> {
        Ok(())
    }

    async fn spawn_server(
        &self,
        _remote_path: &str,
        args: &[String],
    ) -> Result<MockServer, ScryError> {
        // The version always leads the argv.
        assert_eq!(args[0], "3.3.4");
        assert!(args[1].starts_with("scid="));
        Ok(MockServer {
            kill: CancellationToken::new(),
            exit: self.server_exit.clone(),
        })
    }

    async fn open_tunnel(&self, _port: u16, _forward: bool) -> Result<Tunnel, ScryError> {
        Ok(Tunnel::forward(self.addr))
    }
}

// ── Recording sink ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Frame {
        stream: MediaStreamId,
        pts: Option<u64>,
        config: bool,
        keyframe: bool,
        len: usize,
    },
    Device(DeviceEvent),
    StreamEnd(MediaStreamId),
    Terminated(ErrorKind),
    Warning(String),
}

struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Poll until `pred` holds over the recorded events.
    async fn wait_for(&self, pred: impl Fn(&[Event]) -> bool) {
        timeout(Duration::from_secs(5), async {
            loop {
                if pred(&self.events()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached within 5s");
    }
}

impl SessionSink for RecordingSink {
    fn on_frame(&self, frame: CodecFrame) {
        self.events.lock().unwrap().push(Event::Frame {
            stream: frame.stream,
            pts: frame.pts_us,
            config: frame.flags.config,
            keyframe: frame.flags.keyframe,
            len: frame.payload.len(),
        });
    }

    fn on_device_event(&self, event: DeviceEvent) {
        self.events.lock().unwrap().push(Event::Device(event));
    }

    fn on_stream_end(&self, stream: MediaStreamId) {
        self.events.lock().unwrap().push(Event::StreamEnd(stream));
    }

    fn on_terminated(&self, reason: &TerminationReason) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Terminated(reason.kind));
    }

    fn on_stream_warning(&self, _stream: MediaStreamId, warning: &StreamWarning) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Warning(warning.to_string()));
    }
}

fn frame_events(events: &[Event]) -> Vec<&Event> {
    events
        .iter()
        .filter(|e| matches!(e, Event::Frame { .. }))
        .collect()
}

// ── Helpers ──────────────────────────────────────────────────────

async fn ephemeral_listener() -> (TcpListener, SocketAddr) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn test_config() -> SessionConfig {
    let mut config = SessionConfig::new(Scid::new(0x00c0_ffee).unwrap(), "3.3.4")
        .with_video(false)
        .with_audio(false)
        .with_control(false);
    config.handshake_timeout = Duration::from_secs(2);
    config.shutdown_grace = Duration::from_millis(500);
    config
}

fn video_preamble(name: &str, width: u32, height: u32, codec: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(0x00);
    let bytes = name.as_bytes();
    buf.put_slice(bytes);
    buf.put_bytes(0, DEVICE_NAME_LEN - bytes.len());
    buf.put_u32(width);
    buf.put_u32(height);
    buf.put_u32(codec);
    buf.to_vec()
}

fn media_packet(pts_and_flags: u64, payload: &[u8]) -> Vec<u8> {
    let header = PacketHeader {
        pts_and_flags,
        payload_len: payload.len() as u32,
    };
    let mut out = header.encode().to_vec();
    out.extend_from_slice(payload);
    out
}

/// Keep a mock-server socket open until the test's runtime shuts down.
async fn hold(sock: TcpStream) {
    let _sock = sock;
    tokio::time::sleep(Duration::from_secs(60)).await;
}

// ── S1: handshake happy path ─────────────────────────────────────

#[tokio::test]
async fn handshake_happy_path() {
    let (listener, addr) = ephemeral_listener().await;

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(&video_preamble("Pixel", 1080, 2400, 0x6832_3634))
            .await
            .unwrap();
        hold(sock).await;
    });

    let sink = RecordingSink::new();
    let mut session = Session::new(
        test_config().with_video(true),
        MockTransport::new(addr),
        sink.clone(),
    );

    let meta = session.start().await.unwrap();
    assert_eq!(meta.device_name, "Pixel");
    assert_eq!(meta.video_size, Some((1080, 2400)));
    assert_eq!(meta.video_codec, Some(CodecId::H264));
    assert_eq!(meta.audio_codec, None);
    assert_eq!(session.state(), SessionState::Running);

    session.stop().await;
    assert_eq!(session.state(), SessionState::Closed);
}

// ── S2: video frame delivery ─────────────────────────────────────

#[tokio::test]
async fn video_frame_delivery() {
    let (listener, addr) = ephemeral_listener().await;

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(&video_preamble("Pixel", 1080, 2400, CodecId::H264 as u32))
            .await
            .unwrap();
        let pts_and_flags = PACKET_FLAG_CONFIG | PACKET_FLAG_KEY_FRAME | 12_345;
        sock.write_all(&media_packet(pts_and_flags, &[0xAB; 40]))
            .await
            .unwrap();
        hold(sock).await;
    });

    let sink = RecordingSink::new();
    let mut session = Session::new(
        test_config().with_video(true),
        MockTransport::new(addr),
        sink.clone(),
    );
    session.start().await.unwrap();

    sink.wait_for(|events| !frame_events(events).is_empty()).await;
    let events = sink.events();
    assert_eq!(
        events[0],
        Event::Frame {
            stream: MediaStreamId::Video,
            pts: Some(12_345),
            config: true,
            keyframe: true,
            len: 40,
        }
    );

    session.stop().await;
}

// ── S3: oversize payload rejection ───────────────────────────────

#[tokio::test]
async fn oversize_payload_terminates_session() {
    let (listener, addr) = ephemeral_listener().await;

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(&video_preamble("Pixel", 1080, 2400, CodecId::H264 as u32))
            .await
            .unwrap();
        let header = PacketHeader {
            pts_and_flags: 0,
            payload_len: u32::MAX,
        };
        sock.write_all(&header.encode()).await.unwrap();
        hold(sock).await;
    });

    let sink = RecordingSink::new();
    let mut session = Session::new(
        test_config().with_video(true),
        MockTransport::new(addr),
        sink.clone(),
    );
    session.start().await.unwrap();

    timeout(Duration::from_secs(5), session.wait_closed())
        .await
        .expect("session did not close");

    assert_eq!(session.state(), SessionState::Closed);
    let reason = session.terminated_because().expect("reason must be set");
    assert_eq!(reason.kind, ErrorKind::MalformedFrame);

    sink.wait_for(|events| {
        events
            .iter()
            .any(|e| matches!(e, Event::Terminated(ErrorKind::MalformedFrame)))
    })
    .await;
}

// ── S4: clipboard round trip ─────────────────────────────────────

#[tokio::test]
async fn clipboard_ack_round_trip() {
    let (listener, addr) = ephemeral_listener().await;

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        // Exact SET_CLIPBOARD wire bytes for seq=7, paste=true, "hi".
        let mut buf = [0u8; 16];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(
            buf,
            [
                0x09, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, 0x01, 0x00, 0x00, 0x00,
                0x02, 0x68, 0x69
            ]
        );
        sock.write_all(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07])
            .await
            .unwrap();
        hold(sock).await;
    });

    let sink = RecordingSink::new();
    let mut session = Session::new(
        test_config().with_control(true),
        MockTransport::new(addr),
        sink.clone(),
    );
    session.start().await.unwrap();

    timeout(
        Duration::from_millis(200),
        session.control().unwrap().set_clipboard(7, "hi", true),
    )
    .await
    .expect("ack not received within 200ms")
    .unwrap();

    session.stop().await;
}

// ── S5: unsolicited clipboard ────────────────────────────────────

#[tokio::test]
async fn unsolicited_clipboard_reaches_sink() {
    let (listener, addr) = ephemeral_listener().await;

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(&[0x00, 0x00, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o'])
            .await
            .unwrap();
        hold(sock).await;
    });

    let sink = RecordingSink::new();
    let mut session = Session::new(
        test_config().with_control(true),
        MockTransport::new(addr),
        sink.clone(),
    );
    session.start().await.unwrap();

    sink.wait_for(|events| {
        events.iter().any(|e| {
            matches!(
                e,
                Event::Device(DeviceEvent::Clipboard { text }) if text == "hello"
            )
        })
    })
    .await;

    session.stop().await;
}

// ── S6: graceful shutdown delivers queued frames ─────────────────

/// Sink whose first `on_frame` blocks until released, so frames pile up
/// in the channel while `stop()` is issued.
struct GateSink {
    inner: Arc<RecordingSink>,
    gate: Mutex<bool>,
    cond: Condvar,
}

impl GateSink {
    fn new(inner: Arc<RecordingSink>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn open(&self) {
        *self.gate.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

impl SessionSink for GateSink {
    fn on_frame(&self, frame: CodecFrame) {
        let mut open = self.gate.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
        drop(open);
        self.inner.on_frame(frame);
    }

    fn on_device_event(&self, event: DeviceEvent) {
        self.inner.on_device_event(event);
    }

    fn on_stream_end(&self, stream: MediaStreamId) {
        self.inner.on_stream_end(stream);
    }

    fn on_terminated(&self, reason: &TerminationReason) {
        self.inner.on_terminated(reason);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_shutdown_drains_in_order() {
    let (listener, addr) = ephemeral_listener().await;

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(&video_preamble("Pixel", 1080, 2400, CodecId::H264 as u32))
            .await
            .unwrap();
        sock.write_all(&media_packet(1_000, &[0x01; 8])).await.unwrap();
        sock.write_all(&media_packet(2_000, &[0x02; 8])).await.unwrap();
        hold(sock).await;
    });

    let recording = RecordingSink::new();
    let gate = GateSink::new(recording.clone());
    let mut config = test_config().with_video(true);
    config.shutdown_grace = Duration::from_secs(2);
    let mut session = Session::new(config, MockTransport::new(addr), gate.clone());
    session.start().await.unwrap();

    // Both frames are in flight: one blocked in the sink, one queued.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stop = tokio::spawn(async move {
        session.stop().await;
        session
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.open();

    let session = timeout(Duration::from_secs(2), stop)
        .await
        .expect("stop exceeded the 2s grace")
        .unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(
        session.terminated_because().unwrap().kind,
        ErrorKind::SessionClosed
    );

    let events = recording.events();
    let positions: Vec<usize> = events
        .iter()
        .enumerate()
        .filter_map(|(i, e)| match e {
            Event::Frame { pts, .. } => {
                assert!(matches!(pts, Some(1_000) | Some(2_000)));
                Some(i)
            }
            _ => None,
        })
        .collect();
    assert_eq!(positions.len(), 2, "both queued frames must be delivered");

    let end_pos = events
        .iter()
        .position(|e| matches!(e, Event::StreamEnd(MediaStreamId::Video)))
        .expect("stream end must be signalled");
    assert!(positions.iter().all(|&p| p < end_pos));

    // Nothing after end-of-stream but the terminal callback.
    let terminated = events
        .iter()
        .filter(|e| matches!(e, Event::Terminated(_)))
        .count();
    assert_eq!(terminated, 1);
    assert!(!events[end_pos..]
        .iter()
        .any(|e| matches!(e, Event::Frame { .. })));
}

// ── Audio disabled in-band ───────────────────────────────────────

#[tokio::test]
async fn audio_codec_zero_disables_audio_cleanly() {
    let (listener, addr) = ephemeral_listener().await;

    tokio::spawn(async move {
        let (mut video_sock, _) = listener.accept().await.unwrap();
        video_sock
            .write_all(&video_preamble("Pixel", 1080, 2400, CodecId::H264 as u32))
            .await
            .unwrap();
        let (mut audio_sock, _) = listener.accept().await.unwrap();
        audio_sock.write_all(&0u32.to_be_bytes()).await.unwrap();
        hold(video_sock).await;
    });

    let sink = RecordingSink::new();
    let mut session = Session::new(
        test_config().with_video(true).with_audio(true),
        MockTransport::new(addr),
        sink.clone(),
    );

    let meta = session.start().await.unwrap();
    assert_eq!(meta.audio_codec, None);
    assert_eq!(meta.audio_sample_rate, None);
    assert_eq!(meta.video_codec, Some(CodecId::H264));
    assert_eq!(session.state(), SessionState::Running);

    session.stop().await;
}

// ── Audio survives the handshake ─────────────────────────────────

#[tokio::test]
async fn audio_frames_delivered_alongside_video() {
    let (listener, addr) = ephemeral_listener().await;

    tokio::spawn(async move {
        let (mut video_sock, _) = listener.accept().await.unwrap();
        video_sock
            .write_all(&video_preamble("Pixel", 1080, 2400, CodecId::H264 as u32))
            .await
            .unwrap();
        let (mut audio_sock, _) = listener.accept().await.unwrap();
        audio_sock
            .write_all(&(CodecId::Opus as u32).to_be_bytes())
            .await
            .unwrap();
        audio_sock
            .write_all(&media_packet(PACKET_FLAG_CONFIG, &[0x4F; 19]))
            .await
            .unwrap();
        tokio::join!(hold(video_sock), hold(audio_sock));
    });

    let sink = RecordingSink::new();
    let mut session = Session::new(
        test_config().with_video(true).with_audio(true),
        MockTransport::new(addr),
        sink.clone(),
    );

    let meta = session.start().await.unwrap();
    assert_eq!(meta.audio_codec, Some(CodecId::Opus));
    assert_eq!(meta.audio_sample_rate, Some(48_000));

    sink.wait_for(|events| {
        events.iter().any(|e| {
            matches!(
                e,
                Event::Frame {
                    stream: MediaStreamId::Audio,
                    config: true,
                    pts: None,
                    ..
                }
            )
        })
    })
    .await;

    session.stop().await;
}

// ── Server exit triggers shutdown ────────────────────────────────

#[tokio::test]
async fn server_exit_closes_session() {
    let (listener, addr) = ephemeral_listener().await;

    tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        hold(sock).await;
    });

    let sink = RecordingSink::new();
    let transport = MockTransport::new(addr);
    let server_exit = transport.server_exit.clone();
    let mut session = Session::new(test_config().with_control(true), transport, sink.clone());
    session.start().await.unwrap();

    server_exit.cancel();

    timeout(Duration::from_secs(5), session.wait_closed())
        .await
        .expect("session did not close after server exit");
    assert_eq!(
        session.terminated_because().unwrap().kind,
        ErrorKind::Transport
    );
    // Control calls after shutdown fail with the lifecycle error.
    assert!(matches!(
        session.control(),
        Err(ScryError::SessionClosed)
    ));
}

// ── Handshake failure surfaces to the caller ─────────────────────

#[tokio::test]
async fn bad_dummy_byte_fails_start() {
    let (listener, addr) = ephemeral_listener().await;

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(&[0x55]).await.unwrap();
        hold(sock).await;
    });

    let sink = RecordingSink::new();
    let mut session = Session::new(
        test_config().with_video(true),
        MockTransport::new(addr),
        sink.clone(),
    );

    let err = session.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handshake);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(
        session.terminated_because().unwrap().kind,
        ErrorKind::Handshake
    );
}

// ── PTS regression warning path ──────────────────────────────────

#[tokio::test]
async fn pts_regression_warns_but_keeps_streaming() {
    let (listener, addr) = ephemeral_listener().await;

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(&video_preamble("Pixel", 1080, 2400, CodecId::H264 as u32))
            .await
            .unwrap();
        sock.write_all(&media_packet(5_000, &[1])).await.unwrap();
        sock.write_all(&media_packet(4_000, &[2])).await.unwrap();
        hold(sock).await;
    });

    let sink = RecordingSink::new();
    let mut session = Session::new(
        test_config().with_video(true),
        MockTransport::new(addr),
        sink.clone(),
    );
    session.start().await.unwrap();

    sink.wait_for(|events| frame_events(events).len() == 2).await;
    let events = sink.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Warning(msg) if msg.contains("regression"))));
    // Wire PTS values are preserved.
    assert!(matches!(
        events.iter().filter(|e| matches!(e, Event::Frame { .. })).nth(1),
        Some(Event::Frame { pts: Some(4_000), .. })
    ));
    assert_eq!(session.state(), SessionState::Running);

    session.stop().await;
}
