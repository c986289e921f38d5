//! Session coordinator.
//!
//! Owns the lifecycle of one mirroring session: deploy → spawn → open
//! sockets → handshake → per-stream workers → `Running`, and the orderly
//! shutdown on caller request, worker failure, or server exit.
//!
//! ## Worker layout
//!
//! One task per socket direction plus the coordinator's supervisor:
//!
//! - video demuxer + video sink pump
//! - audio demuxer + audio sink pump
//! - control writer + control reader
//! - server process watcher
//! - supervisor: waits for the stop signal, grace-joins every worker
//!   (force-aborting after the configured grace period), fails pending
//!   control waiters, marks the session `Closed` and fires
//!   `on_terminated` exactly once.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec_id::CodecId;
use crate::config::SessionConfig;
use crate::control::channel::{run_reader, run_writer, ChannelShared, ControlHandle};
use crate::demux::{frame_queue, Demuxer, FrameQueueSender, MediaStreamId, StreamStats};
use crate::error::{ErrorKind, ScryError, TerminationReason};
use crate::handshake::{DeviceMeta, Handshaker};
use crate::sink::SessionSink;
use crate::transport::{DeviceTransport, ServerProcess, Tunnel};

// ── SessionState ─────────────────────────────────────────────────

/// Lifecycle of a session. Monotonically advancing; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Configured,
    Deployed,
    Handshaking,
    Running,
    Stopping,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Shared coordinator state ─────────────────────────────────────

struct Shared {
    state: Mutex<SessionState>,
    terminated: Mutex<Option<TerminationReason>>,
    cancel: CancellationToken,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn new() -> (Arc<Self>, watch::Receiver<bool>) {
        let (closed_tx, closed_rx) = watch::channel(false);
        (
            Arc::new(Self {
                state: Mutex::new(SessionState::Configured),
                terminated: Mutex::new(None),
                cancel: CancellationToken::new(),
                closed_tx,
            }),
            closed_rx,
        )
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Advance the state machine. Backward or repeated transitions are
    /// rejected.
    fn advance(&self, next: SessionState) -> Result<(), ScryError> {
        let mut state = self.state.lock().unwrap();
        if next <= *state {
            return Err(ScryError::InvalidState(
                "session state may only advance forward",
            ));
        }
        debug!(from = %state, to = %next, "session state");
        *state = next;
        Ok(())
    }

    /// Record the termination reason; the first writer wins.
    fn set_terminated(&self, reason: TerminationReason) -> bool {
        let mut slot = self.terminated.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason);
            true
        } else {
            false
        }
    }

    fn terminated(&self) -> Option<TerminationReason> {
        self.terminated.lock().unwrap().clone()
    }

    fn reason(&self) -> TerminationReason {
        self.terminated()
            .unwrap_or_else(|| TerminationReason::new(ErrorKind::SessionClosed, "session closed"))
    }

    /// Enter `Stopping` (if not already past it), record the reason, and
    /// signal every worker.
    fn begin_stop(&self, reason: TerminationReason) {
        if self.set_terminated(reason.clone()) {
            info!(%reason, "session stopping");
        }
        {
            let mut state = self.state.lock().unwrap();
            if *state < SessionState::Stopping {
                *state = SessionState::Stopping;
            }
        }
        self.cancel.cancel();
    }

    /// Enter `Closed` and wake `stop()`/`wait_closed()` callers.
    /// Returns `false` if the session was already closed.
    fn finish_close(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closed;
        }
        let _ = self.closed_tx.send(true);
        true
    }
}

// ── Session ──────────────────────────────────────────────────────

/// One mirroring session over one device transport.
pub struct Session<T: DeviceTransport> {
    config: SessionConfig,
    transport: T,
    sink: Arc<dyn SessionSink>,
    shared: Arc<Shared>,
    closed_rx: watch::Receiver<bool>,
    control: Option<ControlHandle>,
    device_meta: Option<DeviceMeta>,
    video_stats: Arc<StreamStats>,
    audio_stats: Arc<StreamStats>,
    supervisor: Option<JoinHandle<()>>,
}

struct Established {
    meta: DeviceMeta,
    video: Option<(TcpStream, CodecId)>,
    audio: Option<(TcpStream, CodecId)>,
    control: Option<TcpStream>,
}

impl<T: DeviceTransport> Session<T> {
    pub fn new(config: SessionConfig, transport: T, sink: Arc<dyn SessionSink>) -> Self {
        let (shared, closed_rx) = Shared::new();
        Self {
            config,
            transport,
            sink,
            shared,
            closed_rx,
            control: None,
            device_meta: None,
            video_stats: Arc::new(StreamStats::default()),
            audio_stats: Arc::new(StreamStats::default()),
            supervisor: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Why the session ended. Set exactly once, observable after `Closed`.
    pub fn terminated_because(&self) -> Option<TerminationReason> {
        self.shared.terminated()
    }

    pub fn device_meta(&self) -> Option<&DeviceMeta> {
        self.device_meta.as_ref()
    }

    pub fn video_stats(&self) -> &StreamStats {
        &self.video_stats
    }

    pub fn audio_stats(&self) -> &StreamStats {
        &self.audio_stats
    }

    /// The control handle, gated by session state.
    pub fn control(&self) -> Result<&ControlHandle, ScryError> {
        match self.state() {
            SessionState::Running => self.control.as_ref().ok_or_else(|| {
                ScryError::InvalidConfig("control channel is disabled".to_string())
            }),
            SessionState::Stopping => Err(ScryError::SessionClosing),
            SessionState::Closed => Err(ScryError::SessionClosed),
            _ => Err(ScryError::InvalidState("session is not running")),
        }
    }

    /// Deploy, spawn and handshake, then run the per-stream workers.
    ///
    /// Returns the device metadata once the session is `Running`. Errors
    /// before that are returned to the caller and close the session.
    pub async fn start(&mut self) -> Result<DeviceMeta, ScryError> {
        if self.state() != SessionState::Configured {
            return Err(ScryError::InvalidState("session already started"));
        }
        match self.try_start().await {
            Ok(meta) => Ok(meta),
            Err(err) => {
                let reason = TerminationReason::from_error(&err);
                if self.supervisor.is_some() {
                    // Workers exist; route through the normal shutdown.
                    self.shared.begin_stop(reason);
                    self.wait_closed().await;
                } else {
                    self.shared.set_terminated(reason);
                    if self.shared.finish_close() {
                        self.sink.on_terminated(&self.shared.reason());
                    }
                }
                Err(err)
            }
        }
    }

    async fn try_start(&mut self) -> Result<DeviceMeta, ScryError> {
        let config = &self.config;

        self.transport
            .push(&config.local_server_path, &config.remote_server_path)
            .await?;
        self.shared.advance(SessionState::Deployed)?;

        // The tunnel (and, in reverse mode, its listener) must exist before
        // the server starts connecting back.
        let mut tunnel = self
            .transport
            .open_tunnel(config.tunnel_port, config.tunnel_forward)
            .await?;

        let mut args = vec![config.server_version.clone()];
        args.extend(config.server_args());
        let mut server = self
            .transport
            .spawn_server(&config.remote_server_path, &args)
            .await?;

        self.shared.advance(SessionState::Handshaking)?;

        let established = match self.establish(&mut tunnel).await {
            Ok(established) => established,
            Err(err) => {
                server.terminate().await;
                return Err(err);
            }
        };
        let meta = established.meta.clone();
        self.device_meta = Some(meta.clone());

        self.launch_workers(established, server);

        match self.shared.advance(SessionState::Running) {
            Ok(()) => {}
            // A worker failed between spawn and here; shutdown is running.
            Err(_) => return Err(ScryError::SessionClosing),
        }
        info!(device = %meta.device_name, "session running");
        Ok(meta)
    }

    /// Open the mandated sockets in protocol order and run their
    /// handshakes.
    async fn establish(&self, tunnel: &mut Tunnel) -> Result<Established, ScryError> {
        let config = &self.config;
        let handshaker = Handshaker::new(config.handshake_timeout);
        let mut meta = DeviceMeta {
            device_name: String::new(),
            video_size: None,
            video_codec: None,
            audio_codec: None,
            audio_sample_rate: None,
        };

        let mut video = None;
        if config.video {
            let mut sock = self.next_stream(tunnel).await?;
            let hs = handshaker.video(&mut sock).await?;
            meta.device_name = hs.device_name;
            meta.video_size = hs.size;
            meta.video_codec = Some(hs.codec);
            video = Some((sock, hs.codec));
        }

        let mut audio = None;
        if config.audio {
            let mut sock = self.next_stream(tunnel).await?;
            let hs = handshaker.audio(&mut sock, !config.video).await?;
            if let Some(name) = hs.device_name {
                meta.device_name = name;
            }
            match hs.codec {
                Some(codec) => {
                    meta.audio_codec = Some(codec);
                    meta.audio_sample_rate = codec.audio_sample_rate();
                    audio = Some((sock, codec));
                }
                // In-band "audio unavailable": close the socket, keep going.
                None => drop(sock),
            }
        }

        let control = if config.control {
            Some(self.next_stream(tunnel).await?)
        } else {
            None
        };

        Ok(Established {
            meta,
            video,
            audio,
            control,
        })
    }

    async fn next_stream(&self, tunnel: &mut Tunnel) -> Result<TcpStream, ScryError> {
        timeout(self.config.handshake_timeout, tunnel.next_stream())
            .await
            .map_err(|_| ScryError::Timeout(self.config.handshake_timeout))?
    }

    /// Move each socket into its worker and start the supervisor.
    fn launch_workers(&mut self, established: Established, server: T::Server) {
        let mut workers: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        if let Some((sock, codec)) = established.video {
            let (demux, pump) = self.spawn_media(
                MediaStreamId::Video,
                codec,
                sock,
                self.config.video_queue_capacity,
                Arc::clone(&self.video_stats),
            );
            workers.push(("video-demux", demux));
            workers.push(("video-pump", pump));
        }

        if let Some((sock, codec)) = established.audio {
            let (demux, pump) = self.spawn_media(
                MediaStreamId::Audio,
                codec,
                sock,
                self.config.audio_queue_capacity,
                Arc::clone(&self.audio_stats),
            );
            workers.push(("audio-demux", demux));
            workers.push(("audio-pump", pump));
        }

        let control_shared = if let Some(sock) = established.control {
            let (shared, writer, reader) = self.spawn_control(sock);
            workers.push(("control-writer", writer));
            workers.push(("control-reader", reader));
            Some(shared)
        } else {
            None
        };

        workers.push(("server-watch", self.spawn_server_watch(server)));

        self.spawn_supervisor(workers, control_shared);
    }

    fn spawn_media(
        &self,
        stream_id: MediaStreamId,
        codec: CodecId,
        sock: TcpStream,
        capacity: usize,
        stats: Arc<StreamStats>,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let (queue_tx, mut queue_rx) = frame_queue(capacity);
        let demuxer = Demuxer::new(
            stream_id,
            codec,
            sock,
            queue_tx.clone(),
            Arc::clone(&self.sink),
            self.config.max_packet_size,
            Arc::clone(&stats),
        );

        let shared = Arc::clone(&self.shared);
        let cancel = self.shared.cancel.clone();
        let demux_task = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Ok(()),
                result = demuxer.run() => result,
            };
            // Close in every exit path so the pump observes end-of-stream.
            queue_tx.close();
            record_drops(&stats, &queue_tx);
            match result {
                Ok(()) => {}
                Err(ScryError::ChannelClosed) => {}
                Err(err) => {
                    error!(stream = %stream_id, error = %err, "media stream failed");
                    shared.begin_stop(TerminationReason::from_error(&err));
                }
            }
        });

        let sink = Arc::clone(&self.sink);
        let pump_task = tokio::spawn(async move {
            while let Some(frame) = queue_rx.pop().await {
                sink.on_frame(frame);
            }
            sink.on_stream_end(stream_id);
        });

        (demux_task, pump_task)
    }

    fn spawn_control(
        &mut self,
        sock: TcpStream,
    ) -> (Arc<ChannelShared>, JoinHandle<()>, JoinHandle<()>) {
        let (read_half, write_half) = sock.into_split();
        let (tx, rx) = mpsc::channel(self.config.control_queue_capacity.max(1));
        let channel_shared = Arc::new(ChannelShared::default());
        self.control = Some(ControlHandle::new(tx, Arc::clone(&channel_shared)));

        let shared = Arc::clone(&self.shared);
        let cancel = self.shared.cancel.clone();
        let writer_task = tokio::spawn(async move {
            if let Err(err) = run_writer(rx, write_half, cancel).await {
                error!(error = %err, "control writer failed");
                shared.begin_stop(TerminationReason::from_error(&err));
            }
        });

        let shared = Arc::clone(&self.shared);
        let cancel = self.shared.cancel.clone();
        let ctrl = Arc::clone(&channel_shared);
        let sink = Arc::clone(&self.sink);
        let reader_task = tokio::spawn(async move {
            match run_reader(read_half, Arc::clone(&ctrl), sink).await {
                Ok(()) => {
                    // EOF is the expected end during shutdown; otherwise the
                    // server dropped an essential channel.
                    if !cancel.is_cancelled() {
                        shared.begin_stop(TerminationReason::new(
                            ErrorKind::Transport,
                            "control socket closed by server",
                        ));
                    }
                }
                Err(err) => {
                    error!(error = %err, "control reader failed");
                    ctrl.mark_broken();
                    shared.begin_stop(TerminationReason::from_error(&err));
                }
            }
        });

        (channel_shared, writer_task, reader_task)
    }

    fn spawn_server_watch(&self, mut server: T::Server) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let cancel = self.shared.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    server.terminate().await;
                }
                _ = server.wait() => {
                    shared.begin_stop(TerminationReason::new(
                        ErrorKind::Transport,
                        "server process exited",
                    ));
                }
            }
        })
    }

    fn spawn_supervisor(
        &mut self,
        workers: Vec<(&'static str, JoinHandle<()>)>,
        control_shared: Option<Arc<ChannelShared>>,
    ) {
        let shared = Arc::clone(&self.shared);
        let sink = Arc::clone(&self.sink);
        let grace = self.config.shutdown_grace;
        self.supervisor = Some(tokio::spawn(async move {
            shared.cancel.cancelled().await;

            // Reject new control calls while draining.
            if let Some(ctrl) = &control_shared {
                ctrl.mark_closing();
            }

            for (name, mut handle) in workers {
                match timeout(grace, &mut handle).await {
                    Ok(_) => debug!(worker = name, "worker finished"),
                    Err(_) => {
                        warn!(worker = name, "worker exceeded grace period, aborting");
                        handle.abort();
                        let _ = handle.await;
                    }
                }
            }

            // Pending control waiters complete with SessionClosed.
            if let Some(ctrl) = &control_shared {
                ctrl.mark_closed();
            }

            let reason = shared.reason();
            if shared.finish_close() {
                info!(%reason, "session closed");
                sink.on_terminated(&reason);
            }
        }));
    }

    /// Request an orderly shutdown and wait for `Closed`.
    ///
    /// Frames already queued are still delivered, in per-stream order,
    /// before each stream's end-of-stream signal. Safe to call from any
    /// state; repeated calls are no-ops.
    pub async fn stop(&mut self) {
        if self.state() == SessionState::Closed {
            return;
        }
        let reason = TerminationReason::new(ErrorKind::SessionClosed, "stopped by caller");
        if self.supervisor.is_none() {
            // Never reached the worker phase; close in place.
            self.shared.set_terminated(reason);
            if self.shared.finish_close() {
                self.sink.on_terminated(&self.shared.reason());
            }
            return;
        }
        self.shared.begin_stop(reason);
        self.wait_closed().await;
    }

    /// Wait until the session reaches `Closed`.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

fn record_drops(stats: &StreamStats, queue: &FrameQueueSender) {
    stats
        .dropped
        .store(queue.dropped(), std::sync::atomic::Ordering::Relaxed);
}

impl<T: DeviceTransport> Drop for Session<T> {
    fn drop(&mut self) {
        if self.supervisor.is_some() && self.state() < SessionState::Stopping {
            self.shared.begin_stop(TerminationReason::new(
                ErrorKind::SessionClosed,
                "session dropped",
            ));
        }
    }
}
