//! Media stream demultiplexer.
//!
//! After the handshake, a media socket carries an unbounded sequence of
//! packet frames:
//!
//! ```text
//! pts_and_flags:  u64  (8)   bit 63 = CONFIG, bit 62 = KEYFRAME,
//!                            low 62 bits = PTS in microseconds
//! payload_len:    u32  (4)
//! payload:        [u8] (payload_len)
//! ```
//!
//! The demuxer reconstructs [`CodecFrame`]s and pushes them into a bounded
//! [`frame_queue`]. On overflow the queue drops the oldest frame that is
//! neither a config packet nor a keyframe; if only undroppable frames are
//! queued, a droppable newcomer is discarded and an undroppable newcomer
//! blocks the producer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::codec_id::CodecId;
use crate::error::ScryError;
use crate::sink::{SessionSink, StreamWarning};

// ── Packet header ────────────────────────────────────────────────

/// CONFIG flag: the payload is codec setup data (SPS/PPS, Opus ID header).
pub const PACKET_FLAG_CONFIG: u64 = 1 << 63;
/// KEYFRAME flag: decoding can resume from this packet.
pub const PACKET_FLAG_KEY_FRAME: u64 = 1 << 62;
/// Mask selecting the 62-bit PTS.
pub const PACKET_PTS_MASK: u64 = PACKET_FLAG_KEY_FRAME - 1;

/// Identifies one of the two media streams of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaStreamId {
    Video,
    Audio,
}

impl fmt::Display for MediaStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaStreamId::Video => f.write_str("video"),
            MediaStreamId::Audio => f.write_str("audio"),
        }
    }
}

/// The fixed 12-byte meta header preceding every media payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub pts_and_flags: u64,
    pub payload_len: u32,
}

impl PacketHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 12;

    /// Serialize to bytes (big-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.pts_and_flags.to_be_bytes());
        buf[8..12].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Deserialize from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ScryError> {
        if data.len() < Self::SIZE {
            return Err(ScryError::TruncatedFrame {
                needed: Self::SIZE,
                available: data.len(),
            });
        }
        Ok(Self {
            pts_and_flags: u64::from_be_bytes(data[0..8].try_into().unwrap()),
            payload_len: u32::from_be_bytes(data[8..12].try_into().unwrap()),
        })
    }

    pub fn is_config(&self) -> bool {
        self.pts_and_flags & PACKET_FLAG_CONFIG != 0
    }

    pub fn is_key_frame(&self) -> bool {
        self.pts_and_flags & PACKET_FLAG_KEY_FRAME != 0
    }

    /// The raw 62-bit PTS in microseconds.
    pub fn pts(&self) -> u64 {
        self.pts_and_flags & PACKET_PTS_MASK
    }
}

// ── CodecFrame ───────────────────────────────────────────────────

/// Flags carried by a media packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags {
    pub config: bool,
    pub keyframe: bool,
}

/// A typed, timestamped compressed frame, ready for a pluggable decoder.
#[derive(Debug, Clone)]
pub struct CodecFrame {
    pub stream: MediaStreamId,
    pub codec: CodecId,
    /// Presentation timestamp in microseconds. `None` for config packets
    /// whose PTS field is zero.
    pub pts_us: Option<u64>,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl CodecFrame {
    /// Config packets and keyframes are never dropped under back-pressure.
    pub fn is_droppable(&self) -> bool {
        !self.flags.config && !self.flags.keyframe
    }
}

// ── StreamStats ──────────────────────────────────────────────────

/// Per-stream counters, shared between the worker and the session.
#[derive(Debug, Default)]
pub struct StreamStats {
    pub frames: AtomicU64,
    pub bytes: AtomicU64,
    pub dropped: AtomicU64,
    pub warnings: AtomicU64,
}

impl StreamStats {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }
}

// ── FrameQueue ───────────────────────────────────────────────────

struct QueueState {
    frames: VecDeque<CodecFrame>,
    closed: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
    dropped: AtomicU64,
}

/// Create a bounded single-producer frame channel with the media
/// back-pressure policy.
pub fn frame_queue(capacity: usize) -> (FrameQueueSender, FrameQueueReceiver) {
    let shared = Arc::new(QueueShared {
        state: Mutex::new(QueueState {
            frames: VecDeque::with_capacity(capacity),
            closed: false,
        }),
        capacity: capacity.max(1),
        readable: Notify::new(),
        writable: Notify::new(),
        dropped: AtomicU64::new(0),
    });
    (
        FrameQueueSender {
            shared: Arc::clone(&shared),
        },
        FrameQueueReceiver { shared },
    )
}

/// Producer half of the frame channel.
#[derive(Clone)]
pub struct FrameQueueSender {
    shared: Arc<QueueShared>,
}

impl FrameQueueSender {
    /// Enqueue a frame, applying the drop-oldest-droppable policy.
    ///
    /// Blocks only when the queue is full of config/keyframe packets and
    /// the incoming frame is itself undroppable (protocol stall).
    pub async fn push(&self, frame: CodecFrame) -> Result<(), ScryError> {
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.closed {
                    return Err(ScryError::ChannelClosed);
                }
                if state.frames.len() < self.shared.capacity {
                    state.frames.push_back(frame);
                    drop(state);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
                if let Some(pos) = state.frames.iter().position(CodecFrame::is_droppable) {
                    let _ = state.frames.remove(pos);
                    state.frames.push_back(frame);
                    drop(state);
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
                // Full of undroppable frames.
                if frame.is_droppable() {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            }
            self.shared.writable.notified().await;
        }
    }

    /// Mark the stream finished; the receiver drains remaining frames and
    /// then observes end-of-stream.
    pub fn close(&self) {
        self.shared.state.lock().unwrap().closed = true;
        self.shared.readable.notify_one();
    }

    /// Frames discarded under back-pressure so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer half of the frame channel.
pub struct FrameQueueReceiver {
    shared: Arc<QueueShared>,
}

impl FrameQueueReceiver {
    /// Dequeue the next frame; `None` signals end-of-stream after the last
    /// queued frame was delivered.
    pub async fn pop(&mut self) -> Option<CodecFrame> {
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(frame) = state.frames.pop_front() {
                    drop(state);
                    self.shared.writable.notify_one();
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.readable.notified().await;
        }
    }
}

// ── Demuxer ──────────────────────────────────────────────────────

/// Reads packet frames from one media socket and feeds the frame queue.
pub struct Demuxer<R> {
    stream: MediaStreamId,
    codec: CodecId,
    reader: R,
    queue: FrameQueueSender,
    sink: Arc<dyn SessionSink>,
    max_payload: usize,
    stats: Arc<StreamStats>,
    last_pts: Option<u64>,
}

impl<R> Demuxer<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        stream: MediaStreamId,
        codec: CodecId,
        reader: R,
        queue: FrameQueueSender,
        sink: Arc<dyn SessionSink>,
        max_payload: usize,
        stats: Arc<StreamStats>,
    ) -> Self {
        Self {
            stream,
            codec,
            reader,
            queue,
            sink,
            max_payload,
            stats,
            last_pts: None,
        }
    }

    /// Run until clean end-of-stream (`Ok`) or a fatal stream error.
    pub async fn run(mut self) -> Result<(), ScryError> {
        debug!(stream = %self.stream, codec = %self.codec, "demuxer started");
        loop {
            let mut header_bytes = [0u8; PacketHeader::SIZE];
            if !read_exact_or_eof(&mut self.reader, &mut header_bytes).await? {
                debug!(stream = %self.stream, "clean end-of-stream");
                return Ok(());
            }
            let header = PacketHeader::decode(&header_bytes)?;

            let payload_len = header.payload_len as usize;
            if payload_len > self.max_payload {
                return Err(ScryError::PayloadTooLarge {
                    size: payload_len,
                    cap: self.max_payload,
                });
            }

            let mut payload = vec![0u8; payload_len];
            self.reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| map_frame_eof(e, payload_len))?;

            self.stats.frames.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes
                .fetch_add((PacketHeader::SIZE + payload_len) as u64, Ordering::Relaxed);

            if let Some(frame) = self.frame_from_packet(header, payload.into()) {
                trace!(
                    stream = %self.stream,
                    pts = ?frame.pts_us,
                    config = frame.flags.config,
                    keyframe = frame.flags.keyframe,
                    len = frame.payload.len(),
                    "frame",
                );
                self.queue.push(frame).await?;
            }
        }
    }

    /// Turn a decoded packet into a frame, or skip it with a warning.
    fn frame_from_packet(&mut self, header: PacketHeader, payload: Bytes) -> Option<CodecFrame> {
        let flags = FrameFlags {
            config: header.is_config(),
            keyframe: header.is_key_frame(),
        };

        // A config packet with no setup data cannot initialise a decoder.
        // That is a frame-level defect, not a stream-fatal one.
        if flags.config && payload.is_empty() {
            self.warn(StreamWarning::EmptyConfigPacket);
            return None;
        }

        let raw_pts = header.pts();
        let pts_us = if flags.config && raw_pts == 0 {
            None
        } else {
            Some(raw_pts)
        };

        if !flags.config {
            if let (Some(prev), Some(pts)) = (self.last_pts, pts_us) {
                if pts < prev {
                    // Preserve the wire value; downstream decoders decide.
                    self.warn(StreamWarning::PtsRegression {
                        previous_us: prev,
                        current_us: pts,
                    });
                }
            }
            self.last_pts = pts_us.or(self.last_pts);
        }

        Some(CodecFrame {
            stream: self.stream,
            codec: self.codec,
            pts_us,
            flags,
            payload,
        })
    }

    fn warn(&self, warning: StreamWarning) {
        warn!(stream = %self.stream, %warning, "stream anomaly");
        self.stats.warnings.fetch_add(1, Ordering::Relaxed);
        self.sink.on_stream_warning(self.stream, &warning);
    }
}

/// Read exactly `buf.len()` bytes. `Ok(false)` on EOF before the first
/// byte (a clean frame boundary); [`ScryError::TruncatedFrame`] on EOF
/// after a partial read.
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<bool, ScryError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(ScryError::TruncatedFrame {
                needed: buf.len(),
                available: filled,
            });
        }
        filled += n;
    }
    Ok(true)
}

fn map_frame_eof(err: std::io::Error, needed: usize) -> ScryError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ScryError::TruncatedFrame {
            needed,
            available: 0,
        }
    } else {
        ScryError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullSink;
    use tokio::io::AsyncWriteExt;

    fn frame(pts: Option<u64>, config: bool, keyframe: bool) -> CodecFrame {
        CodecFrame {
            stream: MediaStreamId::Video,
            codec: CodecId::H264,
            pts_us: pts,
            flags: FrameFlags { config, keyframe },
            payload: Bytes::from_static(&[0u8; 4]),
        }
    }

    fn packet(pts_and_flags: u64, payload: &[u8]) -> Vec<u8> {
        let header = PacketHeader {
            pts_and_flags,
            payload_len: payload.len() as u32,
        };
        let mut out = header.encode().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn demuxer<R: AsyncRead + Unpin>(
        reader: R,
        queue: FrameQueueSender,
    ) -> Demuxer<R> {
        Demuxer::new(
            MediaStreamId::Video,
            CodecId::H264,
            reader,
            queue,
            Arc::new(NullSink),
            16 * 1024 * 1024,
            Arc::new(StreamStats::default()),
        )
    }

    #[test]
    fn header_roundtrip() {
        let header = PacketHeader {
            pts_and_flags: PACKET_FLAG_CONFIG | PACKET_FLAG_KEY_FRAME | 12_345,
            payload_len: 40,
        };
        let decoded = PacketHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_config());
        assert!(decoded.is_key_frame());
        assert_eq!(decoded.pts(), 12_345);
    }

    #[test]
    fn header_flags_independent() {
        let key_only = PacketHeader {
            pts_and_flags: PACKET_FLAG_KEY_FRAME | 99,
            payload_len: 0,
        };
        assert!(!key_only.is_config());
        assert!(key_only.is_key_frame());

        let config_only = PacketHeader {
            pts_and_flags: PACKET_FLAG_CONFIG,
            payload_len: 0,
        };
        assert!(config_only.is_config());
        assert!(!config_only.is_key_frame());
        assert_eq!(config_only.pts(), 0);
    }

    #[tokio::test]
    async fn demux_single_packet() {
        let (tx, mut rx) = frame_queue(8);
        let (mut server, client) = tokio::io::duplex(4096);

        let pts_and_flags = PACKET_FLAG_CONFIG | PACKET_FLAG_KEY_FRAME | 12_345;
        server
            .write_all(&packet(pts_and_flags, &[0xAA; 40]))
            .await
            .unwrap();
        drop(server);

        let queue = tx.clone();
        demuxer(client, tx).run().await.unwrap();
        queue.close();

        let frame = rx.pop().await.unwrap();
        assert_eq!(frame.pts_us, Some(12_345));
        assert!(frame.flags.config);
        assert!(frame.flags.keyframe);
        assert_eq!(frame.payload.len(), 40);
        assert!(rx.pop().await.is_none());
    }

    #[tokio::test]
    async fn config_packet_with_zero_pts_has_no_timestamp() {
        let (tx, mut rx) = frame_queue(8);
        let (mut server, client) = tokio::io::duplex(4096);

        server
            .write_all(&packet(PACKET_FLAG_CONFIG, &[1, 2, 3]))
            .await
            .unwrap();
        drop(server);

        let queue = tx.clone();
        demuxer(client, tx).run().await.unwrap();
        queue.close();
        let frame = rx.pop().await.unwrap();
        assert_eq!(frame.pts_us, None);
        assert!(frame.flags.config);
    }

    #[tokio::test]
    async fn oversize_payload_is_malformed() {
        let (tx, _rx) = frame_queue(8);
        let (mut server, client) = tokio::io::duplex(4096);

        let header = PacketHeader {
            pts_and_flags: 0,
            payload_len: u32::MAX,
        };
        server.write_all(&header.encode()).await.unwrap();

        let err = demuxer(client, tx).run().await.unwrap_err();
        assert!(matches!(err, ScryError::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_truncated() {
        let (tx, _rx) = frame_queue(8);
        let (mut server, client) = tokio::io::duplex(4096);

        let header = PacketHeader {
            pts_and_flags: 100,
            payload_len: 64,
        };
        server.write_all(&header.encode()).await.unwrap();
        server.write_all(&[0u8; 10]).await.unwrap();
        drop(server);

        let err = demuxer(client, tx).run().await.unwrap_err();
        assert!(matches!(err, ScryError::TruncatedFrame { .. }));
    }

    #[tokio::test]
    async fn eof_mid_header_is_truncated() {
        let (tx, _rx) = frame_queue(8);
        let (mut server, client) = tokio::io::duplex(4096);

        server.write_all(&[0u8; 5]).await.unwrap();
        drop(server);

        let err = demuxer(client, tx).run().await.unwrap_err();
        assert!(matches!(
            err,
            ScryError::TruncatedFrame {
                needed: 12,
                available: 5
            }
        ));
    }

    #[tokio::test]
    async fn pts_regression_is_forwarded_with_warning() {
        let (tx, mut rx) = frame_queue(8);
        let (mut server, client) = tokio::io::duplex(4096);

        server.write_all(&packet(2_000, b"a")).await.unwrap();
        server.write_all(&packet(1_000, b"b")).await.unwrap();
        drop(server);

        let stats = Arc::new(StreamStats::default());
        let demux = Demuxer::new(
            MediaStreamId::Video,
            CodecId::H264,
            client,
            tx,
            Arc::new(NullSink),
            16 * 1024 * 1024,
            Arc::clone(&stats),
        );
        demux.run().await.unwrap();

        // Both frames arrive, wire PTS values preserved.
        assert_eq!(rx.pop().await.unwrap().pts_us, Some(2_000));
        assert_eq!(rx.pop().await.unwrap().pts_us, Some(1_000));
        assert_eq!(stats.warnings(), 1);
    }

    #[tokio::test]
    async fn queue_drops_oldest_droppable() {
        let (tx, mut rx) = frame_queue(2);
        tx.push(frame(Some(1), false, false)).await.unwrap();
        tx.push(frame(Some(2), false, true)).await.unwrap();
        // Full. Oldest droppable (pts 1) is evicted.
        tx.push(frame(Some(3), false, false)).await.unwrap();

        assert_eq!(tx.dropped(), 1);
        assert_eq!(rx.pop().await.unwrap().pts_us, Some(2));
        assert_eq!(rx.pop().await.unwrap().pts_us, Some(3));
    }

    #[tokio::test]
    async fn queue_discards_droppable_newcomer_when_full_of_keyframes() {
        let (tx, mut rx) = frame_queue(2);
        tx.push(frame(Some(1), true, false)).await.unwrap();
        tx.push(frame(Some(2), false, true)).await.unwrap();
        // Queue holds only undroppables; the droppable newcomer is discarded.
        tx.push(frame(Some(3), false, false)).await.unwrap();

        assert_eq!(tx.dropped(), 1);
        assert_eq!(rx.pop().await.unwrap().pts_us, Some(1));
        assert_eq!(rx.pop().await.unwrap().pts_us, Some(2));
    }

    #[tokio::test]
    async fn queue_blocks_undroppable_until_space() {
        let (tx, mut rx) = frame_queue(1);
        tx.push(frame(Some(1), true, false)).await.unwrap();

        let tx2 = tx.clone();
        let pusher = tokio::spawn(async move {
            // Blocks until the consumer makes room.
            tx2.push(frame(Some(2), false, true)).await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!pusher.is_finished());

        assert_eq!(rx.pop().await.unwrap().pts_us, Some(1));
        pusher.await.unwrap();
        assert_eq!(rx.pop().await.unwrap().pts_us, Some(2));
        assert_eq!(tx.dropped(), 0);
    }

    #[tokio::test]
    async fn closed_queue_drains_then_ends() {
        let (tx, mut rx) = frame_queue(4);
        tx.push(frame(Some(1), false, false)).await.unwrap();
        tx.push(frame(Some(2), false, false)).await.unwrap();
        tx.close();

        assert_eq!(rx.pop().await.unwrap().pts_us, Some(1));
        assert_eq!(rx.pop().await.unwrap().pts_us, Some(2));
        assert!(rx.pop().await.is_none());
        assert!(matches!(
            tx.push(frame(Some(3), false, false)).await,
            Err(ScryError::ChannelClosed)
        ));
    }
}
