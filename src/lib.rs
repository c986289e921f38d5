//! # scry-core: protocol core for a scrcpy-compatible mirroring client
//!
//! Negotiates the multiplexed byte streams of a scrcpy server session,
//! demultiplexes the video/audio packet streams into typed compressed
//! frames, and drives the bidirectional control channel. Codec decoding,
//! rendering, playback and the device CLI all live above this crate;
//! frames and device events are delivered through a caller-provided
//! [`SessionSink`].
//!
//! ## Architecture
//!
//! ```text
//! DEVICE (scrcpy server)                  HOST (this crate)
//! ┌──────────────────────┐               ┌───────────────────────────┐
//! │ encoder → video sock ─┼── tunnel ────► Demuxer ──► FrameQueue ──►│ sink.on_frame
//! │ encoder → audio sock ─┼── (tcp) ─────► Demuxer ──► FrameQueue ──►│ sink.on_frame
//! │ controller ◄─────────┼───────────────  control writer           │
//! │            ─────────►┼───────────────► control reader ─────────►│ sink.on_device_event
//! └──────────────────────┘               │        Session            │
//!                                        └───────────────────────────┘
//! ```
//!
//! The [`Session`] coordinator owns the lifecycle: it deploys the server
//! through a [`DeviceTransport`], runs the per-socket handshakes, moves
//! each socket into its worker task, and tears everything down in bounded
//! time on the first failure.

pub mod codec_id;
pub mod config;
pub mod control;
pub mod demux;
pub mod error;
pub mod handshake;
pub mod session;
pub mod sink;
pub mod transport;
pub mod wire;

pub use codec_id::CodecId;
pub use config::{AudioCodec, LogLevel, Scid, SessionConfig, VideoCodec};
pub use control::{
    AppEntry, ControlHandle, ControlMessage, ControlMessageType, CopyKey, DeviceMessage,
    DeviceMessageType, KeyEventAction, MotionEventAction,
};
pub use demux::{
    frame_queue, CodecFrame, Demuxer, FrameFlags, FrameQueueReceiver, FrameQueueSender,
    MediaStreamId, PacketHeader, StreamStats, PACKET_FLAG_CONFIG, PACKET_FLAG_KEY_FRAME,
    PACKET_PTS_MASK,
};
pub use error::{ErrorKind, ScryError, TerminationReason};
pub use handshake::{DeviceMeta, Handshaker, DEVICE_NAME_LEN};
pub use session::{Session, SessionState};
pub use sink::{DeviceEvent, NullSink, SessionSink, StreamWarning};
pub use transport::{AdbServer, AdbTransport, DeviceTransport, ServerProcess, Tunnel};
