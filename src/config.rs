//! Session configuration and server option building.
//!
//! A [`SessionConfig`] is immutable once the session starts. The
//! [`SessionConfig::server_args`] method renders the option list the server
//! process parses from its argv, after the leading version argument.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ScryError;

// ── Scid ─────────────────────────────────────────────────────────

/// Session identifier: a 31-bit non-negative integer.
///
/// On the wire (server argv and tunnel socket name) it is rendered as
/// exactly eight lowercase hex digits; any other encoding is rejected by
/// the device side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scid(u32);

impl Scid {
    pub const MAX: u32 = 0x7fff_ffff;

    pub fn new(value: u32) -> Result<Self, ScryError> {
        if value > Self::MAX {
            return Err(ScryError::InvalidConfig(format!(
                "scid must fit in 31 bits (0..=0x7fffffff), got {value:#x}"
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Parse the 8-hex-digit wire form back into an scid.
    pub fn parse(s: &str) -> Result<Self, ScryError> {
        if s.len() != 8 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(ScryError::InvalidConfig(format!(
                "scid wire form must be 8 lowercase hex digits, got {s:?}"
            )));
        }
        let value = u32::from_str_radix(s, 16)
            .map_err(|e| ScryError::InvalidConfig(format!("scid parse: {e}")))?;
        Self::new(value)
    }
}

impl fmt::Display for Scid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

// ── Option enums ─────────────────────────────────────────────────

/// Server log level names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Verbose,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Verbose => "verbose",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Video codec requested from the server encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
    Av1,
}

impl VideoCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Av1 => "av1",
        }
    }
}

/// Audio codec requested from the server encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioCodec {
    #[default]
    Opus,
    Aac,
    Flac,
    Raw,
}

impl AudioCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioCodec::Opus => "opus",
            AudioCodec::Aac => "aac",
            AudioCodec::Flac => "flac",
            AudioCodec::Raw => "raw",
        }
    }
}

// ── SessionConfig ────────────────────────────────────────────────

/// Immutable per-session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session identifier, rendered as 8 lowercase hex digits on the wire.
    pub scid: Scid,
    /// Must be byte-identical to the version baked into the server binary.
    pub server_version: String,
    pub log_level: LogLevel,
    pub video: bool,
    pub audio: bool,
    pub control: bool,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    /// Longest video dimension in px; 0 means unbounded.
    pub max_size: u32,
    /// Video bitrate in bps; 0 keeps the server default.
    pub video_bit_rate: u32,
    /// Frame rate cap; 0 keeps the server default.
    pub max_fps: u32,
    /// `true`: host connects to the device (adb forward).
    /// `false`: device connects to the host (adb reverse, the default).
    pub tunnel_forward: bool,

    /// Local path of the server binary pushed to the device.
    pub local_server_path: PathBuf,
    /// Remote path the server binary is pushed to and spawned from.
    pub remote_server_path: String,
    /// TCP port of the forwarded tunnel.
    pub tunnel_port: u16,

    /// Capacity of the bounded per-stream frame channels.
    pub video_queue_capacity: usize,
    pub audio_queue_capacity: usize,
    /// Capacity of the outbound control queue; full queue blocks, never drops.
    pub control_queue_capacity: usize,
    /// Media payloads above this cap terminate the stream as malformed.
    pub max_packet_size: usize,
    /// Deadline for each socket handshake step.
    pub handshake_timeout: Duration,
    /// Per-worker grace period before shutdown force-aborts it.
    pub shutdown_grace: Duration,
}

impl SessionConfig {
    pub fn new(scid: Scid, server_version: impl Into<String>) -> Self {
        Self {
            scid,
            server_version: server_version.into(),
            log_level: LogLevel::default(),
            video: true,
            audio: true,
            control: true,
            video_codec: VideoCodec::default(),
            audio_codec: AudioCodec::default(),
            max_size: 0,
            video_bit_rate: 0,
            max_fps: 0,
            tunnel_forward: false,
            local_server_path: PathBuf::from("scrcpy-server"),
            remote_server_path: "/data/local/tmp/scrcpy-server".to_string(),
            tunnel_port: 27183,
            video_queue_capacity: 30,
            audio_queue_capacity: 30,
            control_queue_capacity: 64,
            max_packet_size: 16 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    pub fn with_video(mut self, enabled: bool) -> Self {
        self.video = enabled;
        self
    }

    pub fn with_audio(mut self, enabled: bool) -> Self {
        self.audio = enabled;
        self
    }

    pub fn with_control(mut self, enabled: bool) -> Self {
        self.control = enabled;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_video_codec(mut self, codec: VideoCodec) -> Self {
        self.video_codec = codec;
        self
    }

    pub fn with_audio_codec(mut self, codec: AudioCodec) -> Self {
        self.audio_codec = codec;
        self
    }

    pub fn with_max_size(mut self, px: u32) -> Self {
        self.max_size = px;
        self
    }

    pub fn with_video_bit_rate(mut self, bps: u32) -> Self {
        self.video_bit_rate = bps;
        self
    }

    pub fn with_max_fps(mut self, fps: u32) -> Self {
        self.max_fps = fps;
        self
    }

    pub fn with_tunnel_forward(mut self, forward: bool) -> Self {
        self.tunnel_forward = forward;
        self
    }

    pub fn with_tunnel_port(mut self, port: u16) -> Self {
        self.tunnel_port = port;
        self
    }

    /// The abstract socket name the adb tunnel binds on the device side.
    pub fn tunnel_socket_name(&self) -> String {
        format!("scrcpy_{}", self.scid)
    }

    /// Render the server option list (everything after the version argument).
    ///
    /// All values are ASCII; booleans are the lowercase words `true`/`false`;
    /// `scid` is zero-padded radix-16.
    pub fn server_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("scid={}", self.scid),
            format!("log_level={}", self.log_level.as_str()),
            format!("video={}", self.video),
            format!("audio={}", self.audio),
            format!("control={}", self.control),
            format!("video_codec={}", self.video_codec.as_str()),
            format!("audio_codec={}", self.audio_codec.as_str()),
        ];
        if self.max_size != 0 {
            args.push(format!("max_size={}", self.max_size));
        }
        if self.video_bit_rate != 0 {
            args.push(format!("video_bit_rate={}", self.video_bit_rate));
        }
        if self.max_fps != 0 {
            args.push(format!("max_fps={}", self.max_fps));
        }
        if self.tunnel_forward {
            args.push("tunnel_forward=true".to_string());
        }
        args
    }
}
