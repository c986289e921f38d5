//! Per-socket session handshake.
//!
//! After the tunnel streams are open, the server sends a short preamble
//! before the framed traffic starts:
//!
//! - On the **first enabled media socket** (video, or audio when video is
//!   disabled): one dummy byte (`0x00`), then the 64-byte NUL-padded device
//!   name.
//! - On the **video socket**: width (`u32`), height (`u32`), codec id
//!   (`u32`). Width/height may be 0 when the device has not produced a
//!   frame yet.
//! - On the **audio socket**: codec id (`u32`). Codec id 0 is the in-band
//!   "audio unavailable" marker: the socket is closed and audio is disabled
//!   for the session without failing it.
//! - The **control socket** has no preamble.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::codec_id::CodecId;
use crate::error::ScryError;

/// Size of the NUL-padded device name field.
pub const DEVICE_NAME_LEN: usize = 64;

// ── DeviceMeta ───────────────────────────────────────────────────

/// Device metadata published once the mandated sockets have handshaked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMeta {
    pub device_name: String,
    /// Initial video dimensions; `None` until the device produces a frame
    /// (the first config packet carries the real dimensions for the
    /// decoder).
    pub video_size: Option<(u32, u32)>,
    pub video_codec: Option<CodecId>,
    /// `None` when audio is disabled, including the in-band codec-id-0 case.
    pub audio_codec: Option<CodecId>,
    pub audio_sample_rate: Option<u32>,
}

/// Result of the video socket preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoHandshake {
    pub device_name: String,
    pub size: Option<(u32, u32)>,
    pub codec: CodecId,
}

/// Result of the audio socket preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioHandshake {
    /// Present only when the audio socket was the first media socket.
    pub device_name: Option<String>,
    /// `None`: the server reported audio unavailable (codec id 0).
    pub codec: Option<CodecId>,
}

// ── Handshaker ───────────────────────────────────────────────────

/// Reads the per-socket preambles with a bounded deadline per socket.
#[derive(Debug, Clone, Copy)]
pub struct Handshaker {
    deadline: Duration,
}

impl Handshaker {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    /// Handshake the video socket (always the first media socket when
    /// video is enabled).
    pub async fn video<S>(&self, stream: &mut S) -> Result<VideoHandshake, ScryError>
    where
        S: AsyncRead + Unpin,
    {
        timeout(self.deadline, async {
            read_dummy_byte(stream).await?;
            let device_name = read_device_name(stream).await?;
            let width = read_u32(stream).await?;
            let height = read_u32(stream).await?;
            let raw_codec = read_u32(stream).await?;
            let codec = CodecId::try_from(raw_codec)?;
            if !codec.is_video() {
                return Err(ScryError::Handshake(format!(
                    "video socket announced non-video codec {codec}"
                )));
            }
            let size = if width == 0 || height == 0 {
                None
            } else {
                Some((width, height))
            };
            info!(device = %device_name, ?size, %codec, "video handshake complete");
            Ok(VideoHandshake {
                device_name,
                size,
                codec,
            })
        })
        .await
        .map_err(|_| ScryError::Timeout(self.deadline))?
    }

    /// Handshake the audio socket.
    ///
    /// `first_media_socket` is true when video is disabled, in which case
    /// the dummy byte and device name arrive here instead.
    pub async fn audio<S>(
        &self,
        stream: &mut S,
        first_media_socket: bool,
    ) -> Result<AudioHandshake, ScryError>
    where
        S: AsyncRead + Unpin,
    {
        timeout(self.deadline, async {
            let device_name = if first_media_socket {
                read_dummy_byte(stream).await?;
                Some(read_device_name(stream).await?)
            } else {
                None
            };
            let raw_codec = read_u32(stream).await?;
            if raw_codec == 0 {
                info!("server reported audio unavailable, disabling audio");
                return Ok(AudioHandshake {
                    device_name,
                    codec: None,
                });
            }
            let codec = CodecId::try_from(raw_codec)?;
            if !codec.is_audio() {
                return Err(ScryError::Handshake(format!(
                    "audio socket announced non-audio codec {codec}"
                )));
            }
            debug!(%codec, "audio handshake complete");
            Ok(AudioHandshake {
                device_name,
                codec: Some(codec),
            })
        })
        .await
        .map_err(|_| ScryError::Timeout(self.deadline))?
    }
}

async fn read_dummy_byte<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), ScryError> {
    let byte = stream.read_u8().await.map_err(map_handshake_eof)?;
    if byte != 0 {
        return Err(ScryError::Handshake(format!(
            "unexpected dummy byte {byte:#04x}, expected 0x00"
        )));
    }
    Ok(())
}

async fn read_device_name<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, ScryError> {
    let mut raw = [0u8; DEVICE_NAME_LEN];
    stream
        .read_exact(&mut raw)
        .await
        .map_err(map_handshake_eof)?;
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    // Device names come from the device's build properties; tolerate junk.
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

async fn read_u32<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u32, ScryError> {
    stream.read_u32().await.map_err(map_handshake_eof)
}

fn map_handshake_eof(err: std::io::Error) -> ScryError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ScryError::Handshake("short device metadata".to_string())
    } else {
        ScryError::Io(err)
    }
}
