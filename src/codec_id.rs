//! Codec identifiers carried on the wire as big-endian four-CC values.
//!
//! The server announces the codec of each media stream as a `u32` built
//! from the ASCII codec name, left-padded with NUL bytes ("av1" is
//! `0x00617631`). Audio codec id `0` is reserved as an in-band
//! "audio unavailable" marker and is handled by the handshaker, never here.

use std::fmt;

use crate::error::ScryError;

/// Known media codecs, by their wire four-CC value.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    H264 = 0x6832_3634,
    H265 = 0x6832_3635,
    Av1 = 0x0061_7631,
    Opus = 0x6f70_7573,
    Aac = 0x0061_6163,
    Flac = 0x666c_6163,
    Raw = 0x0072_6177,
}

impl TryFrom<u32> for CodecId {
    type Error = ScryError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x6832_3634 => Ok(CodecId::H264),
            0x6832_3635 => Ok(CodecId::H265),
            0x0061_7631 => Ok(CodecId::Av1),
            0x6f70_7573 => Ok(CodecId::Opus),
            0x0061_6163 => Ok(CodecId::Aac),
            0x666c_6163 => Ok(CodecId::Flac),
            0x0072_6177 => Ok(CodecId::Raw),
            other => Err(ScryError::UnknownCodecId(other)),
        }
    }
}

impl CodecId {
    /// The codec name as it appears in server options.
    pub fn as_str(self) -> &'static str {
        match self {
            CodecId::H264 => "h264",
            CodecId::H265 => "h265",
            CodecId::Av1 => "av1",
            CodecId::Opus => "opus",
            CodecId::Aac => "aac",
            CodecId::Flac => "flac",
            CodecId::Raw => "raw",
        }
    }

    /// Whether this codec is valid on the video stream.
    pub fn is_video(self) -> bool {
        matches!(self, CodecId::H264 | CodecId::H265 | CodecId::Av1)
    }

    /// Whether this codec is valid on the audio stream.
    pub fn is_audio(self) -> bool {
        !self.is_video()
    }

    /// The sample rate the server configures its audio encoder with.
    ///
    /// Not carried on the wire; the server always captures at 48 kHz.
    pub fn audio_sample_rate(self) -> Option<u32> {
        if self.is_audio() {
            Some(48_000)
        } else {
            None
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
