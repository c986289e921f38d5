//! Caller-facing capability interface for consuming session output.
//!
//! Sinks run on the worker task that produced the callback; a sink doing
//! long work must offload it itself (e.g. into its own channel).

use std::fmt;

use bytes::Bytes;

use crate::control::messages::AppEntry;
use crate::demux::{CodecFrame, MediaStreamId};
use crate::error::TerminationReason;

// ── DeviceEvent ──────────────────────────────────────────────────

/// Events originated by the device, delivered outside any waiter.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The user copied text on the device while no `get_clipboard` was
    /// outstanding.
    Clipboard { text: String },
    /// Output report from an emulated UHID device.
    UhidOutput { id: u16, data: Bytes },
    /// List of installed applications.
    AppList { entries: Vec<AppEntry> },
    /// The display power state changed.
    DisplayPowerState { on: bool },
}

// ── StreamWarning ────────────────────────────────────────────────

/// Non-fatal per-stream anomalies surfaced to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamWarning {
    /// The wire PTS went backwards; the frame was forwarded unchanged.
    PtsRegression { previous_us: u64, current_us: u64 },
    /// A config packet arrived without codec setup data and was skipped.
    EmptyConfigPacket,
}

impl fmt::Display for StreamWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamWarning::PtsRegression {
                previous_us,
                current_us,
            } => write!(f, "pts regression: {previous_us}us -> {current_us}us"),
            StreamWarning::EmptyConfigPacket => f.write_str("empty config packet"),
        }
    }
}

// ── SessionSink ──────────────────────────────────────────────────

/// Consumer of decoded frames and device events.
pub trait SessionSink: Send + Sync {
    /// One compressed media frame, in wire order within its stream.
    fn on_frame(&self, frame: CodecFrame);

    /// A device-originated event from the control channel.
    fn on_device_event(&self, event: DeviceEvent);

    /// No more frames will be delivered for this stream.
    fn on_stream_end(&self, stream: MediaStreamId);

    /// The session reached `Closed`; fires exactly once.
    fn on_terminated(&self, reason: &TerminationReason);

    /// A non-fatal frame-level anomaly. Default: ignore.
    fn on_stream_warning(&self, _stream: MediaStreamId, _warning: &StreamWarning) {}
}

/// Sink that discards everything. Useful for sessions driven purely
/// through the control channel.
pub struct NullSink;

impl SessionSink for NullSink {
    fn on_frame(&self, _frame: CodecFrame) {}
    fn on_device_event(&self, _event: DeviceEvent) {}
    fn on_stream_end(&self, _stream: MediaStreamId) {}
    fn on_terminated(&self, _reason: &TerminationReason) {}
}
