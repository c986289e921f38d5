//! Bidirectional control channel.
//!
//! The control socket is split into two background tasks:
//!
//! - **Writer**: drains a bounded FIFO queue and writes encoded
//!   [`ControlMessage`]s. A full queue blocks the caller; control messages
//!   are never silently dropped.
//! - **Reader**: parses the inbound [`DeviceMessage`] stream and routes
//!   each message: clipboard acks to their registered waiter by sequence,
//!   clipboard texts to the oldest pending `get_clipboard` (FIFO) or to
//!   the event sink when none is outstanding, everything else to the sink.
//!
//! Any inbound parse error breaks the channel: all pending waiters
//! complete with [`ScryError::ChannelBroken`] and the session tears down.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::control::messages::{
    ControlMessage, CopyKey, DeviceMessage, KeyEventAction, DEVICE_MSG_MAX_SIZE,
};
use crate::error::ScryError;
use crate::sink::{DeviceEvent, SessionSink};

// ── Shared channel state ─────────────────────────────────────────

const LIFECYCLE_OPEN: u8 = 0;
const LIFECYCLE_CLOSING: u8 = 1;
const LIFECYCLE_CLOSED: u8 = 2;

/// Pending request/reply waiters.
#[derive(Default)]
struct Waiters {
    /// SET_CLIPBOARD acks, keyed by caller-chosen sequence.
    acks: HashMap<u64, oneshot::Sender<()>>,
    /// GET_CLIPBOARD replies, correlated FIFO.
    gets: VecDeque<oneshot::Sender<String>>,
}

/// The only cross-task shared mutable structure of a session: the
/// pending-waiter table, behind a single mutex with constant-time
/// critical sections.
#[derive(Default)]
pub(crate) struct ChannelShared {
    waiters: Mutex<Waiters>,
    lifecycle: AtomicU8,
    broken: AtomicBool,
}

impl ChannelShared {
    fn gate(&self) -> Result<(), ScryError> {
        if self.broken.load(Ordering::Acquire) {
            return Err(ScryError::ChannelBroken);
        }
        match self.lifecycle.load(Ordering::Acquire) {
            LIFECYCLE_OPEN => Ok(()),
            LIFECYCLE_CLOSING => Err(ScryError::SessionClosing),
            _ => Err(ScryError::SessionClosed),
        }
    }

    pub(crate) fn mark_closing(&self) {
        let _ = self.lifecycle.compare_exchange(
            LIFECYCLE_OPEN,
            LIFECYCLE_CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn mark_closed(&self) {
        self.lifecycle.store(LIFECYCLE_CLOSED, Ordering::Release);
        self.fail_all_waiters();
    }

    pub(crate) fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
        self.fail_all_waiters();
    }

    /// Drop all pending waiter senders; the receivers observe the failure
    /// and map it to `ChannelBroken` or `SessionClosed`.
    fn fail_all_waiters(&self) {
        let dropped = {
            let mut waiters = self.waiters.lock().unwrap();
            let acks: Vec<_> = waiters.acks.drain().collect();
            let gets: Vec<_> = waiters.gets.drain(..).collect();
            (acks, gets)
        };
        if !dropped.0.is_empty() || !dropped.1.is_empty() {
            debug!(
                acks = dropped.0.len(),
                gets = dropped.1.len(),
                "failing pending control waiters"
            );
        }
    }

    fn waiter_error(&self) -> ScryError {
        if self.broken.load(Ordering::Acquire) {
            ScryError::ChannelBroken
        } else {
            ScryError::SessionClosed
        }
    }
}

// ── ControlHandle ────────────────────────────────────────────────

/// Caller-facing handle over the control channel. Cheaply cloneable.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlMessage>,
    shared: Arc<ChannelShared>,
}

impl ControlHandle {
    pub(crate) fn new(tx: mpsc::Sender<ControlMessage>, shared: Arc<ChannelShared>) -> Self {
        Self { tx, shared }
    }

    /// Enqueue a message for the writer task. Callers observe submission
    /// order; a full queue blocks.
    pub async fn send(&self, msg: ControlMessage) -> Result<(), ScryError> {
        self.shared.gate()?;
        self.tx
            .send(msg)
            .await
            .map_err(|_| ScryError::ChannelClosed)
    }

    /// Set the device clipboard and wait for the matching ACK.
    ///
    /// `sequence` is caller-chosen; the waiter completes when the device
    /// acknowledges that sequence, or fails with `ChannelBroken` /
    /// `SessionClosed` when the channel dies first.
    pub async fn set_clipboard(
        &self,
        sequence: u64,
        text: impl Into<String>,
        paste: bool,
    ) -> Result<(), ScryError> {
        self.shared.gate()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        if let Some(stale) = self
            .shared
            .waiters
            .lock()
            .unwrap()
            .acks
            .insert(sequence, ack_tx)
        {
            warn!(sequence, "replacing stale clipboard ack waiter");
            drop(stale);
        }
        if self
            .tx
            .send(ControlMessage::SetClipboard {
                sequence,
                paste,
                text: text.into(),
            })
            .await
            .is_err()
        {
            self.shared.waiters.lock().unwrap().acks.remove(&sequence);
            return Err(ScryError::ChannelClosed);
        }
        ack_rx.await.map_err(|_| self.shared.waiter_error())
    }

    /// Request the device clipboard and wait for the next CLIPBOARD reply.
    ///
    /// Replies are correlated FIFO: the oldest outstanding get wins.
    pub async fn get_clipboard(&self, copy_key: CopyKey) -> Result<String, ScryError> {
        self.shared.gate()?;
        let (text_tx, text_rx) = oneshot::channel();
        self.shared.waiters.lock().unwrap().gets.push_back(text_tx);
        self.send(ControlMessage::GetClipboard { copy_key }).await?;
        text_rx.await.map_err(|_| self.shared.waiter_error())
    }

    // ── Fire-and-forget conveniences ──────────────────────────────

    pub async fn inject_keycode(
        &self,
        action: KeyEventAction,
        keycode: i32,
        repeat: u32,
        metastate: u32,
    ) -> Result<(), ScryError> {
        self.send(ControlMessage::InjectKeycode {
            action,
            keycode,
            repeat,
            metastate,
        })
        .await
    }

    pub async fn inject_text(&self, text: impl Into<String>) -> Result<(), ScryError> {
        self.send(ControlMessage::InjectText { text: text.into() }).await
    }

    pub async fn back_or_screen_on(&self, action: KeyEventAction) -> Result<(), ScryError> {
        self.send(ControlMessage::BackOrScreenOn { action }).await
    }

    pub async fn set_display_power(&self, on: bool) -> Result<(), ScryError> {
        self.send(ControlMessage::SetDisplayPower { on }).await
    }

    /// Sent as specified; some devices silently ignore it. Absence of an
    /// error does not imply the device acted on it.
    pub async fn rotate_device(&self) -> Result<(), ScryError> {
        self.send(ControlMessage::RotateDevice).await
    }

    /// Sent as specified; some devices silently ignore it.
    pub async fn start_app(&self, name: impl Into<String>) -> Result<(), ScryError> {
        self.send(ControlMessage::StartApp { name: name.into() }).await
    }

    pub async fn reset_video(&self) -> Result<(), ScryError> {
        self.send(ControlMessage::ResetVideo).await
    }
}

// ── Worker loops ─────────────────────────────────────────────────

/// Single writer task: total order over outbound messages.
///
/// On stop it flushes messages that were already queued, then shuts the
/// socket down for writes so the server (and our reader) see EOF.
pub(crate) async fn run_writer<W>(
    mut rx: mpsc::Receiver<ControlMessage>,
    mut writer: W,
    cancel: CancellationToken,
) -> Result<(), ScryError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            maybe = rx.recv() => match maybe {
                Some(msg) => {
                    buf.clear();
                    msg.encode(&mut buf);
                    trace!(msg_type = ?msg.message_type(), len = buf.len(), "control write");
                    writer.write_all(&buf).await?;
                }
                None => break,
            }
        }
    }
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        buf.clear();
        msg.encode(&mut buf);
        writer.write_all(&buf).await?;
    }
    let _ = writer.shutdown().await;
    debug!("control writer finished");
    Ok(())
}

/// Single reader task: parses device messages in wire order.
pub(crate) async fn run_reader<R>(
    mut reader: R,
    shared: Arc<ChannelShared>,
    sink: Arc<dyn SessionSink>,
) -> Result<(), ScryError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        // Drain every complete message currently buffered.
        while !buf.is_empty() {
            let mut view = &buf[..];
            match DeviceMessage::decode(&mut view) {
                Ok(msg) => {
                    let consumed = buf.len() - view.len();
                    buf.advance(consumed);
                    route_message(msg, &shared, sink.as_ref());
                }
                Err(ScryError::TruncatedFrame { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        if buf.len() >= DEVICE_MSG_MAX_SIZE {
            return Err(ScryError::MalformedFrame(format!(
                "device message exceeds {DEVICE_MSG_MAX_SIZE} bytes"
            )));
        }
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                debug!("control reader saw clean EOF");
                return Ok(());
            }
            return Err(ScryError::TruncatedFrame {
                needed: buf.len() + 1,
                available: buf.len(),
            });
        }
    }
}

fn route_message(msg: DeviceMessage, shared: &ChannelShared, sink: &dyn SessionSink) {
    match msg {
        DeviceMessage::AckClipboard { sequence } => {
            match shared.waiters.lock().unwrap().acks.remove(&sequence) {
                Some(waiter) => {
                    let _ = waiter.send(());
                }
                None => warn!(sequence, "clipboard ack with no matching waiter"),
            }
        }
        DeviceMessage::Clipboard { text } => {
            let waiter = shared.waiters.lock().unwrap().gets.pop_front();
            match waiter {
                Some(tx) => {
                    let _ = tx.send(text);
                }
                // Unsolicited: the user copied something on the device.
                None => sink.on_device_event(DeviceEvent::Clipboard { text }),
            }
        }
        DeviceMessage::UhidOutput { id, data } => {
            sink.on_device_event(DeviceEvent::UhidOutput { id, data });
        }
        DeviceMessage::AppList { entries } => {
            sink.on_device_event(DeviceEvent::AppList { entries });
        }
        DeviceMessage::DisplayPowerState { on } => {
            sink.on_device_event(DeviceEvent::DisplayPowerState { on });
        }
    }
}
