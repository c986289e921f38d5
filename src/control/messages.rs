//! Control protocol message types and their wire codecs.
//!
//! The type-id ↔ codec mapping lives in this module only: the outbound
//! table in [`ControlMessage::encode`]/[`ControlMessage::decode`], the
//! inbound table in [`DeviceMessage::decode`]/[`DeviceMessage::encode`].
//! New message types added by future server versions localize here.
//!
//! Outbound framing is a single `u8` type byte followed by the
//! type-specific body; there is no envelope-level length framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ScryError;
use crate::wire;

// ── Limits ───────────────────────────────────────────────────────

/// Injected text is truncated to this many UTF-8 bytes.
pub const INJECT_TEXT_MAX_LEN: usize = 300;
/// Clipboard text cap, leaving room for the SET_CLIPBOARD envelope.
pub const CLIPBOARD_TEXT_MAX_LEN: usize = (1 << 18) - 14;
/// Upper bound on a single inbound device message.
pub const DEVICE_MSG_MAX_SIZE: usize = 1 << 18;
/// Safety cap on APP_LIST entry counts.
pub const APP_LIST_MAX_ENTRIES: usize = 10_000;

/// Pressure fixed-point scale (0.0..=1.0 maps to 0..=65535).
pub const PRESSURE_SCALE: f32 = 65_536.0;
/// Scroll fixed-point scale (-1.0..=1.0 maps to the i16 range).
pub const SCROLL_SCALE: f32 = 32_768.0;

/// Pointer id for mouse events.
pub const POINTER_ID_MOUSE: i64 = -1;
/// Pointer id for a generic finger.
pub const POINTER_ID_GENERIC_FINGER: i64 = -2;
/// Pointer id for the synthetic second finger of pinch gestures.
pub const POINTER_ID_VIRTUAL_FINGER: i64 = -3;

// ── Input enums ──────────────────────────────────────────────────

/// Android key event actions.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyEventAction {
    Down = 0,
    Up = 1,
    Multiple = 2,
}

impl TryFrom<u8> for KeyEventAction {
    type Error = ScryError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(KeyEventAction::Down),
            1 => Ok(KeyEventAction::Up),
            2 => Ok(KeyEventAction::Multiple),
            other => Err(ScryError::MalformedFrame(format!(
                "unknown key event action {other}"
            ))),
        }
    }
}

/// Android motion event actions.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotionEventAction {
    Down = 0,
    Up = 1,
    Move = 2,
    Cancel = 3,
    Outside = 4,
    PointerDown = 5,
    PointerUp = 6,
    HoverMove = 7,
    Scroll = 8,
    HoverEnter = 9,
    HoverExit = 10,
    ButtonPress = 11,
    ButtonRelease = 12,
}

impl TryFrom<u8> for MotionEventAction {
    type Error = ScryError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MotionEventAction::*;
        match value {
            0 => Ok(Down),
            1 => Ok(Up),
            2 => Ok(Move),
            3 => Ok(Cancel),
            4 => Ok(Outside),
            5 => Ok(PointerDown),
            6 => Ok(PointerUp),
            7 => Ok(HoverMove),
            8 => Ok(Scroll),
            9 => Ok(HoverEnter),
            10 => Ok(HoverExit),
            11 => Ok(ButtonPress),
            12 => Ok(ButtonRelease),
            other => Err(ScryError::MalformedFrame(format!(
                "unknown motion event action {other}"
            ))),
        }
    }
}

/// Clipboard copy-key variants for GET_CLIPBOARD.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CopyKey {
    #[default]
    None = 0,
    Copy = 1,
    Cut = 2,
}

impl TryFrom<u8> for CopyKey {
    type Error = ScryError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CopyKey::None),
            1 => Ok(CopyKey::Copy),
            2 => Ok(CopyKey::Cut),
            other => Err(ScryError::MalformedFrame(format!(
                "unknown copy key {other}"
            ))),
        }
    }
}

/// Android motion event button bits.
pub mod motion_buttons {
    pub const PRIMARY: u32 = 1 << 0;
    pub const SECONDARY: u32 = 1 << 1;
    pub const TERTIARY: u32 = 1 << 2;
    pub const BACK: u32 = 1 << 3;
    pub const FORWARD: u32 = 1 << 4;
    pub const STYLUS_PRIMARY: u32 = 1 << 5;
    pub const STYLUS_SECONDARY: u32 = 1 << 6;
}

/// Android key event meta state bits.
pub mod meta_state {
    pub const ALT_LEFT: u32 = 0x02;
    pub const ALT_RIGHT: u32 = 0x04;
    pub const SHIFT_LEFT: u32 = 0x10;
    pub const SHIFT_RIGHT: u32 = 0x20;
    pub const SYM: u32 = 0x40;
    pub const FUNCTION: u32 = 0x80;
    pub const CAPS_LOCK: u32 = 0x100;
    pub const NUM_LOCK: u32 = 0x200;
    pub const SCROLL_LOCK: u32 = 0x400;
}

/// Encode a 0.0..=1.0 pressure as u16 fixed point.
pub fn pressure_to_u16(pressure: f32) -> u16 {
    let clamped = pressure.clamp(0.0, 1.0);
    ((clamped * PRESSURE_SCALE) as i64).clamp(0, u16::MAX as i64) as u16
}

/// Encode a -1.0..=1.0 scroll amount as i16 fixed point.
pub fn scroll_to_i16(value: f32) -> i16 {
    let clamped = value.clamp(-1.0, 1.0);
    ((clamped * SCROLL_SCALE) as i64).clamp(i16::MIN as i64, i16::MAX as i64) as i16
}

// ── ControlMessageType ───────────────────────────────────────────

/// Wire type ids of client → server control messages.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessageType {
    InjectKeycode = 0,
    InjectText = 1,
    InjectTouchEvent = 2,
    InjectScrollEvent = 3,
    BackOrScreenOn = 4,
    ExpandNotificationPanel = 5,
    ExpandSettingsPanel = 6,
    CollapsePanels = 7,
    GetClipboard = 8,
    SetClipboard = 9,
    SetDisplayPower = 10,
    RotateDevice = 11,
    UhidCreate = 12,
    UhidInput = 13,
    UhidDestroy = 14,
    OpenHardKeyboardSettings = 15,
    StartApp = 16,
    ResetVideo = 17,
}

impl TryFrom<u8> for ControlMessageType {
    type Error = ScryError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ControlMessageType::*;
        match value {
            0 => Ok(InjectKeycode),
            1 => Ok(InjectText),
            2 => Ok(InjectTouchEvent),
            3 => Ok(InjectScrollEvent),
            4 => Ok(BackOrScreenOn),
            5 => Ok(ExpandNotificationPanel),
            6 => Ok(ExpandSettingsPanel),
            7 => Ok(CollapsePanels),
            8 => Ok(GetClipboard),
            9 => Ok(SetClipboard),
            10 => Ok(SetDisplayPower),
            11 => Ok(RotateDevice),
            12 => Ok(UhidCreate),
            13 => Ok(UhidInput),
            14 => Ok(UhidDestroy),
            15 => Ok(OpenHardKeyboardSettings),
            16 => Ok(StartApp),
            17 => Ok(ResetVideo),
            other => Err(ScryError::MalformedFrame(format!(
                "unknown control message type {other}"
            ))),
        }
    }
}

// ── ControlMessage ───────────────────────────────────────────────

/// A client → server control message with its wire-layout fields.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    InjectKeycode {
        action: KeyEventAction,
        keycode: i32,
        repeat: u32,
        metastate: u32,
    },
    InjectText {
        text: String,
    },
    InjectTouchEvent {
        action: MotionEventAction,
        pointer_id: i64,
        x: i32,
        y: i32,
        width: u16,
        height: u16,
        /// Fixed-point pressure; see [`pressure_to_u16`].
        pressure: u16,
        action_button: u32,
        buttons: u32,
    },
    InjectScrollEvent {
        x: i32,
        y: i32,
        width: u16,
        height: u16,
        /// Fixed-point scroll; see [`scroll_to_i16`].
        hscroll: i16,
        vscroll: i16,
        buttons: u32,
    },
    BackOrScreenOn {
        action: KeyEventAction,
    },
    ExpandNotificationPanel,
    ExpandSettingsPanel,
    CollapsePanels,
    GetClipboard {
        copy_key: CopyKey,
    },
    SetClipboard {
        sequence: u64,
        paste: bool,
        text: String,
    },
    SetDisplayPower {
        on: bool,
    },
    RotateDevice,
    UhidCreate {
        id: u16,
        vendor_id: u16,
        product_id: u16,
        name: String,
        report_desc: Bytes,
    },
    UhidInput {
        id: u16,
        data: Bytes,
    },
    UhidDestroy {
        id: u16,
    },
    OpenHardKeyboardSettings,
    StartApp {
        name: String,
    },
    ResetVideo,
}

impl ControlMessage {
    /// A touch event from float pressure.
    #[allow(clippy::too_many_arguments)]
    pub fn touch(
        action: MotionEventAction,
        pointer_id: i64,
        x: i32,
        y: i32,
        width: u16,
        height: u16,
        pressure: f32,
        action_button: u32,
        buttons: u32,
    ) -> Self {
        ControlMessage::InjectTouchEvent {
            action,
            pointer_id,
            x,
            y,
            width,
            height,
            pressure: pressure_to_u16(pressure),
            action_button,
            buttons,
        }
    }

    /// A scroll event from float scroll amounts.
    pub fn scroll(
        x: i32,
        y: i32,
        width: u16,
        height: u16,
        hscroll: f32,
        vscroll: f32,
        buttons: u32,
    ) -> Self {
        ControlMessage::InjectScrollEvent {
            x,
            y,
            width,
            height,
            hscroll: scroll_to_i16(hscroll),
            vscroll: scroll_to_i16(vscroll),
            buttons,
        }
    }

    /// The wire type id of this message.
    pub fn message_type(&self) -> ControlMessageType {
        use ControlMessage::*;
        match self {
            InjectKeycode { .. } => ControlMessageType::InjectKeycode,
            InjectText { .. } => ControlMessageType::InjectText,
            InjectTouchEvent { .. } => ControlMessageType::InjectTouchEvent,
            InjectScrollEvent { .. } => ControlMessageType::InjectScrollEvent,
            BackOrScreenOn { .. } => ControlMessageType::BackOrScreenOn,
            ExpandNotificationPanel => ControlMessageType::ExpandNotificationPanel,
            ExpandSettingsPanel => ControlMessageType::ExpandSettingsPanel,
            CollapsePanels => ControlMessageType::CollapsePanels,
            GetClipboard { .. } => ControlMessageType::GetClipboard,
            SetClipboard { .. } => ControlMessageType::SetClipboard,
            SetDisplayPower { .. } => ControlMessageType::SetDisplayPower,
            RotateDevice => ControlMessageType::RotateDevice,
            UhidCreate { .. } => ControlMessageType::UhidCreate,
            UhidInput { .. } => ControlMessageType::UhidInput,
            UhidDestroy { .. } => ControlMessageType::UhidDestroy,
            OpenHardKeyboardSettings => ControlMessageType::OpenHardKeyboardSettings,
            StartApp { .. } => ControlMessageType::StartApp,
            ResetVideo => ControlMessageType::ResetVideo,
        }
    }

    /// Serialize into `dst`: type byte, then type-specific fields.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.message_type() as u8);
        match self {
            ControlMessage::InjectKeycode {
                action,
                keycode,
                repeat,
                metastate,
            } => {
                dst.put_u8(*action as u8);
                dst.put_i32(*keycode);
                dst.put_u32(*repeat);
                dst.put_u32(*metastate);
            }
            ControlMessage::InjectText { text } => {
                wire::put_len32_string(dst, truncate_utf8(text, INJECT_TEXT_MAX_LEN));
            }
            ControlMessage::InjectTouchEvent {
                action,
                pointer_id,
                x,
                y,
                width,
                height,
                pressure,
                action_button,
                buttons,
            } => {
                dst.put_u8(*action as u8);
                dst.put_i64(*pointer_id);
                dst.put_i32(*x);
                dst.put_i32(*y);
                dst.put_u16(*width);
                dst.put_u16(*height);
                dst.put_u16(*pressure);
                dst.put_u32(*action_button);
                dst.put_u32(*buttons);
            }
            ControlMessage::InjectScrollEvent {
                x,
                y,
                width,
                height,
                hscroll,
                vscroll,
                buttons,
            } => {
                dst.put_i32(*x);
                dst.put_i32(*y);
                dst.put_u16(*width);
                dst.put_u16(*height);
                dst.put_i16(*hscroll);
                dst.put_i16(*vscroll);
                dst.put_u32(*buttons);
            }
            ControlMessage::BackOrScreenOn { action } => {
                dst.put_u8(*action as u8);
            }
            ControlMessage::GetClipboard { copy_key } => {
                dst.put_u8(*copy_key as u8);
            }
            ControlMessage::SetClipboard {
                sequence,
                paste,
                text,
            } => {
                dst.put_u64(*sequence);
                wire::put_bool(dst, *paste);
                wire::put_len32_string(dst, truncate_utf8(text, CLIPBOARD_TEXT_MAX_LEN));
            }
            ControlMessage::SetDisplayPower { on } => {
                wire::put_bool(dst, *on);
            }
            ControlMessage::UhidCreate {
                id,
                vendor_id,
                product_id,
                name,
                report_desc,
            } => {
                dst.put_u16(*id);
                dst.put_u16(*vendor_id);
                dst.put_u16(*product_id);
                wire::put_len16_string(dst, name);
                wire::put_len16_blob(dst, report_desc);
            }
            ControlMessage::UhidInput { id, data } => {
                dst.put_u16(*id);
                wire::put_len16_blob(dst, data);
            }
            ControlMessage::UhidDestroy { id } => {
                dst.put_u16(*id);
            }
            ControlMessage::StartApp { name } => {
                wire::put_len32_string(dst, name);
            }
            ControlMessage::ExpandNotificationPanel
            | ControlMessage::ExpandSettingsPanel
            | ControlMessage::CollapsePanels
            | ControlMessage::RotateDevice
            | ControlMessage::OpenHardKeyboardSettings
            | ControlMessage::ResetVideo => {}
        }
    }

    /// Decode one message from `buf`, advancing past it.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, ScryError> {
        let msg_type = ControlMessageType::try_from(wire::get_u8(buf)?)?;
        let msg = match msg_type {
            ControlMessageType::InjectKeycode => ControlMessage::InjectKeycode {
                action: KeyEventAction::try_from(wire::get_u8(buf)?)?,
                keycode: wire::get_i32(buf)?,
                repeat: wire::get_u32(buf)?,
                metastate: wire::get_u32(buf)?,
            },
            ControlMessageType::InjectText => ControlMessage::InjectText {
                text: wire::get_len32_string(buf, INJECT_TEXT_MAX_LEN)?,
            },
            ControlMessageType::InjectTouchEvent => ControlMessage::InjectTouchEvent {
                action: MotionEventAction::try_from(wire::get_u8(buf)?)?,
                pointer_id: wire::get_i64(buf)?,
                x: wire::get_i32(buf)?,
                y: wire::get_i32(buf)?,
                width: wire::get_u16(buf)?,
                height: wire::get_u16(buf)?,
                pressure: wire::get_u16(buf)?,
                action_button: wire::get_u32(buf)?,
                buttons: wire::get_u32(buf)?,
            },
            ControlMessageType::InjectScrollEvent => ControlMessage::InjectScrollEvent {
                x: wire::get_i32(buf)?,
                y: wire::get_i32(buf)?,
                width: wire::get_u16(buf)?,
                height: wire::get_u16(buf)?,
                hscroll: wire::get_i16(buf)?,
                vscroll: wire::get_i16(buf)?,
                buttons: wire::get_u32(buf)?,
            },
            ControlMessageType::BackOrScreenOn => ControlMessage::BackOrScreenOn {
                action: KeyEventAction::try_from(wire::get_u8(buf)?)?,
            },
            ControlMessageType::ExpandNotificationPanel => {
                ControlMessage::ExpandNotificationPanel
            }
            ControlMessageType::ExpandSettingsPanel => ControlMessage::ExpandSettingsPanel,
            ControlMessageType::CollapsePanels => ControlMessage::CollapsePanels,
            ControlMessageType::GetClipboard => ControlMessage::GetClipboard {
                copy_key: CopyKey::try_from(wire::get_u8(buf)?)?,
            },
            ControlMessageType::SetClipboard => ControlMessage::SetClipboard {
                sequence: wire::get_u64(buf)?,
                paste: wire::get_bool(buf)?,
                text: wire::get_len32_string(buf, CLIPBOARD_TEXT_MAX_LEN)?,
            },
            ControlMessageType::SetDisplayPower => ControlMessage::SetDisplayPower {
                on: wire::get_bool(buf)?,
            },
            ControlMessageType::RotateDevice => ControlMessage::RotateDevice,
            ControlMessageType::UhidCreate => ControlMessage::UhidCreate {
                id: wire::get_u16(buf)?,
                vendor_id: wire::get_u16(buf)?,
                product_id: wire::get_u16(buf)?,
                name: wire::get_len16_string(buf)?,
                report_desc: wire::get_len16_blob(buf)?,
            },
            ControlMessageType::UhidInput => ControlMessage::UhidInput {
                id: wire::get_u16(buf)?,
                data: wire::get_len16_blob(buf)?,
            },
            ControlMessageType::UhidDestroy => ControlMessage::UhidDestroy {
                id: wire::get_u16(buf)?,
            },
            ControlMessageType::OpenHardKeyboardSettings => {
                ControlMessage::OpenHardKeyboardSettings
            }
            ControlMessageType::StartApp => ControlMessage::StartApp {
                name: wire::get_len32_string(buf, CLIPBOARD_TEXT_MAX_LEN)?,
            },
            ControlMessageType::ResetVideo => ControlMessage::ResetVideo,
        };
        Ok(msg)
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ── DeviceMessageType ────────────────────────────────────────────

/// Wire type ids of server → client device messages.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceMessageType {
    Clipboard = 0,
    AckClipboard = 1,
    UhidOutput = 2,
    AppList = 3,
    DisplayPowerState = 4,
}

impl TryFrom<u8> for DeviceMessageType {
    type Error = ScryError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DeviceMessageType::Clipboard),
            1 => Ok(DeviceMessageType::AckClipboard),
            2 => Ok(DeviceMessageType::UhidOutput),
            3 => Ok(DeviceMessageType::AppList),
            4 => Ok(DeviceMessageType::DisplayPowerState),
            other => Err(ScryError::MalformedFrame(format!(
                "unknown device message type {other}"
            ))),
        }
    }
}

// ── DeviceMessage ────────────────────────────────────────────────

/// One entry of an APP_LIST message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEntry {
    pub name: String,
    pub package: String,
    pub system: bool,
}

/// A server → client device message.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Clipboard { text: String },
    AckClipboard { sequence: u64 },
    UhidOutput { id: u16, data: Bytes },
    AppList { entries: Vec<AppEntry> },
    DisplayPowerState { on: bool },
}

impl DeviceMessage {
    /// The wire type id of this message.
    pub fn message_type(&self) -> DeviceMessageType {
        match self {
            DeviceMessage::Clipboard { .. } => DeviceMessageType::Clipboard,
            DeviceMessage::AckClipboard { .. } => DeviceMessageType::AckClipboard,
            DeviceMessage::UhidOutput { .. } => DeviceMessageType::UhidOutput,
            DeviceMessage::AppList { .. } => DeviceMessageType::AppList,
            DeviceMessage::DisplayPowerState { .. } => DeviceMessageType::DisplayPowerState,
        }
    }

    /// Decode one message from `buf`, advancing past it.
    ///
    /// [`ScryError::TruncatedFrame`] means "incomplete, wait for more
    /// bytes"; any other error is a protocol violation that breaks the
    /// channel.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, ScryError> {
        let msg_type = DeviceMessageType::try_from(wire::get_u8(buf)?)?;
        let msg = match msg_type {
            DeviceMessageType::Clipboard => DeviceMessage::Clipboard {
                text: wire::get_len32_string(buf, CLIPBOARD_TEXT_MAX_LEN)?,
            },
            DeviceMessageType::AckClipboard => DeviceMessage::AckClipboard {
                sequence: wire::get_u64(buf)?,
            },
            DeviceMessageType::UhidOutput => DeviceMessage::UhidOutput {
                id: wire::get_u16(buf)?,
                data: wire::get_len16_blob(buf)?,
            },
            DeviceMessageType::AppList => {
                let count = wire::get_u32(buf)? as usize;
                if count > APP_LIST_MAX_ENTRIES {
                    return Err(ScryError::MalformedFrame(format!(
                        "app list claims {count} entries (cap {APP_LIST_MAX_ENTRIES})"
                    )));
                }
                let mut entries = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    entries.push(AppEntry {
                        name: wire::get_len16_string(buf)?,
                        package: wire::get_len16_string(buf)?,
                        system: wire::get_bool(buf)?,
                    });
                }
                DeviceMessage::AppList { entries }
            }
            DeviceMessageType::DisplayPowerState => DeviceMessage::DisplayPowerState {
                on: wire::get_bool(buf)?,
            },
        };
        Ok(msg)
    }

    /// Serialize into `dst`. Mirrors [`decode`](Self::decode); used by the
    /// mock server in tests.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.message_type() as u8);
        match self {
            DeviceMessage::Clipboard { text } => {
                wire::put_len32_string(dst, text);
            }
            DeviceMessage::AckClipboard { sequence } => {
                dst.put_u64(*sequence);
            }
            DeviceMessage::UhidOutput { id, data } => {
                dst.put_u16(*id);
                wire::put_len16_blob(dst, data);
            }
            DeviceMessage::AppList { entries } => {
                dst.put_u32(entries.len() as u32);
                for entry in entries {
                    wire::put_len16_string(dst, &entry.name);
                    wire::put_len16_string(dst, &entry.package);
                    wire::put_bool(dst, entry.system);
                }
            }
            DeviceMessage::DisplayPowerState { on } => {
                wire::put_bool(dst, *on);
            }
        }
    }
}
