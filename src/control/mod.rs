//! Control channel: outbound control messages, inbound device messages,
//! and the per-session channel workers.

pub mod channel;
pub mod messages;

pub use channel::ControlHandle;
pub use messages::{
    AppEntry, ControlMessage, ControlMessageType, CopyKey, DeviceMessage, DeviceMessageType,
    KeyEventAction, MotionEventAction,
};
