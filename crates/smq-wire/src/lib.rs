//! Message model and wire framings for the SMQ broker.
//!
//! Two framings share one [`Framer`] contract: the native SMQ frame
//! (big-endian, length-prefixed) and an MQTT 3.1.1 subset. A broker instance
//! speaks exactly one of them; the [`Codec`] variant is chosen at accept time
//! and held by value.

mod error;
mod framer;
pub mod message;
mod mqtt;
mod smq;

pub use error::FrameError;
pub use framer::{Codec, Framer, Protocol};
pub use message::{ConnectReturn, DestinationKind, Message, MessageId, MessageType, QoS};
pub use mqtt::{MqttFramer, suback, unsuback};
pub use smq::SmqFramer;

/// Hard ceiling for a single decoded frame unless configured lower.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;
