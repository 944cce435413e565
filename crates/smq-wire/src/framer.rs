use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::{FrameError, Message, MqttFramer, SmqFramer};

/// Wire protocol spoken by a broker instance.
#[derive(Debug, Eq, PartialEq, Copy, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Smq,
    Mqtt,
}

/// Bidirectional codec over a byte-stream accumulator.
///
/// `decode` consumes at most one whole frame per call; on short input it
/// returns `Ok(None)` and leaves the buffer untouched. The framer keeps no
/// state between calls beyond the caller's accumulator.
pub trait Framer {
    fn encode(&self, dst: &mut Vec<u8>, msg: &Message) -> Result<(), FrameError>;
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>, FrameError>;
}

/// The two concrete framers behind one value type; the protocol variant is
/// fixed per server, so dispatch is a plain match.
#[derive(Debug, Clone)]
pub enum Codec {
    Smq(SmqFramer),
    Mqtt(MqttFramer),
}

impl Codec {
    pub fn new(protocol: Protocol, max_frame: usize) -> Self {
        match protocol {
            Protocol::Smq => Self::Smq(SmqFramer::new(max_frame)),
            Protocol::Mqtt => Self::Mqtt(MqttFramer::new(max_frame)),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Smq(_) => Protocol::Smq,
            Self::Mqtt(_) => Protocol::Mqtt,
        }
    }
}

impl Framer for Codec {
    fn encode(&self, dst: &mut Vec<u8>, msg: &Message) -> Result<(), FrameError> {
        match self {
            Self::Smq(f) => f.encode(dst, msg),
            Self::Mqtt(f) => f.encode(dst, msg),
        }
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        match self {
            Self::Smq(f) => f.decode(src),
            Self::Mqtt(f) => f.decode(src),
        }
    }
}
