//! The protocol-independent message model.
//!
//! A [`Message`] is the unit both framers encode and decode. Session
//! metadata (credentials on CONNECT, the acknowledgement verdict on CONNACK,
//! extra subscription filters) travels in the ordered header map, the same
//! way the wire carries it.

use std::fmt;

use bytes::Bytes;
use indexmap::IndexMap;

use crate::error::FrameError;

/// Reserved header carrying the client identifier on CONNECT.
pub const H_CLIENT_ID: &str = "client_id";
/// Reserved header carrying the username on CONNECT.
pub const H_USERNAME: &str = "username";
/// Reserved header carrying the password on CONNECT.
pub const H_PASSWORD: &str = "password";
/// Reserved header carrying the CONNACK verdict.
pub const H_ACK: &str = "ack";
/// Reserved header distinguishing a ping reply from a ping request.
pub const H_PONG: &str = "pong";
/// Reserved header carrying the granted QoS list on a subscribe ack.
pub const H_GRANTED: &str = "granted";
/// Prefix for headers carrying subscription filters beyond `destination`.
pub const H_FILTER_PREFIX: &str = "filter.";

#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash)]
pub enum MessageType {
    /// Client request to open a session
    Connect = 1,
    /// Server verdict on a CONNECT
    ConnAck = 2,
    /// Client request to join one or more destinations
    Subscribe = 3,
    /// Client request to leave a destination
    Unsubscribe = 4,
    /// Application payload routed by destination
    Message = 5,
    /// Acknowledgement of a delivery (or of a subscribe/unsubscribe on MQTT)
    Ack = 6,
    /// Keepalive probe and its reply
    Ping = 7,
    /// Orderly session end
    Disconnect = 8,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Result<Self, FrameError> {
        Ok(match v {
            1 => Self::Connect,
            2 => Self::ConnAck,
            3 => Self::Subscribe,
            4 => Self::Unsubscribe,
            5 => Self::Message,
            6 => Self::Ack,
            7 => Self::Ping,
            8 => Self::Disconnect,
            other => return Err(FrameError::UnknownType(other)),
        })
    }
}

/// Quality of service for a single delivery.
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, PartialOrd, Ord, Copy, Clone, Hash, Default)]
pub enum QoS {
    /// Fire and forget; no acknowledgement, no retry.
    #[default]
    AtMostOnce = 0,
    /// The subscriber must acknowledge by message id within a bounded
    /// window or the message is re-enqueued.
    AtLeastOnce = 1,
}

impl QoS {
    pub fn from_u8(v: u8) -> Result<Self, FrameError> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            _ => Err(FrameError::Malformed("unsupported qos level")),
        }
    }
}

/// 16-byte opaque message identifier, unique per producer session.
///
/// The all-zero id means "no id"; any message that requires an
/// acknowledgement carries a non-zero id. On MQTT the u16 packet identifier
/// occupies the first two bytes (big-endian), the rest are zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub const ZERO: Self = Self([0; 16]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    pub fn from_packet_id(packet_id: u16) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..2].copy_from_slice(&packet_id.to_be_bytes());
        Self(bytes)
    }

    /// The MQTT packet identifier view of this id.
    pub fn packet_id(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(32);
        for b in self.0 {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = (hi * 16 + lo) as u8;
        }
        Some(Self(bytes))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.to_hex())
    }
}

/// Routing semantics selected by the destination prefix.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum DestinationKind {
    /// Competing consumers; each message goes to exactly one subscriber.
    Queue,
    /// Fan-out to every current subscriber.
    Topic,
}

impl DestinationKind {
    /// `/queue/…` selects queue semantics; everything else is a topic.
    pub fn of(destination: &str) -> Self {
        if destination.starts_with("/queue/") { Self::Queue } else { Self::Topic }
    }
}

/// Verdict carried by a CONNACK.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ConnectReturn {
    Accepted,
    AuthFailed,
    ClientIdInUse,
    ProtocolVersion,
    ServerUnavailable,
}

impl ConnectReturn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "ok",
            Self::AuthFailed => "auth_failed",
            Self::ClientIdInUse => "client_id_in_use",
            Self::ProtocolVersion => "protocol_version",
            Self::ServerUnavailable => "server_unavailable",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "ok" => Self::Accepted,
            "auth_failed" => Self::AuthFailed,
            "client_id_in_use" => Self::ClientIdInUse,
            "protocol_version" => Self::ProtocolVersion,
            "server_unavailable" => Self::ServerUnavailable,
            _ => return None,
        })
    }

    /// MQTT 3.1.1 CONNACK return code.
    pub fn mqtt_code(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::ProtocolVersion => 1,
            Self::ClientIdInUse => 2,
            Self::ServerUnavailable => 3,
            Self::AuthFailed => 4,
        }
    }

    pub fn from_mqtt_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Accepted,
            1 => Self::ProtocolVersion,
            2 => Self::ClientIdInUse,
            3 => Self::ServerUnavailable,
            // 4 = bad username/password, 5 = not authorized; one credential,
            // one verdict.
            4 | 5 => Self::AuthFailed,
            _ => return None,
        })
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub kind: MessageType,
    pub id: MessageId,
    pub destination: String,
    pub qos: QoS,
    /// Ordered key/value map; insertion order is preserved on the wire.
    pub headers: IndexMap<String, String>,
    pub body: Bytes,
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Message
    }
}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Self { kind, ..Default::default() }
    }

    pub fn connect(client_id: &str, username: &str, password: &str) -> Self {
        let mut msg = Self::new(MessageType::Connect);
        msg.headers.insert(H_CLIENT_ID.into(), client_id.into());
        msg.headers.insert(H_USERNAME.into(), username.into());
        msg.headers.insert(H_PASSWORD.into(), password.into());
        msg
    }

    pub fn connack(verdict: ConnectReturn) -> Self {
        let mut msg = Self::new(MessageType::ConnAck);
        msg.headers.insert(H_ACK.into(), verdict.as_str().into());
        msg
    }

    pub fn message(destination: impl Into<String>, body: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            kind: MessageType::Message,
            destination: destination.into(),
            body: body.into(),
            qos,
            ..Default::default()
        }
    }

    pub fn subscribe(destination: impl Into<String>, qos: QoS) -> Self {
        Self { kind: MessageType::Subscribe, destination: destination.into(), qos, ..Default::default() }
    }

    /// A SUBSCRIBE carrying several filters; the first one doubles as the
    /// `destination` field, the rest ride in `filter.N` headers.
    pub fn subscribe_many(filters: &[(String, QoS)]) -> Self {
        let mut it = filters.iter();
        let Some((first, qos)) = it.next() else {
            return Self::new(MessageType::Subscribe);
        };
        let mut msg = Self::subscribe(first.clone(), *qos);
        for (n, (dest, qos)) in it.enumerate() {
            msg.headers
                .insert(format!("{H_FILTER_PREFIX}{n}"), format!("{}:{dest}", *qos as u8));
        }
        msg
    }

    pub fn unsubscribe(destination: impl Into<String>) -> Self {
        Self { kind: MessageType::Unsubscribe, destination: destination.into(), ..Default::default() }
    }

    pub fn ack(id: MessageId) -> Self {
        Self { kind: MessageType::Ack, id, ..Default::default() }
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping)
    }

    pub fn pong() -> Self {
        let mut msg = Self::new(MessageType::Ping);
        msg.headers.insert(H_PONG.into(), "1".into());
        msg
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }

    pub fn is_pong(&self) -> bool {
        self.kind == MessageType::Ping && self.headers.contains_key(H_PONG)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn connect_verdict(&self) -> Option<ConnectReturn> {
        self.header(H_ACK).and_then(ConnectReturn::from_str)
    }

    /// All filters of a SUBSCRIBE: the `destination` field plus any
    /// `filter.N` headers, in wire order.
    pub fn subscribe_filters(&self) -> Vec<(String, QoS)> {
        let mut filters = vec![(self.destination.clone(), self.qos)];
        let mut n = 0;
        while let Some(v) = self.header(&format!("{H_FILTER_PREFIX}{n}")) {
            if let Some((qos, dest)) = v.split_once(':') {
                if let Ok(qos) = qos.parse::<u8>().map_err(|_| ()).and_then(|q| QoS::from_u8(q).map_err(|_| ())) {
                    filters.push((dest.to_string(), qos));
                }
            }
            n += 1;
        }
        filters
    }

    /// True when the receiver must acknowledge this message by id.
    pub fn needs_ack(&self) -> bool {
        self.kind == MessageType::Message && self.qos == QoS::AtLeastOnce && !self.id.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_kind_by_prefix() {
        assert_eq!(DestinationKind::of("/queue/work"), DestinationKind::Queue);
        assert_eq!(DestinationKind::of("/topic/news"), DestinationKind::Topic);
        // unknown prefixes default to topic
        assert_eq!(DestinationKind::of("plain"), DestinationKind::Topic);
        assert_eq!(DestinationKind::of("/queues/typo"), DestinationKind::Topic);
    }

    #[test]
    fn message_id_hex_round_trip() {
        let id = MessageId([0xde; 16]);
        assert_eq!(MessageId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(MessageId::from_hex("zz"), None);
        assert!(MessageId::ZERO.is_zero());
    }

    #[test]
    fn message_id_packet_id_embedding() {
        let id = MessageId::from_packet_id(0xbeef);
        assert_eq!(id.packet_id(), 0xbeef);
        assert!(!id.is_zero());
        assert_eq!(&id.0[2..], &[0u8; 14]);
    }

    #[test]
    fn subscribe_many_round_trips_filters() {
        let filters = vec![
            ("/queue/a".to_string(), QoS::AtLeastOnce),
            ("/topic/b".to_string(), QoS::AtMostOnce),
            ("/topic/c".to_string(), QoS::AtLeastOnce),
        ];
        let msg = Message::subscribe_many(&filters);
        assert_eq!(msg.destination, "/queue/a");
        assert_eq!(msg.subscribe_filters(), filters);
    }

    #[test]
    fn connect_carries_credentials_as_headers() {
        let msg = Message::connect("c1", "user", "secret");
        assert_eq!(msg.header(H_CLIENT_ID), Some("c1"));
        assert_eq!(msg.header(H_USERNAME), Some("user"));
        assert_eq!(msg.header(H_PASSWORD), Some("secret"));
    }
}
