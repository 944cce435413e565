//! The native SMQ framing.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! u8   type
//! u16  destination_length   destination bytes (UTF-8)
//! u16  header_count
//!        per header: u8 key_length, key, u16 value_length, value
//! u32  body_length          body bytes
//! ```
//!
//! The frame has no dedicated id or qos fields; messages that need them
//! carry the reserved `message-id` and `qos` headers, which the framer
//! synthesises on encode and folds back into the [`Message`] on decode.

use bytes::{Buf, BytesMut};

use crate::{FrameError, Message, MessageId, MessageType, QoS, framer::Framer};

/// Reserved header carrying the 16-byte id as 32 hex chars.
const H_MESSAGE_ID: &str = "message-id";
/// Reserved header carrying the qos level of an ack-tracked message.
const H_QOS: &str = "qos";

const MAX_KEY: usize = u8::MAX as usize;
const MAX_VALUE: usize = u16::MAX as usize;
const MAX_DESTINATION: usize = u16::MAX as usize;

#[derive(Debug, Clone)]
pub struct SmqFramer {
    max_frame: usize,
}

enum Halt {
    /// Not enough buffered bytes for a whole frame yet.
    Incomplete,
    Fail(FrameError),
}

impl From<FrameError> for Halt {
    fn from(e: FrameError) -> Self {
        Self::Fail(e)
    }
}

/// Bounds-checked reader over the unconsumed accumulator. Nothing is
/// consumed from the source until a whole frame has parsed.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    limit: usize,
}

impl<'a> Reader<'a> {
    fn need(&self, n: usize) -> Result<(), Halt> {
        let end = self.pos.checked_add(n).ok_or(FrameError::Malformed("length overflow"))?;
        if end > self.limit {
            return Err(FrameError::TooLarge { size: end, limit: self.limit }.into());
        }
        if end > self.buf.len() {
            return Err(Halt::Incomplete);
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, Halt> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, Halt> {
        self.need(2)?;
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, Halt> {
        self.need(4)?;
        let v = u32::from_be_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], Halt> {
        self.need(n)?;
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }

    fn utf8(&mut self, n: usize) -> Result<&'a str, Halt> {
        std::str::from_utf8(self.bytes(n)?)
            .map_err(|_| FrameError::Malformed("invalid utf-8").into())
    }
}

impl SmqFramer {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    fn try_decode(&self, src: &[u8]) -> Result<(Message, usize), Halt> {
        let mut r = Reader { buf: src, pos: 0, limit: self.max_frame };

        let kind = MessageType::from_u8(r.u8()?)?;

        let dest_len = r.u16()? as usize;
        if kind == MessageType::Message && dest_len == 0 {
            return Err(FrameError::Malformed("MESSAGE without destination").into());
        }
        let destination = r.utf8(dest_len)?.to_string();

        let header_count = r.u16()?;
        let mut msg = Message::new(kind);
        msg.destination = destination;
        for _ in 0..header_count {
            let key_len = r.u8()? as usize;
            let key = r.utf8(key_len)?.to_string();
            let value_len = r.u16()? as usize;
            let value = r.utf8(value_len)?.to_string();
            msg.headers.insert(key, value);
        }

        let body_len = r.u32()? as usize;
        msg.body = bytes::Bytes::copy_from_slice(r.bytes(body_len)?);

        // Fold the reserved headers back into typed fields.
        if let Some(hex) = msg.headers.shift_remove(H_MESSAGE_ID) {
            msg.id = MessageId::from_hex(&hex)
                .ok_or(FrameError::Malformed("bad message-id header"))?;
        }
        if let Some(qos) = msg.headers.shift_remove(H_QOS) {
            let level: u8 =
                qos.parse().map_err(|_| FrameError::Malformed("bad qos header"))?;
            msg.qos = QoS::from_u8(level)?;
        }

        Ok((msg, r.pos))
    }
}

impl Framer for SmqFramer {
    fn encode(&self, dst: &mut Vec<u8>, msg: &Message) -> Result<(), FrameError> {
        if msg.destination.len() > MAX_DESTINATION {
            return Err(FrameError::Malformed("destination too long"));
        }
        if msg.kind == MessageType::Message && msg.destination.is_empty() {
            return Err(FrameError::Malformed("MESSAGE without destination"));
        }

        let mut reserved: Vec<(&str, String)> = Vec::new();
        if !msg.id.is_zero() {
            reserved.push((H_MESSAGE_ID, msg.id.to_hex()));
        }
        if msg.qos == QoS::AtLeastOnce {
            reserved.push((H_QOS, "1".to_string()));
        }

        let header_count = reserved.len() + msg.headers.len();
        if header_count > u16::MAX as usize {
            return Err(FrameError::Malformed("too many headers"));
        }

        let start = dst.len();
        dst.push(msg.kind as u8);
        dst.extend_from_slice(&(msg.destination.len() as u16).to_be_bytes());
        dst.extend_from_slice(msg.destination.as_bytes());
        dst.extend_from_slice(&(header_count as u16).to_be_bytes());

        let reserved_iter = reserved.iter().map(|(k, v)| (*k, v.as_str()));
        let user_iter = msg.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        for (key, value) in reserved_iter.chain(user_iter) {
            if key.len() > MAX_KEY {
                return Err(FrameError::Malformed("header key too long"));
            }
            if value.len() > MAX_VALUE {
                return Err(FrameError::Malformed("header value too long"));
            }
            dst.push(key.len() as u8);
            dst.extend_from_slice(key.as_bytes());
            dst.extend_from_slice(&(value.len() as u16).to_be_bytes());
            dst.extend_from_slice(value.as_bytes());
        }

        let body_len =
            u32::try_from(msg.body.len()).map_err(|_| FrameError::Malformed("body too long"))?;
        dst.extend_from_slice(&body_len.to_be_bytes());
        dst.extend_from_slice(&msg.body);

        let size = dst.len() - start;
        if size > self.max_frame {
            dst.truncate(start);
            return Err(FrameError::TooLarge { size, limit: self.max_frame });
        }
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        match self.try_decode(src) {
            Ok((msg, consumed)) => {
                src.advance(consumed);
                Ok(Some(msg))
            }
            Err(Halt::Incomplete) => Ok(None),
            Err(Halt::Fail(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::message::{ConnectReturn, H_ACK};

    fn framer() -> SmqFramer {
        SmqFramer::new(crate::DEFAULT_MAX_FRAME)
    }

    fn round_trip(msg: &Message) -> Message {
        let f = framer();
        let mut wire = Vec::new();
        f.encode(&mut wire, msg).unwrap();
        let mut buf = BytesMut::from(&wire[..]);
        let decoded = f.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty(), "decode must consume the whole frame");
        decoded
    }

    #[test]
    fn round_trip_message_with_headers_and_body() {
        let mut msg = Message::message("/topic/news", Bytes::from_static(b"payload"), QoS::AtLeastOnce);
        msg.id = MessageId([7; 16]);
        msg.headers.insert("content-type".into(), "text/plain".into());
        msg.headers.insert("x-trace".into(), "abc123".into());
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn round_trip_empty_body() {
        let msg = Message::message("/queue/q", Bytes::new(), QoS::AtMostOnce);
        let decoded = round_trip(&msg);
        assert!(decoded.body.is_empty());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trip_control_messages() {
        for msg in [
            Message::connect("c1", "u", "p"),
            Message::connack(ConnectReturn::Accepted),
            Message::connack(ConnectReturn::AuthFailed),
            Message::subscribe("/queue/work", QoS::AtLeastOnce),
            Message::unsubscribe("/queue/work"),
            Message::ack(MessageId([1; 16])),
            Message::ping(),
            Message::pong(),
            Message::disconnect(),
        ] {
            assert_eq!(round_trip(&msg), msg);
        }
    }

    #[test]
    fn connack_verdict_survives_the_wire() {
        let decoded = round_trip(&Message::connack(ConnectReturn::ClientIdInUse));
        assert_eq!(decoded.header(H_ACK), Some("client_id_in_use"));
        assert_eq!(decoded.connect_verdict(), Some(ConnectReturn::ClientIdInUse));
    }

    #[test]
    fn short_input_returns_none_and_consumes_nothing() {
        let f = framer();
        let mut wire = Vec::new();
        let mut msg = Message::message("/topic/t", Bytes::from_static(b"abc"), QoS::AtMostOnce);
        msg.headers.insert("k".into(), "v".into());
        f.encode(&mut wire, &msg).unwrap();

        for cut in 0..wire.len() {
            let mut buf = BytesMut::from(&wire[..cut]);
            assert_eq!(f.decode(&mut buf).unwrap(), None, "cut at {cut}");
            assert_eq!(buf.len(), cut, "partial decode must not consume");
        }
    }

    #[test]
    fn byte_at_a_time_equals_one_chunk() {
        let f = framer();
        let msgs = [
            Message::message("/topic/t", Bytes::from_static(b"one"), QoS::AtMostOnce),
            Message::subscribe("/queue/q", QoS::AtLeastOnce),
            Message::message("/topic/t", Bytes::from_static(b"two"), QoS::AtMostOnce),
        ];
        let mut wire = Vec::new();
        for m in &msgs {
            f.encode(&mut wire, m).unwrap();
        }

        let mut chunked = BytesMut::from(&wire[..]);
        let mut expect = Vec::new();
        while let Some(m) = f.decode(&mut chunked).unwrap() {
            expect.push(m);
        }

        let mut trickled = Vec::new();
        let mut buf = BytesMut::new();
        for b in &wire {
            buf.extend_from_slice(std::slice::from_ref(b));
            while let Some(m) = f.decode(&mut buf).unwrap() {
                trickled.push(m);
            }
        }

        assert_eq!(expect.len(), msgs.len());
        assert_eq!(trickled, expect);
    }

    #[test]
    fn oversize_frame_is_rejected_early() {
        let f = SmqFramer::new(64);
        // Declares a 1 MiB body; only the prefix is buffered.
        let mut wire = Vec::new();
        wire.push(MessageType::Message as u8);
        wire.extend_from_slice(&2u16.to_be_bytes());
        wire.extend_from_slice(b"/t");
        wire.extend_from_slice(&0u16.to_be_bytes());
        wire.extend_from_slice(&(1024u32 * 1024).to_be_bytes());

        let mut buf = BytesMut::from(&wire[..]);
        assert!(matches!(f.decode(&mut buf), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn maximum_body_length_is_rejected_by_the_frame_limit() {
        let f = framer();
        let mut wire = Vec::new();
        wire.push(MessageType::Message as u8);
        wire.extend_from_slice(&2u16.to_be_bytes());
        wire.extend_from_slice(b"/t");
        wire.extend_from_slice(&0u16.to_be_bytes());
        wire.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut buf = BytesMut::from(&wire[..]);
        assert!(matches!(f.decode(&mut buf), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn message_without_destination_is_malformed() {
        let f = framer();
        let mut wire = Vec::new();
        wire.push(MessageType::Message as u8);
        wire.extend_from_slice(&0u16.to_be_bytes());
        wire.extend_from_slice(&0u16.to_be_bytes());
        wire.extend_from_slice(&0u32.to_be_bytes());
        let mut buf = BytesMut::from(&wire[..]);
        assert!(matches!(f.decode(&mut buf), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let f = framer();
        let mut buf = BytesMut::from(&[0xAAu8, 0, 0][..]);
        assert!(matches!(f.decode(&mut buf), Err(FrameError::UnknownType(0xAA))));
    }
}
