//! MQTT 3.1.1 framing, restricted to the subset a broker instance speaks:
//! CONNECT, CONNACK, SUBSCRIBE, SUBACK, UNSUBSCRIBE, UNSUBACK, PUBLISH
//! (QoS 0/1), PUBACK, PINGREQ, PINGRESP and DISCONNECT.
//!
//! The topic name maps onto `destination`; MQTT has no user headers. The
//! u16 packet identifier is embedded in the first two bytes of the 16-byte
//! message id.

use bytes::{Buf, BytesMut};

use crate::{
    ConnectReturn, FrameError, Message, MessageId, MessageType, QoS,
    framer::Framer,
    message::{H_ACK, H_GRANTED},
};

const PROTOCOL_NAME: &[u8] = b"\x00\x04MQTT";
const PROTOCOL_LEVEL: u8 = 4;

// Packet types, fixed-header high nibble.
const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const UNSUBSCRIBE: u8 = 10;
const UNSUBACK: u8 = 11;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

// CONNECT flag bits.
const FLAG_USERNAME: u8 = 0b1000_0000;
const FLAG_PASSWORD: u8 = 0b0100_0000;
const FLAG_WILL: u8 = 0b0000_0100;
const FLAG_CLEAN_SESSION: u8 = 0b0000_0010;

/// Marks the ack flavour in the reserved `ack` header.
const ACK_SUB: &str = "sub";
const ACK_UNSUB: &str = "unsub";

#[derive(Debug, Clone)]
pub struct MqttFramer {
    max_frame: usize,
}

/// Strict cursor over one fully-buffered packet body.
struct Body<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Body<'a> {
    fn u8(&mut self) -> Result<u8, FrameError> {
        let v = *self
            .buf
            .get(self.pos)
            .ok_or(FrameError::Malformed("truncated packet"))?;
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or(FrameError::Malformed("truncated packet"))?;
        let v = &self.buf[self.pos..end];
        self.pos = end;
        Ok(v)
    }

    fn string(&mut self) -> Result<&'a str, FrameError> {
        let len = self.u16()? as usize;
        std::str::from_utf8(self.bytes(len)?).map_err(|_| FrameError::Malformed("invalid utf-8"))
    }

    fn rest(&mut self) -> &'a [u8] {
        let v = &self.buf[self.pos..];
        self.pos = self.buf.len();
        v
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn expect_end(&self) -> Result<(), FrameError> {
        if self.remaining() != 0 {
            return Err(FrameError::Malformed("trailing bytes in packet"));
        }
        Ok(())
    }
}

fn put_string(dst: &mut Vec<u8>, s: &str) -> Result<(), FrameError> {
    let len = u16::try_from(s.len()).map_err(|_| FrameError::Malformed("string too long"))?;
    dst.extend_from_slice(&len.to_be_bytes());
    dst.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Variable-length remaining-length encoding: 7 bits per byte, continuation
/// in the high bit, at most four bytes.
fn put_remaining_len(dst: &mut Vec<u8>, mut len: usize) -> Result<(), FrameError> {
    if len > 268_435_455 {
        return Err(FrameError::Malformed("remaining length out of range"));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.push(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Decodes a remaining length from `src[1..]`. Returns the value and the
/// number of length bytes, or `None` when more input is needed.
fn get_remaining_len(src: &[u8]) -> Result<Option<(usize, usize)>, FrameError> {
    let mut value = 0usize;
    for i in 0..4 {
        let Some(&byte) = src.get(1 + i) else {
            return Ok(None);
        };
        value |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Err(FrameError::Malformed("remaining length overflows four bytes"))
}

impl MqttFramer {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    fn decode_packet(&self, first: u8, body: &[u8]) -> Result<Message, FrameError> {
        let packet_type = first >> 4;
        let flags = first & 0x0F;
        let mut b = Body { buf: body, pos: 0 };

        let msg = match packet_type {
            CONNECT => {
                if b.bytes(PROTOCOL_NAME.len())? != PROTOCOL_NAME {
                    return Err(FrameError::Malformed("bad protocol name"));
                }
                if b.u8()? != PROTOCOL_LEVEL {
                    return Err(FrameError::Malformed("unsupported protocol level"));
                }
                let connect_flags = b.u8()?;
                let _keep_alive = b.u16()?;
                let client_id = b.string()?.to_string();
                if connect_flags & FLAG_WILL != 0 {
                    // Will messages are outside the subset; parse and drop.
                    let _will_topic = b.string()?;
                    let will_len = b.u16()? as usize;
                    b.bytes(will_len)?;
                }
                let username = if connect_flags & FLAG_USERNAME != 0 {
                    b.string()?.to_string()
                } else {
                    String::new()
                };
                let password = if connect_flags & FLAG_PASSWORD != 0 {
                    let len = b.u16()? as usize;
                    String::from_utf8(b.bytes(len)?.to_vec())
                        .map_err(|_| FrameError::Malformed("invalid utf-8"))?
                } else {
                    String::new()
                };
                b.expect_end()?;
                Message::connect(&client_id, &username, &password)
            }
            CONNACK => {
                let _session_present = b.u8()? & 0x01;
                let code = b.u8()?;
                b.expect_end()?;
                let verdict = ConnectReturn::from_mqtt_code(code)
                    .ok_or(FrameError::Malformed("unknown connack return code"))?;
                Message::connack(verdict)
            }
            PUBLISH => {
                let qos = match (flags >> 1) & 0x03 {
                    0 => QoS::AtMostOnce,
                    1 => QoS::AtLeastOnce,
                    _ => return Err(FrameError::Malformed("qos 2 not supported")),
                };
                let topic = b.string()?.to_string();
                if topic.is_empty() {
                    return Err(FrameError::Malformed("MESSAGE without destination"));
                }
                let id = if qos == QoS::AtLeastOnce {
                    let packet_id = b.u16()?;
                    if packet_id == 0 {
                        return Err(FrameError::Malformed("zero packet id"));
                    }
                    MessageId::from_packet_id(packet_id)
                } else {
                    MessageId::ZERO
                };
                let mut msg =
                    Message::message(topic, bytes::Bytes::copy_from_slice(b.rest()), qos);
                msg.id = id;
                msg
            }
            PUBACK => {
                let packet_id = b.u16()?;
                b.expect_end()?;
                Message::ack(MessageId::from_packet_id(packet_id))
            }
            SUBSCRIBE => {
                if flags != 0b0010 {
                    return Err(FrameError::Malformed("bad subscribe flags"));
                }
                let packet_id = b.u16()?;
                let mut filters = Vec::new();
                while b.remaining() > 0 {
                    let topic = b.string()?.to_string();
                    let qos = QoS::from_u8(b.u8()?)?;
                    filters.push((topic, qos));
                }
                if filters.is_empty() {
                    return Err(FrameError::Malformed("subscribe without filters"));
                }
                let mut msg = Message::subscribe_many(&filters);
                msg.id = MessageId::from_packet_id(packet_id);
                msg
            }
            SUBACK => {
                let packet_id = b.u16()?;
                let codes: Vec<String> = b.rest().iter().map(|c| c.to_string()).collect();
                let mut msg = Message::ack(MessageId::from_packet_id(packet_id));
                msg.headers.insert(H_ACK.into(), ACK_SUB.into());
                msg.headers.insert(H_GRANTED.into(), codes.join(","));
                msg
            }
            UNSUBSCRIBE => {
                if flags != 0b0010 {
                    return Err(FrameError::Malformed("bad unsubscribe flags"));
                }
                let packet_id = b.u16()?;
                let topic = b.string()?.to_string();
                // Further filters in one packet are legal MQTT; the broker
                // unsubscribes one destination per message, so fold extras.
                let mut msg = Message::unsubscribe(topic);
                while b.remaining() > 0 {
                    let extra = b.string()?.to_string();
                    let n = msg.headers.len();
                    msg.headers
                        .insert(format!("{}{n}", crate::message::H_FILTER_PREFIX), format!("0:{extra}"));
                }
                msg.id = MessageId::from_packet_id(packet_id);
                msg
            }
            UNSUBACK => {
                let packet_id = b.u16()?;
                b.expect_end()?;
                let mut msg = Message::ack(MessageId::from_packet_id(packet_id));
                msg.headers.insert(H_ACK.into(), ACK_UNSUB.into());
                msg
            }
            PINGREQ => {
                b.expect_end()?;
                Message::ping()
            }
            PINGRESP => {
                b.expect_end()?;
                Message::pong()
            }
            DISCONNECT => {
                b.expect_end()?;
                Message::disconnect()
            }
            other => return Err(FrameError::UnknownType(other)),
        };
        Ok(msg)
    }

    fn encode_packet(&self, msg: &Message) -> Result<(u8, Vec<u8>), FrameError> {
        let mut body = Vec::new();
        let first = match msg.kind {
            MessageType::Connect => {
                body.extend_from_slice(PROTOCOL_NAME);
                body.push(PROTOCOL_LEVEL);
                let username = msg.header(crate::message::H_USERNAME).unwrap_or("");
                let password = msg.header(crate::message::H_PASSWORD).unwrap_or("");
                let mut flags = FLAG_CLEAN_SESSION;
                if !username.is_empty() {
                    flags |= FLAG_USERNAME;
                }
                if !password.is_empty() {
                    flags |= FLAG_PASSWORD;
                }
                body.push(flags);
                body.extend_from_slice(&0u16.to_be_bytes()); // keep-alive
                put_string(&mut body, msg.header(crate::message::H_CLIENT_ID).unwrap_or(""))?;
                if !username.is_empty() {
                    put_string(&mut body, username)?;
                }
                if !password.is_empty() {
                    put_string(&mut body, password)?;
                }
                CONNECT << 4
            }
            MessageType::ConnAck => {
                let verdict = msg
                    .connect_verdict()
                    .ok_or(FrameError::Malformed("connack without verdict"))?;
                body.push(0); // no session state kept
                body.push(verdict.mqtt_code());
                CONNACK << 4
            }
            MessageType::Message => {
                if msg.destination.is_empty() {
                    return Err(FrameError::Malformed("MESSAGE without destination"));
                }
                put_string(&mut body, &msg.destination)?;
                if msg.qos == QoS::AtLeastOnce {
                    let packet_id = msg.id.packet_id();
                    if packet_id == 0 {
                        return Err(FrameError::Malformed("qos 1 publish requires an id"));
                    }
                    body.extend_from_slice(&packet_id.to_be_bytes());
                }
                body.extend_from_slice(&msg.body);
                (PUBLISH << 4) | ((msg.qos as u8) << 1)
            }
            MessageType::Subscribe => {
                let packet_id = msg.id.packet_id();
                if packet_id == 0 {
                    return Err(FrameError::Malformed("subscribe requires an id"));
                }
                body.extend_from_slice(&packet_id.to_be_bytes());
                for (topic, qos) in msg.subscribe_filters() {
                    put_string(&mut body, &topic)?;
                    body.push(qos as u8);
                }
                (SUBSCRIBE << 4) | 0b0010
            }
            MessageType::Unsubscribe => {
                let packet_id = msg.id.packet_id();
                if packet_id == 0 {
                    return Err(FrameError::Malformed("unsubscribe requires an id"));
                }
                body.extend_from_slice(&packet_id.to_be_bytes());
                put_string(&mut body, &msg.destination)?;
                (UNSUBSCRIBE << 4) | 0b0010
            }
            MessageType::Ack => match msg.header(H_ACK) {
                None => {
                    body.extend_from_slice(&msg.id.packet_id().to_be_bytes());
                    PUBACK << 4
                }
                Some(ACK_SUB) => {
                    body.extend_from_slice(&msg.id.packet_id().to_be_bytes());
                    for code in
                        msg.header(H_GRANTED).unwrap_or("").split(',').filter(|c| !c.is_empty())
                    {
                        let granted: u8 = code
                            .parse()
                            .map_err(|_| FrameError::Malformed("bad granted qos list"))?;
                        body.push(granted);
                    }
                    SUBACK << 4
                }
                Some(ACK_UNSUB) => {
                    body.extend_from_slice(&msg.id.packet_id().to_be_bytes());
                    UNSUBACK << 4
                }
                Some(_) => return Err(FrameError::Malformed("unknown ack flavour")),
            },
            MessageType::Ping => {
                if msg.is_pong() { PINGRESP << 4 } else { PINGREQ << 4 }
            }
            MessageType::Disconnect => DISCONNECT << 4,
        };
        Ok((first, body))
    }
}

impl Framer for MqttFramer {
    fn encode(&self, dst: &mut Vec<u8>, msg: &Message) -> Result<(), FrameError> {
        let (first, body) = self.encode_packet(msg)?;
        let size = 2 + body.len();
        if size > self.max_frame {
            return Err(FrameError::TooLarge { size, limit: self.max_frame });
        }
        dst.push(first);
        put_remaining_len(dst, body.len())?;
        dst.extend_from_slice(&body);
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        if src.is_empty() {
            return Ok(None);
        }
        let Some((remaining, len_bytes)) = get_remaining_len(src)? else {
            return Ok(None);
        };
        let header = 1 + len_bytes;
        let total = header + remaining;
        if total > self.max_frame {
            return Err(FrameError::TooLarge { size: total, limit: self.max_frame });
        }
        if src.len() < total {
            return Ok(None);
        }
        let msg = self.decode_packet(src[0], &src[header..total])?;
        src.advance(total);
        Ok(Some(msg))
    }
}

/// Builds the broker-side subscribe acknowledgement for an MQTT session.
pub fn suback(id: MessageId, granted: &[QoS]) -> Message {
    let mut msg = Message::ack(id);
    msg.headers.insert(H_ACK.into(), ACK_SUB.into());
    let codes: Vec<String> = granted.iter().map(|q| (*q as u8).to_string()).collect();
    msg.headers.insert(H_GRANTED.into(), codes.join(","));
    msg
}

/// Builds the broker-side unsubscribe acknowledgement for an MQTT session.
pub fn unsuback(id: MessageId) -> Message {
    let mut msg = Message::ack(id);
    msg.headers.insert(H_ACK.into(), ACK_UNSUB.into());
    msg
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn framer() -> MqttFramer {
        MqttFramer::new(crate::DEFAULT_MAX_FRAME)
    }

    fn round_trip(msg: &Message) -> Message {
        let f = framer();
        let mut wire = Vec::new();
        f.encode(&mut wire, msg).unwrap();
        let mut buf = BytesMut::from(&wire[..]);
        let decoded = f.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn round_trip_connect() {
        let msg = Message::connect("client-7", "user", "secret");
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn round_trip_connack_verdicts() {
        for verdict in [
            ConnectReturn::Accepted,
            ConnectReturn::AuthFailed,
            ConnectReturn::ClientIdInUse,
            ConnectReturn::ProtocolVersion,
            ConnectReturn::ServerUnavailable,
        ] {
            assert_eq!(round_trip(&Message::connack(verdict)).connect_verdict(), Some(verdict));
        }
    }

    #[test]
    fn round_trip_publish_qos0_and_qos1() {
        let q0 = Message::message("/topic/t", Bytes::from_static(b"hello"), QoS::AtMostOnce);
        assert_eq!(round_trip(&q0), q0);

        let mut q1 = Message::message("/queue/q", Bytes::from_static(b"x"), QoS::AtLeastOnce);
        q1.id = MessageId::from_packet_id(42);
        assert_eq!(round_trip(&q1), q1);
    }

    #[test]
    fn round_trip_empty_body_publish() {
        let msg = Message::message("/topic/t", Bytes::new(), QoS::AtMostOnce);
        let decoded = round_trip(&msg);
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn round_trip_subscribe_multiple_filters() {
        let mut msg = Message::subscribe_many(&[
            ("/topic/a".to_string(), QoS::AtLeastOnce),
            ("/queue/b".to_string(), QoS::AtMostOnce),
        ]);
        msg.id = MessageId::from_packet_id(7);
        let decoded = round_trip(&msg);
        assert_eq!(decoded.subscribe_filters(), msg.subscribe_filters());
        assert_eq!(decoded.id.packet_id(), 7);
    }

    #[test]
    fn round_trip_control_packets() {
        let mut unsub = Message::unsubscribe("/topic/a");
        unsub.id = MessageId::from_packet_id(9);
        for msg in [
            unsub,
            Message::ack(MessageId::from_packet_id(3)),
            suback(MessageId::from_packet_id(7), &[QoS::AtLeastOnce, QoS::AtMostOnce]),
            unsuback(MessageId::from_packet_id(9)),
            Message::ping(),
            Message::pong(),
            Message::disconnect(),
        ] {
            assert_eq!(round_trip(&msg), msg);
        }
    }

    #[test]
    fn qos2_publish_is_rejected() {
        let f = framer();
        // PUBLISH, qos = 2 in flags, minimal body
        let mut wire = vec![(PUBLISH << 4) | (2 << 1)];
        let mut body = Vec::new();
        put_string(&mut body, "/t").unwrap();
        body.extend_from_slice(&1u16.to_be_bytes());
        put_remaining_len(&mut wire, body.len()).unwrap();
        wire.extend_from_slice(&body);
        let mut buf = BytesMut::from(&wire[..]);
        assert!(matches!(f.decode(&mut buf), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn short_input_returns_none() {
        let f = framer();
        let mut wire = Vec::new();
        let msg = Message::message("/topic/t", Bytes::from_static(b"payload"), QoS::AtMostOnce);
        f.encode(&mut wire, &msg).unwrap();
        for cut in 0..wire.len() {
            let mut buf = BytesMut::from(&wire[..cut]);
            assert_eq!(f.decode(&mut buf).unwrap(), None, "cut at {cut}");
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn byte_at_a_time_equals_one_chunk() {
        let f = framer();
        let mut q1 = Message::message("/queue/q", Bytes::from_static(b"ab"), QoS::AtLeastOnce);
        q1.id = MessageId::from_packet_id(5);
        let msgs = [
            Message::connect("c", "u", "p"),
            q1,
            Message::ping(),
        ];
        let mut wire = Vec::new();
        for m in &msgs {
            f.encode(&mut wire, m).unwrap();
        }

        let mut trickled = Vec::new();
        let mut buf = BytesMut::new();
        for b in &wire {
            buf.extend_from_slice(std::slice::from_ref(b));
            while let Some(m) = f.decode(&mut buf).unwrap() {
                trickled.push(m);
            }
        }
        assert_eq!(trickled.to_vec(), msgs.to_vec());
    }

    #[test]
    fn oversize_remaining_length_is_rejected() {
        let f = MqttFramer::new(128);
        // PINGREQ claiming a 1 MiB body
        let mut wire = vec![PINGREQ << 4];
        put_remaining_len(&mut wire, 1024 * 1024).unwrap();
        let mut buf = BytesMut::from(&wire[..]);
        assert!(matches!(f.decode(&mut buf), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn remaining_length_varint_boundaries() {
        for len in [0usize, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152] {
            let mut buf = vec![0u8];
            put_remaining_len(&mut buf, len).unwrap();
            let (decoded, _) = get_remaining_len(&buf).unwrap().unwrap();
            assert_eq!(decoded, len);
        }
    }
}
