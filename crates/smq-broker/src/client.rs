//! A small blocking client for either wire protocol.
//!
//! Covers the producer and consumer sides the broker serves: connect,
//! subscribe, publish, acknowledge, receive. Control replies the caller is
//! not waiting for (acks for other ids, pongs) are parked in an inbox so a
//! `receive` never loses an interleaved MESSAGE.

use std::{
    collections::VecDeque,
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use rustls::{ClientConnection, RootCertStore, StreamOwned, pki_types::ServerName};
use smq_wire::{
    Codec, ConnectReturn, Framer, Message, MessageId, MessageType, Protocol, QoS,
    message::H_ACK,
};
use tracing::debug;

use crate::{BrokerError, transport::load_certs};

const READ_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// CA bundle that signs the broker certificate.
    pub ca: PathBuf,
    /// Name the broker certificate must present.
    pub server_name: String,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub protocol: Protocol,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub max_frame: usize,
    pub tls: Option<TlsOptions>,
}

impl ClientOptions {
    pub fn new(client_id: &str, username: &str, password: &str) -> Self {
        Self {
            protocol: Protocol::Smq,
            client_id: client_id.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            timeout: Duration::from_secs(5),
            max_frame: smq_wire::DEFAULT_MAX_FRAME,
            tls: None,
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }
}

enum Stream {
    Tcp(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn sock(&self) -> &TcpStream {
        match self {
            Self::Tcp(sock) => sock,
            Self::Tls(tls) => &tls.sock,
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(sock) => sock.read(buf),
            Self::Tls(tls) => tls.read(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(sock) => sock.write_all(buf),
            Self::Tls(tls) => tls.write_all(buf),
        }
    }
}

pub struct Client {
    stream: Stream,
    codec: Codec,
    buf: BytesMut,
    timeout: Duration,
    next_packet: u16,
    inbox: VecDeque<Message>,
}

impl Client {
    /// Connects, authenticates and waits for the broker's CONNACK. A
    /// negative verdict surfaces as [`BrokerError::Rejected`].
    pub fn connect(addr: SocketAddr, opts: ClientOptions) -> Result<Self, BrokerError> {
        let sock = TcpStream::connect_timeout(&addr, opts.timeout)?;
        sock.set_nodelay(true)?;
        // generous while the (possibly TLS) session comes up, short slices
        // afterwards so receive deadlines stay responsive
        sock.set_read_timeout(Some(opts.timeout))?;

        let stream = match &opts.tls {
            None => Stream::Tcp(sock),
            Some(tls) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(&tls.ca)? {
                    roots
                        .add(cert)
                        .map_err(|e| BrokerError::Config(format!("bad CA certificate: {e}")))?;
                }
                let config = rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                let name = ServerName::try_from(tls.server_name.clone())
                    .map_err(|e| BrokerError::Config(format!("bad tls server name: {e}")))?;
                let session = ClientConnection::new(Arc::new(config), name)?;
                Stream::Tls(Box::new(StreamOwned::new(session, sock)))
            }
        };

        let mut client = Self {
            stream,
            codec: Codec::new(opts.protocol, opts.max_frame),
            buf: BytesMut::with_capacity(16 * 1024),
            timeout: opts.timeout,
            next_packet: 1,
            inbox: VecDeque::new(),
        };

        client.send(&Message::connect(&opts.client_id, &opts.username, &opts.password))?;
        let reply = client.wait_for(|m| m.kind == MessageType::ConnAck)?;
        match reply.connect_verdict() {
            Some(ConnectReturn::Accepted) => {
                client.stream.sock().set_read_timeout(Some(READ_SLICE))?;
                debug!(client_id = %opts.client_id, "connected");
                Ok(client)
            }
            Some(verdict) => Err(BrokerError::Rejected(verdict)),
            None => Err(BrokerError::Protocol("CONNACK without a verdict")),
        }
    }

    pub fn subscribe(&mut self, destination: &str, qos: QoS) -> Result<(), BrokerError> {
        let mut msg = Message::subscribe(destination, qos);
        msg.id = MessageId::from_packet_id(self.alloc_packet_id());
        let id = msg.id;
        self.send(&msg)?;
        if self.codec.protocol() == Protocol::Mqtt {
            self.wait_for(|m| {
                m.kind == MessageType::Ack && m.id == id && m.header(H_ACK) == Some("sub")
            })?;
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, destination: &str) -> Result<(), BrokerError> {
        let mut msg = Message::unsubscribe(destination);
        msg.id = MessageId::from_packet_id(self.alloc_packet_id());
        let id = msg.id;
        self.send(&msg)?;
        if self.codec.protocol() == Protocol::Mqtt {
            self.wait_for(|m| {
                m.kind == MessageType::Ack && m.id == id && m.header(H_ACK) == Some("unsub")
            })?;
        }
        Ok(())
    }

    /// Publishes one message. AT_LEAST_ONCE waits for the broker's ack.
    pub fn publish(
        &mut self,
        destination: &str,
        body: impl Into<bytes::Bytes>,
        qos: QoS,
    ) -> Result<MessageId, BrokerError> {
        let mut msg = Message::message(destination, body, qos);
        if qos == QoS::AtLeastOnce {
            msg.id = match self.codec.protocol() {
                Protocol::Mqtt => MessageId::from_packet_id(self.alloc_packet_id()),
                Protocol::Smq => MessageId(rand::random()),
            };
        }
        let id = msg.id;
        self.send(&msg)?;
        if qos == QoS::AtLeastOnce {
            self.wait_for(|m| {
                m.kind == MessageType::Ack && m.id == id && m.header(H_ACK).is_none()
            })?;
        }
        Ok(id)
    }

    /// Next MESSAGE delivery, or `None` when `timeout` lapses first.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<Message>, BrokerError> {
        if let Some(at) =
            self.inbox.iter().position(|m| m.kind == MessageType::Message)
        {
            return Ok(self.inbox.remove(at));
        }
        let deadline = Instant::now() + timeout;
        loop {
            match self.poll_message(deadline)? {
                Some(msg) if msg.kind == MessageType::Message => return Ok(Some(msg)),
                Some(other) => self.inbox.push_back(other),
                None => return Ok(None),
            }
        }
    }

    /// Acknowledges a delivery by id.
    pub fn ack(&mut self, id: MessageId) -> Result<(), BrokerError> {
        self.send(&Message::ack(id))
    }

    /// Round-trips a PING.
    pub fn ping(&mut self) -> Result<(), BrokerError> {
        self.send(&Message::ping())?;
        self.wait_for(Message::is_pong)?;
        Ok(())
    }

    pub fn disconnect(mut self) -> Result<(), BrokerError> {
        self.send(&Message::disconnect())?;
        let _ = self.stream.sock().shutdown(std::net::Shutdown::Both);
        Ok(())
    }

    fn alloc_packet_id(&mut self) -> u16 {
        let id = self.next_packet;
        self.next_packet = self.next_packet.checked_add(1).unwrap_or(1);
        id
    }

    fn send(&mut self, msg: &Message) -> Result<(), BrokerError> {
        let mut wire = Vec::new();
        self.codec.encode(&mut wire, msg)?;
        self.stream.write_all(&wire)?;
        Ok(())
    }

    /// Reads until a message matching `pred` arrives (within the client
    /// timeout); everything else is parked in the inbox.
    fn wait_for(
        &mut self,
        pred: impl Fn(&Message) -> bool,
    ) -> Result<Message, BrokerError> {
        if let Some(at) = self.inbox.iter().position(|m| pred(m)) {
            return Ok(self.inbox.remove(at).expect("position just found"));
        }
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.poll_message(deadline)? {
                Some(msg) if pred(&msg) => return Ok(msg),
                Some(other) => self.inbox.push_back(other),
                None => return Err(BrokerError::Timeout),
            }
        }
    }

    /// One decoded message, or `None` at the deadline.
    fn poll_message(&mut self, deadline: Instant) -> Result<Option<Message>, BrokerError> {
        loop {
            if let Some(msg) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(msg));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let mut chunk = [0u8; 16 * 1024];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(BrokerError::PeerClosed),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(BrokerError::Io(e)),
            }
        }
    }
}
