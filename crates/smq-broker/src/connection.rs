//! Per-client session: one transport, one framer, the session state
//! machine, the outbound backlog and the acknowledgement ledger.
//!
//! The inbound path is single-consumer (the I/O thread drains all buffered
//! frames per readiness event); the outbound path is serialised by the
//! outbound lock, so the framer only ever sees one writer.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::BytesMut;
use mio::{Interest, Registry};
use smq_wire::{Codec, Framer, Message, MessageId, Protocol, QoS};
use tracing::trace;

use crate::{
    BrokerError,
    mux::{MuxCmd, MuxHandle, token_of},
    retained::RetainedRef,
    transport::{ReadOutcome, Transport},
};

pub(crate) type ConnId = u64;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum SessionState {
    /// Accepted; CONNECT not yet seen.
    Authenticating,
    Active,
    /// Draining outbound writes before the transport closes.
    Closing,
    Closed,
}

/// One queued outbound message, in per-connection delivery order.
pub(crate) struct Delivery {
    pub(crate) seq: u64,
    pub(crate) msg: Message,
    pub(crate) destination: String,
    /// Set when the message came out of a retained list; settled on ack.
    pub(crate) retained: Option<RetainedRef>,
}

pub(crate) struct PendingAck {
    pub(crate) msg: Message,
    pub(crate) destination: String,
    pub(crate) retained: Option<RetainedRef>,
    pub(crate) deadline: Instant,
}

#[derive(Default)]
struct Outbound {
    backlog: VecDeque<Vec<u8>>,
    armed: bool,
}

pub(crate) struct Connection {
    pub(crate) id: ConnId,
    peer: Option<SocketAddr>,
    codec: Codec,
    mux: Arc<MuxHandle>,
    transport: Mutex<Transport>,
    state: Mutex<SessionState>,
    inbound: Mutex<BytesMut>,
    outbound: Mutex<Outbound>,
    sendq: Mutex<VecDeque<Delivery>>,
    /// Serialises pop-and-write on the worker pool so two workers pumping
    /// the same connection cannot reorder its deliveries.
    pump_lock: Mutex<()>,
    next_seq: AtomicU64,
    client_id: Mutex<Option<String>>,
    acks: Mutex<HashMap<MessageId, PendingAck>>,
    ack_misses: AtomicU32,
    next_packet: AtomicU16,
    closing_since: Mutex<Option<Instant>>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        transport: Transport,
        protocol: Protocol,
        max_frame: usize,
        mux: Arc<MuxHandle>,
    ) -> Self {
        let peer = transport.peer_addr();
        Self {
            id,
            peer,
            codec: Codec::new(protocol, max_frame),
            mux,
            transport: Mutex::new(transport),
            state: Mutex::new(SessionState::Authenticating),
            inbound: Mutex::new(BytesMut::with_capacity(16 * 1024)),
            outbound: Mutex::new(Outbound::default()),
            sendq: Mutex::new(VecDeque::new()),
            pump_lock: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            client_id: Mutex::new(None),
            acks: Mutex::new(HashMap::new()),
            ack_misses: AtomicU32::new(0),
            next_packet: AtomicU16::new(1),
            closing_since: Mutex::new(None),
        }
    }

    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.codec.protocol()
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock().expect("connection state poisoned")
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub(crate) fn activate(&self) {
        *self.state.lock().expect("connection state poisoned") = SessionState::Active;
    }

    /// Moves to CLOSING; returns false when the session was already on its
    /// way out, so errors are only reported once per connection.
    pub(crate) fn begin_closing(&self) -> bool {
        let mut state = self.state.lock().expect("connection state poisoned");
        if matches!(*state, SessionState::Closing | SessionState::Closed) {
            return false;
        }
        *state = SessionState::Closing;
        *self.closing_since.lock().expect("closing clock poisoned") = Some(Instant::now());
        true
    }

    pub(crate) fn mark_closed(&self) {
        *self.state.lock().expect("connection state poisoned") = SessionState::Closed;
    }

    pub(crate) fn closing_for(&self) -> Option<Duration> {
        self.closing_since.lock().expect("closing clock poisoned").map(|t| t.elapsed())
    }

    pub(crate) fn client_id(&self) -> Option<String> {
        self.client_id.lock().expect("client id poisoned").clone()
    }

    pub(crate) fn set_client_id(&self, id: String) {
        *self.client_id.lock().expect("client id poisoned") = Some(id);
    }

    fn alloc_packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Copies a routed message for this subscriber: the delivery QoS is
    /// capped by the subscription and ack-tracked deliveries get an id from
    /// this connection's window.
    pub(crate) fn prepare_delivery(&self, msg: &Message, sub_qos: QoS) -> Message {
        let mut out = msg.clone();
        out.qos = msg.qos.min(sub_qos);
        if out.qos == QoS::AtLeastOnce {
            out.id = MessageId::from_packet_id(self.alloc_packet_id());
        }
        out
    }

    // ---- outbound message queue (drained by the delivery workers) ----

    pub(crate) fn push_delivery(
        &self,
        msg: Message,
        destination: String,
        retained: Option<RetainedRef>,
    ) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.sendq
            .lock()
            .expect("send queue poisoned")
            .push_back(Delivery { seq, msg, destination, retained });
        seq
    }

    pub(crate) fn pop_delivery(&self) -> Option<Delivery> {
        self.sendq.lock().expect("send queue poisoned").pop_front()
    }

    pub(crate) fn pump_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.pump_lock.lock().expect("pump lock poisoned")
    }

    /// Takes back the entry pushed under `seq` after a failed enqueue of its
    /// pump task. Returns it only if no worker claimed it meanwhile.
    pub(crate) fn cancel_delivery(&self, seq: u64) -> Option<Delivery> {
        let mut q = self.sendq.lock().expect("send queue poisoned");
        if q.back().is_some_and(|d| d.seq == seq) { q.pop_back() } else { None }
    }

    pub(crate) fn drain_deliveries(&self) -> Vec<Delivery> {
        self.sendq.lock().expect("send queue poisoned").drain(..).collect()
    }

    pub(crate) fn has_pending_deliveries(&self) -> bool {
        !self.sendq.lock().expect("send queue poisoned").is_empty()
    }

    // ---- acknowledgement ledger ----

    pub(crate) fn register_ack(&self, id: MessageId, pending: PendingAck) {
        self.acks.lock().expect("ack ledger poisoned").insert(id, pending);
    }

    pub(crate) fn take_ack(&self, id: MessageId) -> Option<PendingAck> {
        self.acks.lock().expect("ack ledger poisoned").remove(&id)
    }

    /// Removes and returns every delivery whose ack window expired, and
    /// bumps the miss counter accordingly.
    pub(crate) fn expired_acks(&self, now: Instant) -> Vec<PendingAck> {
        let mut acks = self.acks.lock().expect("ack ledger poisoned");
        let expired: Vec<MessageId> =
            acks.iter().filter(|(_, p)| p.deadline <= now).map(|(id, _)| *id).collect();
        let out: Vec<PendingAck> =
            expired.iter().filter_map(|id| acks.remove(id)).collect();
        if !out.is_empty() {
            self.ack_misses.fetch_add(out.len() as u32, Ordering::Relaxed);
        }
        out
    }

    pub(crate) fn drain_acks(&self) -> Vec<PendingAck> {
        self.acks.lock().expect("ack ledger poisoned").drain().map(|(_, p)| p).collect()
    }

    pub(crate) fn ack_misses(&self) -> u32 {
        self.ack_misses.load(Ordering::Relaxed)
    }

    // ---- byte paths ----

    /// Reads everything currently buffered by the kernel into the inbound
    /// accumulator and decodes complete frames from it. The flag reports a
    /// peer close; frames decoded before the close are still returned.
    pub(crate) fn read_frames(&self) -> Result<(Vec<Message>, bool), BrokerError> {
        let mut inbound = self.inbound.lock().expect("inbound buffer poisoned");
        let outcome = {
            let mut transport = self.transport.lock().expect("transport poisoned");
            transport.read_into(&mut inbound)?
        };

        let mut frames = Vec::new();
        while let Some(msg) = self.codec.decode(&mut inbound)? {
            frames.push(msg);
        }
        Ok((frames, outcome == ReadOutcome::Closed))
    }

    /// Encodes and writes one message inline; any remainder the socket
    /// refuses is backlogged and WRITABLE interest is armed via the mux.
    pub(crate) fn try_send(&self, msg: &Message) -> Result<(), BrokerError> {
        let mut wire = Vec::new();
        self.codec.encode(&mut wire, msg)?;

        let mut out = self.outbound.lock().expect("outbound poisoned");
        if !out.backlog.is_empty() {
            out.backlog.push_back(wire);
            self.arm(&mut out);
            return Ok(());
        }

        let mut transport = self.transport.lock().expect("transport poisoned");
        let written = transport.write(&wire)?;
        if written < wire.len() {
            trace!(conn = self.id, backlogged = wire.len() - written, "partial write");
            out.backlog.push_back(wire.split_off(written));
            self.arm(&mut out);
        } else if transport.wants_write() {
            self.arm(&mut out);
        }
        Ok(())
    }

    fn arm(&self, out: &mut Outbound) {
        if !out.armed {
            out.armed = true;
            self.mux.push(MuxCmd::ArmWrite(self.id));
        }
    }

    /// Pushes backlogged bytes out after a WRITABLE event. Returns true when
    /// everything has flushed.
    pub(crate) fn flush_backlog(&self) -> Result<bool, BrokerError> {
        let mut out = self.outbound.lock().expect("outbound poisoned");
        let mut transport = self.transport.lock().expect("transport poisoned");
        transport.flush()?;
        while let Some(front) = out.backlog.front_mut() {
            let written = transport.write(front)?;
            if written == front.len() {
                out.backlog.pop_front();
            } else {
                front.drain(..written);
                break;
            }
            if transport.wants_write() {
                break;
            }
        }
        let empty = out.backlog.is_empty() && !transport.wants_write();
        if empty {
            out.armed = false;
        }
        Ok(empty)
    }

    pub(crate) fn has_backlog(&self) -> bool {
        let out = self.outbound.lock().expect("outbound poisoned");
        if !out.backlog.is_empty() {
            return true;
        }
        self.transport.lock().expect("transport poisoned").wants_write()
    }

    // ---- registration with the multiplexer (I/O thread only) ----

    pub(crate) fn register(&self, registry: &Registry) -> std::io::Result<()> {
        // lock order everywhere is outbound before transport
        let interests = if self.has_backlog() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.transport
            .lock()
            .expect("transport poisoned")
            .register(registry, token_of(self.id), interests)
    }

    pub(crate) fn set_write_interest(
        &self,
        registry: &Registry,
        writable: bool,
    ) -> std::io::Result<()> {
        let interests = if writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.transport
            .lock()
            .expect("transport poisoned")
            .reregister(registry, token_of(self.id), interests)
    }

    /// Final teardown: deregister and shut the socket down.
    pub(crate) fn close_transport(&self, registry: &Registry) {
        let mut transport = self.transport.lock().expect("transport poisoned");
        transport.deregister(registry);
        transport.close();
        self.mark_closed();
    }
}
