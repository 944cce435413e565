//! The broker: listener, connection registry, router and retention.
//!
//! Thread layout: one accept thread, one I/O thread driving the
//! multiplexer, a bounded pool of delivery workers and one housekeeping
//! loop for ack windows and closing-connection grace. All of them poll the
//! stop flag with bounded waits, so `stop()` returns within a short
//! deadline.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use mio::{Events, Interest, Poll, Token, net::TcpListener};
use smq_store::PersistentStore;
use smq_wire::{
    ConnectReturn, DestinationKind, Message, MessageType, Protocol, QoS, SmqFramer,
    message::{H_CLIENT_ID, H_PASSWORD, H_USERNAME},
};
use tracing::{Level, debug, error, info, span, trace, warn};

use crate::{
    BrokerError,
    config::Config,
    connection::{ConnId, Connection, Delivery, PendingAck, SessionState},
    delivery::{SUBMIT_TIMEOUT, Task, spawn_workers},
    mux::{MuxCmd, MuxHandle, Multiplexer, WAKER, conn_of},
    retained::{RetainedQueue, RetainedRef},
    subscription::{Subscription, SubscriptionTable},
    transport::{Transport, server_tls_config},
};

const ACCEPT_POLL: Duration = Duration::from_millis(500);
const IO_POLL: Duration = Duration::from_millis(200);
const HOUSEKEEPING_TICK: Duration = Duration::from_millis(100);
/// How long a CLOSING connection may keep flushing before it is cut off.
const CLOSE_GRACE: Duration = Duration::from_secs(1);
/// Name of the store object directory holding queue retention.
const STORE_OBJECT: &str = "broker";

pub(crate) struct Shared {
    pub(crate) cfg: Config,
    pub(crate) subs: SubscriptionTable,
    pub(crate) conns: RwLock<HashMap<ConnId, Arc<Connection>>>,
    next_conn: AtomicU64,
    client_ids: Mutex<HashMap<String, ConnId>>,
    pub(crate) mux: Arc<MuxHandle>,
    pool_tx: Sender<Task>,
    store: Option<Arc<PersistentStore>>,
    retained: Mutex<HashMap<String, Arc<RetainedQueue>>>,
    /// Canonical framing for retained entries, independent of the wire
    /// protocol the broker speaks.
    store_codec: SmqFramer,
    pub(crate) stop: AtomicBool,
}

pub struct Broker {
    shared: Arc<Shared>,
    local_addr: std::net::SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl Broker {
    /// Opens the store, replays retained state, binds the listener and
    /// spawns the thread set. The listener only opens after recovery has
    /// finished.
    pub fn start(cfg: Config, mux: Multiplexer) -> Result<Self, BrokerError> {
        cfg.validate_for_embedding()?;

        let store = match &cfg.store {
            Some(sc) => Some(PersistentStore::open(&sc.root, STORE_OBJECT, sc.bucket_size as u32)?),
            None => None,
        };

        let store_codec = SmqFramer::new(cfg.frame.max_bytes as usize);
        let mut retained = HashMap::new();
        if let Some(store) = &store {
            for name in store.list_names() {
                let list = store.list(&name)?;
                let queue = Arc::new(RetainedQueue::durable(list));
                if queue.len() > 0 {
                    info!(destination = %name, entries = queue.len(), "recovered retained queue");
                }
                retained.insert(name, queue);
            }
        }

        let tls = if cfg.listen.tls.enabled {
            Some(server_tls_config(&cfg.listen.tls)?)
        } else {
            None
        };

        let mut listener = TcpListener::bind(cfg.bind_addr()?)?;
        let local_addr = listener.local_addr()?;

        let (pool_tx, pool_rx) =
            crossbeam_channel::bounded(cfg.delivery.queue_watermark as usize);
        let workers = cfg.delivery.workers;

        let shared = Arc::new(Shared {
            cfg,
            subs: SubscriptionTable::default(),
            conns: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            client_ids: Mutex::new(HashMap::new()),
            mux: mux.handle.clone(),
            pool_tx,
            store,
            retained: Mutex::new(retained),
            store_codec,
            stop: AtomicBool::new(false),
        });

        let mut threads = spawn_workers(&shared, &pool_rx, workers);

        let io_shared = shared.clone();
        threads.push(
            std::thread::Builder::new()
                .name("smq-io".into())
                .spawn(move || io_loop(&io_shared, mux.poll))
                .expect("spawn io thread"),
        );

        let accept_shared = shared.clone();
        let accept_protocol = accept_shared.cfg.protocol;
        threads.push(
            std::thread::Builder::new()
                .name("smq-accept".into())
                .spawn(move || accept_loop(&accept_shared, &mut listener, accept_protocol, tls))
                .expect("spawn accept thread"),
        );

        let hk_shared = shared.clone();
        threads.push(
            std::thread::Builder::new()
                .name("smq-housekeeping".into())
                .spawn(move || housekeeping_loop(&hk_shared))
                .expect("spawn housekeeping thread"),
        );

        info!(addr = %local_addr, protocol = ?shared.cfg.protocol, "broker listening");
        Ok(Self { shared, local_addr, threads })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Live connections, any state.
    pub fn connection_count(&self) -> usize {
        self.shared.conns.read().expect("connection registry poisoned").len()
    }

    /// Signals every thread, waits for them, then force-closes anything
    /// still open and flushes the store.
    pub fn stop(self) {
        info!("broker stopping");
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.mux.wake();
        for handle in self.threads {
            let name = handle.thread().name().unwrap_or("smq-thread").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "thread panicked during shutdown");
            }
        }
        if let Some(store) = &self.shared.store {
            store.flush();
        }
        info!("broker stopped");
    }
}

impl Shared {
    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub(crate) fn conn(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.conns.read().expect("connection registry poisoned").get(&id).cloned()
    }

    fn conn_snapshot(&self) -> Vec<Arc<Connection>> {
        self.conns.read().expect("connection registry poisoned").values().cloned().collect()
    }

    /// Whether a destination still holds retained entries (keeps its
    /// subscription alive in the table).
    fn has_retained(&self, destination: &str) -> bool {
        self.retained
            .lock()
            .expect("retained registry poisoned")
            .get(destination)
            .is_some_and(|q| q.len() > 0)
    }

    fn retained_of(&self, destination: &str) -> Option<Arc<RetainedQueue>> {
        self.retained.lock().expect("retained registry poisoned").get(destination).cloned()
    }

    /// Opens (or creates) the retention queue for a destination; durable
    /// when a store is configured and the destination's list is healthy.
    fn retained_queue(&self, destination: &str) -> Arc<RetainedQueue> {
        let mut retained = self.retained.lock().expect("retained registry poisoned");
        retained
            .entry(destination.to_string())
            .or_insert_with(|| match &self.store {
                Some(store) => match store.list(destination) {
                    Ok(list) => Arc::new(RetainedQueue::durable(list)),
                    Err(e) => {
                        error!(destination, "cannot open retained list, going volatile: {e}");
                        Arc::new(RetainedQueue::volatile())
                    }
                },
                None => Arc::new(RetainedQueue::volatile()),
            })
            .clone()
    }

    /// Drops a destination's bad durable list and replaces it with a
    /// volatile queue; entries that were only on disk are lost and said so.
    fn downgrade_retained(&self, destination: &str) -> Arc<RetainedQueue> {
        let mut retained = self.retained.lock().expect("retained registry poisoned");
        error!(destination, "retained list unusable, destination reverts to volatile");
        let queue = Arc::new(RetainedQueue::volatile());
        retained.insert(destination.to_string(), queue.clone());
        queue
    }
}

// ---- accept path ----

fn accept_loop(
    shared: &Arc<Shared>,
    listener: &mut TcpListener,
    protocol: Protocol,
    tls: Option<Arc<rustls::ServerConfig>>,
) {
    let _span = span!(Level::INFO, "accept").entered();
    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(e) => {
            error!("accept poll: {e}");
            return;
        }
    };
    if let Err(e) = poll.registry().register(listener, Token(0), Interest::READABLE) {
        error!("listener registration: {e}");
        return;
    }
    let mut events = Events::with_capacity(64);

    while !shared.stopping() {
        if let Err(e) = poll.poll(&mut events, Some(ACCEPT_POLL)) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!("accept poll: {e}");
            break;
        }
        loop {
            match listener.accept() {
                Ok((sock, peer)) => {
                    let transport = match &tls {
                        None => Transport::plain(sock),
                        Some(config) => match Transport::tls(sock, config.clone()) {
                            Ok(t) => t,
                            Err(e) => {
                                warn!(%peer, "tls session setup failed: {e}");
                                continue;
                            }
                        },
                    };
                    let id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
                    let conn = Arc::new(Connection::new(
                        id,
                        transport,
                        protocol,
                        shared.cfg.frame.max_bytes as usize,
                        shared.mux.clone(),
                    ));
                    shared
                        .conns
                        .write()
                        .expect("connection registry poisoned")
                        .insert(id, conn);
                    shared.mux.push(MuxCmd::Register(id));
                    debug!(conn = id, %peer, "accepted");
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("accept: {e}");
                    break;
                }
            }
        }
    }
    info!("listener stopped");
}

// ---- I/O path ----

fn io_loop(shared: &Arc<Shared>, mut poll: Poll) {
    let _span = span!(Level::INFO, "io").entered();
    let mut events = Events::with_capacity(1024);

    loop {
        if let Err(e) = poll.poll(&mut events, Some(IO_POLL)) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!("io poll: {e}");
            break;
        }
        if shared.stopping() {
            break;
        }

        for cmd in shared.mux.drain() {
            match cmd {
                MuxCmd::Register(id) => {
                    if let Some(conn) = shared.conn(id) {
                        if let Err(e) = conn.register(poll.registry()) {
                            warn!(conn = id, "registration failed: {e}");
                            begin_close(shared, &conn, Some(&BrokerError::Io(e)));
                            teardown(shared, &poll, id);
                        }
                    }
                }
                MuxCmd::ArmWrite(id) => {
                    if let Some(conn) = shared.conn(id) {
                        if let Err(e) = conn.set_write_interest(poll.registry(), true) {
                            debug!(conn = id, "arm write: {e}");
                        }
                    }
                }
                MuxCmd::Teardown(id) => teardown(shared, &poll, id),
            }
        }

        for event in &events {
            if event.token() == WAKER {
                continue;
            }
            let id = conn_of(event.token());
            let Some(conn) = shared.conn(id) else {
                continue;
            };

            if event.is_readable() || event.is_read_closed() {
                on_readable(shared, &conn);
            }

            if event.is_writable() {
                match conn.flush_backlog() {
                    Ok(true) => {
                        if conn.state() == SessionState::Closing {
                            teardown(shared, &poll, id);
                        } else if let Err(e) = conn.set_write_interest(poll.registry(), false) {
                            debug!(conn = id, "disarm write: {e}");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        begin_close(shared, &conn, Some(&e));
                        teardown(shared, &poll, id);
                    }
                }
            }
        }
    }

    // Force-close whatever survived the deadline.
    let leftover: Vec<ConnId> =
        shared.conns.read().expect("connection registry poisoned").keys().copied().collect();
    for id in leftover {
        if let Some(conn) = shared.conn(id) {
            begin_close(shared, &conn, None);
        }
        teardown(shared, &poll, id);
    }
    info!("io thread stopped");
}

fn teardown(shared: &Arc<Shared>, poll: &Poll, id: ConnId) {
    let removed =
        shared.conns.write().expect("connection registry poisoned").remove(&id);
    if let Some(conn) = removed {
        conn.close_transport(poll.registry());
        reclaim_outstanding(shared, &conn);
        debug!(conn = id, client = ?conn.client_id(), "connection closed");
    }
}

fn on_readable(shared: &Arc<Shared>, conn: &Arc<Connection>) {
    match conn.read_frames() {
        Ok((frames, closed)) => {
            for msg in frames {
                if let Err(e) = handle_message(shared, conn, msg) {
                    let fatal = e.is_connection_fatal();
                    if fatal {
                        begin_close(shared, conn, Some(&e));
                        return;
                    }
                    debug!(conn = conn.id, "message error: {e}");
                }
            }
            if closed {
                begin_close(shared, conn, None);
            }
        }
        Err(e) => begin_close(shared, conn, Some(&e)),
    }
}

// ---- session state machine ----

fn handle_message(
    shared: &Arc<Shared>,
    conn: &Arc<Connection>,
    msg: Message,
) -> Result<(), BrokerError> {
    match conn.state() {
        SessionState::Closing | SessionState::Closed => Ok(()),
        SessionState::Authenticating => match msg.kind {
            MessageType::Connect => handle_connect(shared, conn, &msg),
            _ => Err(BrokerError::Protocol("message before CONNECT")),
        },
        SessionState::Active => match msg.kind {
            MessageType::Connect => Err(BrokerError::Protocol("duplicate CONNECT")),
            MessageType::ConnAck => Err(BrokerError::Protocol("CONNACK from a client")),
            MessageType::Subscribe => handle_subscribe(shared, conn, &msg),
            MessageType::Unsubscribe => handle_unsubscribe(shared, conn, &msg),
            MessageType::Message => {
                let producer_ack =
                    msg.needs_ack().then(|| Message::ack(msg.id));
                distribute(shared, msg);
                if let Some(ack) = producer_ack {
                    conn.try_send(&ack)?;
                }
                Ok(())
            }
            MessageType::Ack => {
                handle_ack(shared, conn, &msg);
                Ok(())
            }
            MessageType::Ping => {
                if msg.is_pong() {
                    Ok(())
                } else {
                    conn.try_send(&Message::pong())
                }
            }
            MessageType::Disconnect => {
                debug!(conn = conn.id, client = ?conn.client_id(), "client disconnect");
                begin_close(shared, conn, None);
                Ok(())
            }
        },
    }
}

fn handle_connect(
    shared: &Arc<Shared>,
    conn: &Arc<Connection>,
    msg: &Message,
) -> Result<(), BrokerError> {
    let client_id = msg.header(H_CLIENT_ID).unwrap_or("");
    let username = msg.header(H_USERNAME).unwrap_or("");
    let password = msg.header(H_PASSWORD).unwrap_or("");

    let verdict = authenticate(shared, conn.id, client_id, username, password);
    if verdict == ConnectReturn::Accepted {
        // authenticate reserved the id in the registry; record the claim on
        // the connection before any write can fail, so teardown releases it
        conn.set_client_id(client_id.to_string());
    }
    conn.try_send(&Message::connack(verdict))?;

    if verdict == ConnectReturn::Accepted {
        conn.activate();
        info!(conn = conn.id, client = client_id, peer = ?conn.peer(), "session up");
        Ok(())
    } else {
        warn!(conn = conn.id, client = client_id, verdict = verdict.as_str(), "connect refused");
        Err(BrokerError::Auth)
    }
}

/// Checks the shared credential and claims the client id. A client id held
/// by a live connection is rejected; the holder is not evicted.
fn authenticate(
    shared: &Arc<Shared>,
    conn: ConnId,
    client_id: &str,
    username: &str,
    password: &str,
) -> ConnectReturn {
    if client_id.is_empty() {
        return ConnectReturn::AuthFailed;
    }
    if let Some(auth) = &shared.cfg.auth {
        if auth.username != username || auth.password != password {
            return ConnectReturn::AuthFailed;
        }
    }
    let mut ids = shared.client_ids.lock().expect("client id registry poisoned");
    if ids.contains_key(client_id) {
        return ConnectReturn::ClientIdInUse;
    }
    ids.insert(client_id.to_string(), conn);
    ConnectReturn::Accepted
}

fn handle_subscribe(
    shared: &Arc<Shared>,
    conn: &Arc<Connection>,
    msg: &Message,
) -> Result<(), BrokerError> {
    let filters = msg.subscribe_filters();
    let subs = shared.subs.subscribe(conn.id, &filters);

    if conn.protocol() == Protocol::Mqtt {
        let granted: Vec<QoS> = filters.iter().map(|(_, qos)| *qos).collect();
        conn.try_send(&smq_wire::suback(msg.id, &granted))?;
    }

    for (sub, added) in &subs {
        debug!(conn = conn.id, destination = sub.destination(), added, "subscribed");
        if sub.kind() == DestinationKind::Queue {
            drain_retained(shared, sub);
        }
    }
    Ok(())
}

fn handle_unsubscribe(
    shared: &Arc<Shared>,
    conn: &Arc<Connection>,
    msg: &Message,
) -> Result<(), BrokerError> {
    for (destination, _) in msg.subscribe_filters() {
        shared.subs.unsubscribe(conn.id, &destination, |d| shared.has_retained(d));
        debug!(conn = conn.id, destination = %destination, "unsubscribed");
    }
    if conn.protocol() == Protocol::Mqtt {
        conn.try_send(&smq_wire::unsuback(msg.id))?;
    }
    Ok(())
}

fn handle_ack(shared: &Arc<Shared>, conn: &Arc<Connection>, msg: &Message) {
    let Some(pending) = conn.take_ack(msg.id) else {
        trace!(conn = conn.id, id = ?msg.id, "ack for unknown delivery");
        return;
    };
    if let Some(r) = pending.retained {
        if let Some(queue) = shared.retained_of(&pending.destination) {
            if let Err(e) = queue.settle(r) {
                error!(destination = %pending.destination, "cannot settle retained entry: {e}");
            }
        }
    }
    trace!(conn = conn.id, destination = %pending.destination, "delivery acknowledged");
}

// ---- routing ----

/// Routes one message: fan-out for topics, round-robin for queues,
/// retention when a queue has no takers.
pub(crate) fn distribute(shared: &Arc<Shared>, msg: Message) {
    let destination = msg.destination.clone();
    let kind = DestinationKind::of(&destination);
    let Some(sub) = shared.subs.resolve(&destination) else {
        match kind {
            DestinationKind::Queue => retain(shared, &destination, &msg),
            DestinationKind::Topic => trace!(destination = %destination, "no subscribers, dropped"),
        }
        return;
    };

    match kind {
        DestinationKind::Topic => {
            // Best-effort fan-out in insertion order; one slow or dead
            // subscriber neither blocks nor retries the others.
            for member in sub.snapshot() {
                if let Err(e) = enqueue_delivery(shared, member, &msg, sub.qos(), None, true) {
                    debug!(conn = member, destination = %destination, "fan-out skip: {e}");
                }
            }
        }
        DestinationKind::Queue => {
            if sub.is_draining() {
                retain(shared, &destination, &msg);
                return;
            }
            if !queue_dispatch(shared, &sub, &msg, None, &mut Vec::new(), true) {
                retain(shared, &destination, &msg);
            }
        }
    }
}

/// Round-robin queue dispatch. Walks at most one full pass over the
/// members, skipping `tried`; returns whether anyone accepted the message.
fn queue_dispatch(
    shared: &Arc<Shared>,
    sub: &Arc<Subscription>,
    msg: &Message,
    retained: Option<RetainedRef>,
    tried: &mut Vec<ConnId>,
    blocking: bool,
) -> bool {
    while let Some(target) = sub.next_round_robin(tried) {
        match enqueue_delivery(shared, target, msg, sub.qos(), retained, blocking) {
            Ok(()) => return true,
            Err(e) => {
                debug!(conn = target, destination = sub.destination(), "queue pick failed: {e}");
                tried.push(target);
            }
        }
    }
    if let Some(r) = retained {
        // the entry never left the retained list; put it back in contention
        if let Some(queue) = shared.retained_of(sub.destination()) {
            queue.release(r);
        }
    }
    false
}

/// Queues one delivery on the target connection and submits a pump task.
fn enqueue_delivery(
    shared: &Arc<Shared>,
    target: ConnId,
    msg: &Message,
    sub_qos: QoS,
    retained: Option<RetainedRef>,
    blocking: bool,
) -> Result<(), BrokerError> {
    let conn = shared.conn(target).filter(|c| c.is_active()).ok_or(BrokerError::PeerClosed)?;
    let prepared = conn.prepare_delivery(msg, sub_qos);
    let seq = conn.push_delivery(prepared, msg.destination.clone(), retained);

    let submitted = if blocking {
        shared.pool_tx.send_timeout(Task::Pump(target), SUBMIT_TIMEOUT).is_ok()
    } else {
        shared.pool_tx.try_send(Task::Pump(target)).is_ok()
    };
    if submitted {
        return Ok(());
    }
    if conn.cancel_delivery(seq).is_some() {
        Err(BrokerError::Backpressure)
    } else {
        // a worker already claimed the entry; the pump made it through
        Ok(())
    }
}

/// Runs on a delivery worker: serve the oldest queued delivery of `target`.
pub(crate) fn pump(shared: &Arc<Shared>, target: ConnId) {
    let Some(conn) = shared.conn(target) else {
        return;
    };
    // pop-and-write must be atomic per connection or two workers could
    // reorder consecutive deliveries
    let _guard = conn.pump_guard();
    let Some(delivery) = conn.pop_delivery() else {
        return;
    };
    if !conn.is_active() {
        fail_delivery(shared, &conn, delivery);
        return;
    }

    let needs_ack = delivery.msg.qos == QoS::AtLeastOnce;
    if needs_ack {
        let deadline =
            Instant::now() + Duration::from_millis(u64::from(shared.cfg.delivery.ack_timeout_ms));
        conn.register_ack(
            delivery.msg.id,
            PendingAck {
                msg: delivery.msg.clone(),
                destination: delivery.destination.clone(),
                retained: delivery.retained,
                deadline,
            },
        );
    }

    match conn.try_send(&delivery.msg) {
        Ok(()) => {
            if !needs_ack {
                if let Some(r) = delivery.retained {
                    if let Some(queue) = shared.retained_of(&delivery.destination) {
                        let _ = queue.settle(r);
                    }
                }
            }
            trace!(conn = target, destination = %delivery.destination, "delivered");
        }
        Err(e) => {
            if needs_ack {
                conn.take_ack(delivery.msg.id);
            }
            warn!(conn = target, "delivery write failed: {e}");
            begin_close(shared, &conn, Some(&e));
            fail_delivery(shared, &conn, delivery);
        }
    }
}

/// A delivery could not reach its subscriber: retained entries go back in
/// contention, fresh queue messages re-select or retain, topics drop.
fn fail_delivery(shared: &Arc<Shared>, conn: &Arc<Connection>, delivery: Delivery) {
    let destination = delivery.destination;
    match delivery.retained {
        Some(r) => {
            if let Some(queue) = shared.retained_of(&destination) {
                queue.release(r);
            }
            if let Some(sub) = shared.subs.resolve(&destination) {
                drain_retained(shared, &sub);
            }
        }
        None => match DestinationKind::of(&destination) {
            DestinationKind::Queue => {
                let redirected = shared.subs.resolve(&destination).is_some_and(|sub| {
                    queue_dispatch(
                        shared,
                        &sub,
                        &delivery.msg,
                        None,
                        &mut vec![conn.id],
                        false,
                    )
                });
                if !redirected {
                    retain(shared, &destination, &delivery.msg);
                }
            }
            DestinationKind::Topic => {
                trace!(destination = %destination, "topic delivery dropped");
            }
        },
    }
}

// ---- retention ----

fn retain(shared: &Arc<Shared>, destination: &str, msg: &Message) {
    let queue = shared.retained_queue(destination);
    if let Err(e) = queue.push(&shared.store_codec, msg) {
        if queue.is_durable() {
            error!(destination, "retention write failed: {e}");
            let volatile = shared.downgrade_retained(destination);
            if let Err(e) = volatile.push(&shared.store_codec, msg) {
                error!(destination, "volatile retention failed, message lost: {e}");
            }
        } else {
            error!(destination, "retention failed, message lost: {e}");
        }
        return;
    }
    debug!(destination, durable = queue.is_durable(), "message retained");
}

/// Replays a queue's retained entries (oldest first) into its members.
/// While the drain runs, new distributions for the destination append to
/// the retained list instead, preserving order.
fn drain_retained(shared: &Arc<Shared>, sub: &Arc<Subscription>) {
    if sub.kind() != DestinationKind::Queue || sub.is_empty() {
        return;
    }
    let Some(queue) = shared.retained_of(sub.destination()) else {
        return;
    };
    if queue.pending() == 0 {
        return;
    }

    sub.set_draining(true);
    loop {
        let batch = match queue.take_batch(&shared.store_codec) {
            Ok(batch) => batch,
            Err(e) => {
                error!(destination = sub.destination(), "retained replay failed: {e}");
                shared.downgrade_retained(sub.destination());
                break;
            }
        };
        if batch.is_empty() {
            break;
        }
        let mut progressed = false;
        for (r, msg) in batch {
            progressed |= queue_dispatch(shared, sub, &msg, Some(r), &mut Vec::new(), true);
        }
        if !progressed {
            break;
        }
    }
    sub.set_draining(false);
    debug!(destination = sub.destination(), left = queue.len(), "retained drain pass done");
}

// ---- connection shutdown ----

/// First half of connection teardown, safe to call from any thread and
/// idempotent: flips the state, detaches subscriptions, releases the client
/// id and re-routes undelivered work. The I/O thread finishes by closing
/// the transport once the outbound backlog flushes or the grace lapses.
pub(crate) fn begin_close(
    shared: &Arc<Shared>,
    conn: &Arc<Connection>,
    error: Option<&BrokerError>,
) {
    if !conn.begin_closing() {
        return;
    }
    match error {
        Some(e) => warn!(conn = conn.id, client = ?conn.client_id(), "closing connection: {e}"),
        None => debug!(conn = conn.id, client = ?conn.client_id(), "closing connection"),
    }

    shared.subs.remove(conn.id, |d| shared.has_retained(d));
    if let Some(client_id) = conn.client_id() {
        let mut ids = shared.client_ids.lock().expect("client id registry poisoned");
        if ids.get(&client_id) == Some(&conn.id) {
            ids.remove(&client_id);
        }
    }

    reclaim_outstanding(shared, conn);

    if !conn.has_backlog() {
        shared.mux.push(MuxCmd::Teardown(conn.id));
    }
}

/// Gives back everything a departing connection still owed: queued
/// deliveries and unacknowledged messages are re-routed or put back into
/// retention. Idempotent; runs at CLOSING and again at final teardown to
/// cover deliveries that raced the first pass.
fn reclaim_outstanding(shared: &Arc<Shared>, conn: &Arc<Connection>) {
    let mut to_redrain = Vec::new();
    for delivery in conn.drain_deliveries() {
        match delivery.retained {
            Some(r) => {
                if let Some(queue) = shared.retained_of(&delivery.destination) {
                    queue.release(r);
                }
                to_redrain.push(delivery.destination);
            }
            None => {
                if DestinationKind::of(&delivery.destination) == DestinationKind::Queue {
                    distribute(shared, delivery.msg);
                }
            }
        }
    }
    for pending in conn.drain_acks() {
        match pending.retained {
            Some(r) => {
                if let Some(queue) = shared.retained_of(&pending.destination) {
                    queue.release(r);
                }
                to_redrain.push(pending.destination);
            }
            None => {
                if DestinationKind::of(&pending.destination) == DestinationKind::Queue {
                    distribute(shared, pending.msg);
                }
            }
        }
    }
    to_redrain.sort_unstable();
    to_redrain.dedup();
    for destination in to_redrain {
        if let Some(sub) = shared.subs.resolve(&destination) {
            drain_retained(shared, &sub);
        }
    }
}

// ---- housekeeping ----

fn housekeeping_loop(shared: &Arc<Shared>) {
    let _span = span!(Level::INFO, "housekeeping").entered();
    while !shared.stopping() {
        std::thread::sleep(HOUSEKEEPING_TICK);
        let now = Instant::now();

        for conn in shared.conn_snapshot() {
            match conn.state() {
                SessionState::Closing => {
                    let grace_up = conn.closing_for().is_some_and(|d| d >= CLOSE_GRACE);
                    if grace_up || !conn.has_backlog() {
                        shared.mux.push(MuxCmd::Teardown(conn.id));
                    }
                }
                SessionState::Active => {
                    let expired = conn.expired_acks(now);
                    if !expired.is_empty() {
                        warn!(
                            conn = conn.id,
                            client = ?conn.client_id(),
                            expired = expired.len(),
                            misses = conn.ack_misses(),
                            "ack window lapsed"
                        );
                        let mut to_redrain = Vec::new();
                        for pending in expired {
                            match pending.retained {
                                Some(r) => {
                                    if let Some(queue) =
                                        shared.retained_of(&pending.destination)
                                    {
                                        queue.release(r);
                                    }
                                    to_redrain.push(pending.destination);
                                }
                                // re-enqueue for the same destination;
                                // topic deliveries are best-effort and must
                                // not fan out again to subscribers that
                                // already acknowledged
                                None => {
                                    if DestinationKind::of(&pending.destination)
                                        == DestinationKind::Queue
                                    {
                                        distribute(shared, pending.msg);
                                    }
                                }
                            }
                        }
                        to_redrain.sort_unstable();
                        to_redrain.dedup();
                        for destination in to_redrain {
                            if let Some(sub) = shared.subs.resolve(&destination) {
                                drain_retained(shared, &sub);
                            }
                        }
                        if conn.ack_misses() >= shared.cfg.delivery.max_ack_misses {
                            begin_close(
                                shared,
                                &conn,
                                Some(&BrokerError::Timeout),
                            );
                        }
                    }
                    // nudge any deliveries whose pump task was lost
                    if conn.has_pending_deliveries() {
                        let _ = shared.pool_tx.try_send(Task::Pump(conn.id));
                    }
                }
                _ => {}
            }
        }
    }
    info!("housekeeping stopped");
}
