//! The readiness multiplexer.
//!
//! A first-class object rather than process-wide state: the broker receives
//! one at construction, so several brokers can coexist in a process. The
//! poll itself moves into the broker's I/O thread; the shared
//! [`MuxHandle`] lets the accept thread, the delivery workers and `stop()`
//! nudge that thread with commands.

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex},
};

use mio::{Poll, Token, Waker};

use crate::connection::ConnId;

/// Token reserved for the cross-thread waker; connection ids start above it.
pub(crate) const WAKER: Token = Token(0);

pub(crate) fn token_of(id: ConnId) -> Token {
    Token(id as usize)
}

pub(crate) fn conn_of(token: Token) -> ConnId {
    token.0 as ConnId
}

/// Commands handed to the I/O thread.
pub(crate) enum MuxCmd {
    /// A freshly accepted connection to register for READABLE events.
    Register(ConnId),
    /// A writer backlogged output; add WRITABLE interest.
    ArmWrite(ConnId),
    /// Deregister and drop the connection's transport now.
    Teardown(ConnId),
}

pub(crate) struct MuxHandle {
    waker: Waker,
    cmds: Mutex<VecDeque<MuxCmd>>,
}

impl MuxHandle {
    pub(crate) fn push(&self, cmd: MuxCmd) {
        self.cmds.lock().expect("mux queue poisoned").push_back(cmd);
        let _ = self.waker.wake();
    }

    pub(crate) fn wake(&self) {
        let _ = self.waker.wake();
    }

    pub(crate) fn drain(&self) -> Vec<MuxCmd> {
        self.cmds.lock().expect("mux queue poisoned").drain(..).collect()
    }
}

/// A poll plus its shared handle. Constructed by the embedder and consumed
/// by [`Broker::start`](crate::Broker::start).
pub struct Multiplexer {
    pub(crate) poll: Poll,
    pub(crate) handle: Arc<MuxHandle>,
}

impl Multiplexer {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let handle = Arc::new(MuxHandle { waker, cmds: Mutex::new(VecDeque::new()) });
        Ok(Self { poll, handle })
    }
}
