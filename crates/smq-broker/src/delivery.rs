//! Send-side worker pool.
//!
//! Workers consume typed pump tasks from one bounded channel; a task names
//! the connection to serve, never the message, so any worker can run it and
//! per-connection order is fixed by the connection's own send queue. The
//! channel bound doubles as the distribution watermark: producers block
//! (bounded) when delivery falls behind.

use std::{
    sync::{Arc, atomic::Ordering},
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{Level, debug, span};

use crate::{broker, broker::Shared, connection::ConnId};

/// How long `distribute` may block on a full queue before falling back to
/// retention (queues) or dropping (topics).
pub(crate) const SUBMIT_TIMEOUT: Duration = Duration::from_millis(250);

const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub(crate) enum Task {
    /// Serve the oldest queued delivery of this connection.
    Pump(ConnId),
}

pub(crate) fn spawn_workers(
    shared: &Arc<Shared>,
    rx: &Receiver<Task>,
    workers: u32,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|n| {
            let shared = shared.clone();
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("smq-worker-{n}"))
                .spawn(move || {
                    let _span = span!(Level::INFO, "worker", n).entered();
                    worker_loop(&shared, &rx);
                })
                .expect("spawn delivery worker")
        })
        .collect()
}

fn worker_loop(shared: &Arc<Shared>, rx: &Receiver<Task>) {
    while !shared.stop.load(Ordering::Relaxed) {
        match rx.recv_timeout(IDLE_POLL) {
            Ok(Task::Pump(conn)) => broker::pump(shared, conn),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("worker exited");
}
