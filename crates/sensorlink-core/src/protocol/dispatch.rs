//! Callback dispatch pools and subscriber registries.
//!
//! Each callback category runs on its own single-worker pool: message
//! callbacks, response callbacks and file-transfer callbacks. A message
//! handler may block in `send_and_wait` until a response callback fires, so
//! response delivery must never share a worker with message handlers; the
//! three categories are therefore structurally independent. Within one pool
//! delivery is FIFO in wire-arrival order; across pools no order is defined.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::codec::Message;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handler for unsolicited device messages.
pub trait MessageListener: Send + Sync {
    /// Invoked on the message pool for each unsolicited message.
    fn message_received(&self, message: &Message);
}

/// Handler observing every response message, whether or not a synchronous
/// caller was waiting for it.
pub trait ResponseListener: Send + Sync {
    /// Invoked on the response pool for each response message.
    fn response_received(&self, message: &Message);
}

/// Handler for file-chunk messages.
pub trait FileTransferListener: Send + Sync {
    /// Invoked on the file-transfer pool for each received chunk.
    fn chunk_received(&self, offset: u32, data: &[u8]);
}

/// Handler for connection state changes.
pub trait ConnectionListener: Send + Sync {
    /// Invoked with `true` after connect and `false` after disconnect.
    fn on_connected(&self, connected: bool);
}

/// Opaque handle returned by the subscribe operations, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberToken(u64);

/// One category's subscriber list. Insertion order is delivery order.
pub(crate) struct Listeners<T: ?Sized> {
    entries: Mutex<Vec<(SubscriberToken, Arc<T>)>>,
    tokens: Arc<AtomicU64>,
}

impl<T: ?Sized> Listeners<T> {
    /// `tokens` is shared across categories so a token identifies its
    /// registration uniquely within one communicator.
    pub fn new(tokens: Arc<AtomicU64>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            tokens,
        }
    }

    pub fn add(&self, listener: Arc<T>) -> SubscriberToken {
        let token = SubscriberToken(self.tokens.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().unwrap().push((token, listener));
        token
    }

    pub fn remove(&self, token: SubscriberToken) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|(t, _)| *t != token);
        entries.len() != before
    }

    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }
}

/// A single-worker execution queue for one callback category.
///
/// Enqueueing never blocks: when the bounded queue is full the event is
/// dropped and counted, so a slow subscriber cannot stall the receive loop.
/// A panicking handler is caught at the pool boundary and the worker keeps
/// processing subsequent items.
pub(crate) struct DispatchPool {
    name: &'static str,
    tx: Mutex<Option<SyncSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl DispatchPool {
    pub fn start(name: &'static str, depth: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Job>(depth.max(1));
        let worker = thread::Builder::new()
            .name(format!("{name}-worker"))
            .spawn(move || Self::run(rx, name))?;
        Ok(Self {
            name,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            dropped: AtomicU64::new(0),
        })
    }

    fn run(rx: Receiver<Job>, name: &'static str) {
        for job in rx {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                warn!(pool = name, "subscriber callback panicked");
            }
        }
    }

    /// Enqueue without blocking; drop and count when the queue is full.
    pub fn submit(&self, job: Job) {
        let tx = match self.tx.lock().unwrap().clone() {
            Some(tx) => tx,
            None => return,
        };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(pool = self.name, "dispatch queue full, event dropped");
            }
            // Worker already stopped during teardown
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Events dropped because the queue was saturated.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting work, finish what is queued, and join the worker.
    /// When called from the worker itself (a handler driving teardown), the
    /// queue is cut but the join is skipped.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// The three category pools of one connection.
pub(crate) struct DispatchPools {
    pub message: DispatchPool,
    pub response: DispatchPool,
    pub file: DispatchPool,
}

impl DispatchPools {
    pub fn start(
        message_depth: usize,
        response_depth: usize,
        file_depth: usize,
    ) -> std::io::Result<Self> {
        Ok(Self {
            message: DispatchPool::start("msg", message_depth)?,
            response: DispatchPool::start("rsp", response_depth)?,
            file: DispatchPool::start("file", file_depth)?,
        })
    }

    pub fn dropped(&self) -> u64 {
        self.message.dropped() + self.response.dropped() + self.file.dropped()
    }

    /// Drain and stop all three pools.
    pub fn close(&self) {
        self.message.close();
        self.response.close();
        self.file.close();
    }
}
