//! Outbound send serialization.
//!
//! A single worker owns the transport's write half; every send, fire-and-
//! forget or the first half of a synchronous call, executes strictly in
//! submission order, so two callers can never interleave their bytes on
//! the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::correlation::{Pending, Resolution};
use super::error::ProtocolError;
use super::stats::LinkStats;
use super::transport::Transport;

/// One queued outbound write.
pub(crate) struct SendJob {
    /// Encoded frame to put on the wire.
    pub frame: Vec<u8>,
    /// Pending request to fail fast if the write itself errors.
    pub pending: Option<Arc<Pending>>,
}

/// Single-worker queue with exclusive ownership of the write half.
pub(crate) struct SendSerializer {
    tx: Mutex<Option<SyncSender<SendJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SendSerializer {
    pub fn start(
        transport: Box<dyn Transport>,
        stats: Arc<LinkStats>,
        link_failed: Arc<AtomicBool>,
        depth: usize,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        let worker = thread::Builder::new()
            .name("send-worker".to_string())
            .spawn(move || Self::run(rx, transport, stats, link_failed))?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn run(
        rx: Receiver<SendJob>,
        mut transport: Box<dyn Transport>,
        stats: Arc<LinkStats>,
        link_failed: Arc<AtomicBool>,
    ) {
        for job in rx {
            if link_failed.load(Ordering::Acquire) {
                // The link is gone; fail queued requests promptly instead
                // of attempting writes that cannot succeed.
                if let Some(pending) = &job.pending {
                    pending.resolve(Resolution::SendFailed("link down".to_string()));
                }
                continue;
            }
            match transport.write_all(&job.frame) {
                Ok(()) => {
                    LinkStats::add(&stats.tx_bytes, job.frame.len() as u64);
                    LinkStats::add(&stats.tx_frames, 1);
                    debug!(len = job.frame.len(), "frame written");
                }
                Err(e) => {
                    warn!(error = %e, "transport write failed");
                    link_failed.store(true, Ordering::Release);
                    if let Some(pending) = &job.pending {
                        debug!(key = %pending.key(), "failing pending request");
                        pending.resolve(Resolution::SendFailed(e.to_string()));
                    }
                }
            }
        }
        debug!("send worker exited");
    }

    /// Enqueue a job in strict submission order. Blocks the caller briefly
    /// when the queue is full; fails once the serializer has been closed.
    pub fn submit(&self, job: SendJob) -> Result<(), ProtocolError> {
        let tx = self
            .tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(job).map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Stop accepting sends, flush the queue, and join the worker.
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

impl Drop for SendSerializer {
    fn drop(&mut self) {
        self.close();
    }
}
