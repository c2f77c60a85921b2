//! File download over the file-transfer pool.
//!
//! A download subscribes a chunk-accumulating listener, asks the device to
//! stream the file, and writes chunks to a named temporary file in offset
//! order. Completion is size-driven: the expected size comes from the file
//! listing. Chunk integrity is covered by the per-frame CRC.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::codec::Message;

use super::communicator::Communicator;
use super::dispatch::FileTransferListener;
use super::error::ProtocolError;

/// Progress callbacks every this many chunks.
const PROGRESS_CHUNK_INTERVAL: u64 = 20;

/// Progress observer for [`Communicator::download_file`]. All methods have
/// empty defaults so implementors override only what they need; they are
/// invoked on the file-transfer pool worker.
pub trait FileDownloadListener: Send + Sync {
    /// Periodic progress: percent complete and throughput in KiB/s.
    fn on_progress(&self, file: &str, size: u64, percent: u32, kibps: f64) {
        let _ = (file, size, percent, kibps);
    }

    /// The download finished; the payload is at `path`.
    fn on_complete(&self, file: &str, path: &Path, kibps: f64) {
        let _ = (file, path, kibps);
    }

    /// The download failed.
    fn on_failed(&self, file: &str, reason: &str) {
        let _ = (file, reason);
    }
}

struct DownloadState {
    file: Option<NamedTempFile>,
    received: u64,
    chunks: u64,
    outcome: Option<Result<PathBuf, String>>,
}

enum Event {
    Progress(u32, f64),
    Complete(PathBuf, f64),
    Failed(String),
}

struct DownloadSink {
    name: String,
    size: u64,
    started: Instant,
    listener: Option<Arc<dyn FileDownloadListener>>,
    state: Mutex<DownloadState>,
    done: Condvar,
}

impl DownloadSink {
    fn new(
        name: &str,
        size: u64,
        listener: Option<Arc<dyn FileDownloadListener>>,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: name.to_string(),
            size,
            started: Instant::now(),
            listener,
            state: Mutex::new(DownloadState {
                file: Some(NamedTempFile::new()?),
                received: 0,
                chunks: 0,
                outcome: None,
            }),
            done: Condvar::new(),
        })
    }

    fn kibps(&self, bytes: u64) -> f64 {
        let secs = self.started.elapsed().as_secs_f64().max(1e-3);
        (bytes as f64 / 1024.0) / secs
    }

    /// Record a terminal outcome and wake the waiting caller. Must be
    /// called with the state lock held.
    fn finish(&self, state: &mut DownloadState, outcome: Result<PathBuf, String>) {
        state.file = None;
        state.outcome = Some(outcome);
        self.done.notify_all();
    }

    /// Block until the download reaches a terminal state or `timeout`
    /// elapses (a stalled stream counts as a timeout).
    fn wait(&self, timeout: Duration) -> Result<PathBuf, ProtocolError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(outcome) = state.outcome.as_ref() {
                return match outcome {
                    Ok(path) => Ok(path.clone()),
                    Err(reason) => Err(ProtocolError::FileTransfer(reason.clone())),
                };
            }
            let now = Instant::now();
            if now >= deadline {
                self.finish(&mut state, Err("no complete file within timeout".to_string()));
                return Err(ProtocolError::Timeout);
            }
            let (guard, _) = self.done.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    fn notify(&self, event: Event) {
        let Some(listener) = &self.listener else {
            return;
        };
        match event {
            Event::Progress(percent, kibps) => {
                listener.on_progress(&self.name, self.size, percent, kibps)
            }
            Event::Complete(path, kibps) => {
                listener.on_progress(&self.name, self.size, 100, kibps);
                listener.on_complete(&self.name, &path, kibps);
            }
            Event::Failed(reason) => listener.on_failed(&self.name, &reason),
        }
    }
}

impl FileTransferListener for DownloadSink {
    fn chunk_received(&self, offset: u32, data: &[u8]) {
        // Mutate under the lock, invoke callbacks after releasing it
        let event = {
            let mut state = self.state.lock().unwrap();
            if state.outcome.is_some() {
                return;
            }
            // The file handle is present exactly while no outcome is recorded
            let expected = state.received;
            let written = match state.file.as_mut() {
                Some(file) if u64::from(offset) == expected => file
                    .write_all(data)
                    .map_err(|e| format!("temp file write failed: {e}")),
                Some(_) => Err(format!(
                    "chunk gap: expected offset {}, got {}",
                    expected, offset
                )),
                None => return,
            };
            match written {
                Err(reason) => {
                    warn!(file = %self.name, %reason, "download failed");
                    self.finish(&mut state, Err(reason.clone()));
                    Some(Event::Failed(reason))
                }
                Ok(()) => {
                    state.received += data.len() as u64;
                    state.chunks += 1;
                    if state.received >= self.size {
                        match state.file.take().map(|f| f.into_temp_path().keep()) {
                            Some(Ok(path)) => {
                                let kibps = self.kibps(state.received);
                                debug!(file = %self.name, ?path, kibps, "download complete");
                                self.finish(&mut state, Ok(path.clone()));
                                Some(Event::Complete(path, kibps))
                            }
                            Some(Err(e)) => {
                                let reason = format!("could not keep temp file: {e}");
                                self.finish(&mut state, Err(reason.clone()));
                                Some(Event::Failed(reason))
                            }
                            None => None,
                        }
                    } else if state.chunks % PROGRESS_CHUNK_INTERVAL == 0 {
                        let percent = ((state.received * 100) / self.size) as u32;
                        Some(Event::Progress(percent, self.kibps(state.received)))
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(event) = event {
            self.notify(event);
        }
    }
}

impl Communicator {
    /// Download `name` from the device into a named temporary file and
    /// return its path. `size` is the expected byte count from the file
    /// listing; the transfer completes when that many bytes have arrived.
    pub fn download_file(
        &self,
        name: &str,
        size: u64,
        listener: Option<Arc<dyn FileDownloadListener>>,
        timeout: Duration,
    ) -> Result<PathBuf, ProtocolError> {
        if size == 0 {
            // Nothing to transfer; hand back an empty file
            return NamedTempFile::new()?
                .into_temp_path()
                .keep()
                .map_err(|e| ProtocolError::FileTransfer(e.to_string()));
        }

        let sink = Arc::new(DownloadSink::new(name, size, listener.clone())?);
        let token = self.subscribe_file_transfer(sink.clone());
        let result = self
            .send_async(&Message::GetFile {
                name: name.to_string(),
            })
            .and_then(|_| sink.wait(timeout));
        self.unsubscribe(token);

        if let Err(e) = &result {
            // Sink-side failures have already notified the listener;
            // cover the send-error and timeout paths here
            if !matches!(e, ProtocolError::FileTransfer(_)) {
                if let Some(listener) = &listener {
                    listener.on_failed(name, &e.to_string());
                }
            }
        }
        result
    }
}
