//! Device communicator
//!
//! Wires the receive loop, send serializer, dispatch pools and correlation
//! table into the public send/subscribe surface, and manages the connection
//! lifecycle.

use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::codec::{self, Message};

use super::correlation::{CorrelationKey, CorrelationTable, Resolution};
use super::dispatch::{
    ConnectionListener, DispatchPools, FileTransferListener, Listeners, MessageListener,
    ResponseListener, SubscriberToken,
};
use super::error::ProtocolError;
use super::reader::{self, ReaderContext};
use super::sender::{SendJob, SendSerializer};
use super::stats::{LinkStats, StatsSnapshot};
use super::transport::{self, Transport};
use super::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Bound on the receive loop's blocking read, so shutdown is observed
/// promptly.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Interval of the pending-request expiry sweep.
const EXPIRE_INTERVAL: Duration = Duration::from_millis(100);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Transport being opened and workers starting
    Connecting,
    /// Connected and ready
    Connected,
    /// Teardown in progress
    ShuttingDown,
}

/// Communicator configuration
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Serial port name, or `tcp://host:port` for a network bridge
    pub address: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Default response timeout in milliseconds for [`Communicator::send`]
    pub default_timeout_ms: u64,
    /// Bound of the outbound send queue
    pub send_queue_depth: usize,
    /// Bound of the message-callback queue
    pub message_queue_depth: usize,
    /// Bound of the response-callback queue
    pub response_queue_depth: usize,
    /// Bound of the file-transfer-callback queue
    pub file_queue_depth: usize,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            send_queue_depth: 32,
            message_queue_depth: 64,
            response_queue_depth: 64,
            file_queue_depth: 256,
        }
    }
}

/// The four subscriber registries of one communicator. Registrations
/// survive reconnection.
pub(crate) struct ListenerSet {
    pub message: Listeners<dyn MessageListener>,
    pub response: Listeners<dyn ResponseListener>,
    pub file: Listeners<dyn FileTransferListener>,
    pub connection: Listeners<dyn ConnectionListener>,
}

impl ListenerSet {
    fn new() -> Self {
        let tokens = Arc::new(AtomicU64::new(1));
        Self {
            message: Listeners::new(tokens.clone()),
            response: Listeners::new(tokens.clone()),
            file: Listeners::new(tokens.clone()),
            connection: Listeners::new(tokens),
        }
    }
}

/// Running machinery of one connection, built at connect and dismantled at
/// teardown.
struct Link {
    sender: SendSerializer,
    pools: Arc<DispatchPools>,
    reader: Mutex<Option<JoinHandle<()>>>,
    reader_stop: Arc<AtomicBool>,
    expire_stop: Arc<(Mutex<bool>, Condvar)>,
    expire_worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: CommConfig,
    state: Mutex<ConnectionState>,
    link: Mutex<Option<Arc<Link>>>,
    table: Arc<CorrelationTable>,
    listeners: Arc<ListenerSet>,
    stats: Arc<LinkStats>,
    dropped_events: AtomicU64,
    // Serializes connect and teardown; also makes shutdown idempotent
    teardown_lock: Mutex<()>,
}

/// Communicator for one physical device.
///
/// All methods take `&self` and are safe to call from any thread. A
/// synchronous [`Communicator::send_and_wait`] blocks only the calling
/// thread, never a worker, so subscriber callbacks may themselves issue
/// synchronous calls.
pub struct Communicator {
    shared: Arc<Shared>,
}

impl Communicator {
    /// Create a communicator (not yet connected).
    pub fn new(config: CommConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                link: Mutex::new(None),
                table: Arc::new(CorrelationTable::new()),
                listeners: Arc::new(ListenerSet::new()),
                stats: Arc::new(LinkStats::default()),
                dropped_events: AtomicU64::new(0),
                teardown_lock: Mutex::new(()),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    /// Point-in-time counters for this instance.
    pub fn stats(&self) -> StatsSnapshot {
        let mut dropped = self.shared.dropped_events.load(Ordering::Relaxed);
        if let Some(link) = self.shared.link.lock().unwrap().as_ref() {
            dropped += link.pools.dropped();
        }
        self.shared.stats.snapshot(dropped)
    }

    /// Open the configured transport and start the workers.
    pub fn connect(&self) -> Result<(), ProtocolError> {
        let config = self.shared.config.clone();
        self.connect_inner(move || transport::open(&config.address, config.baud_rate, READ_TIMEOUT))
    }

    /// Connect over an already opened transport (network bridges, tests).
    pub fn connect_with_transport(
        &self,
        transport: Box<dyn Transport>,
    ) -> Result<(), ProtocolError> {
        self.connect_inner(move || Ok(transport))
    }

    fn connect_inner(
        &self,
        open: impl FnOnce() -> Result<Box<dyn Transport>, ProtocolError>,
    ) -> Result<(), ProtocolError> {
        let shared = &self.shared;
        let _guard = shared.teardown_lock.lock().unwrap();
        {
            let mut state = shared.state.lock().unwrap();
            match *state {
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
                _ => return Err(ProtocolError::AlreadyConnected),
            }
        }

        let started = open().and_then(|transport| self.start_link(transport));
        match started {
            Ok(link) => {
                *shared.link.lock().unwrap() = Some(link.clone());
                *shared.state.lock().unwrap() = ConnectionState::Connected;
                info!(address = %shared.config.address, "connected");
                for listener in shared.listeners.connection.snapshot() {
                    link.pools
                        .message
                        .submit(Box::new(move || listener.on_connected(true)));
                }
                Ok(())
            }
            Err(e) => {
                *shared.state.lock().unwrap() = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    fn start_link(&self, transport: Box<dyn Transport>) -> Result<Arc<Link>, ProtocolError> {
        let shared = &self.shared;
        let config = &shared.config;

        let write_half = transport.try_clone_transport()?;
        let link_failed = Arc::new(AtomicBool::new(false));
        let sender = SendSerializer::start(
            write_half,
            shared.stats.clone(),
            link_failed.clone(),
            config.send_queue_depth,
        )?;
        let pools = Arc::new(DispatchPools::start(
            config.message_queue_depth,
            config.response_queue_depth,
            config.file_queue_depth,
        )?);

        let reader_stop = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(shared);
        // Teardown runs on its own thread so the receive loop stays joinable
        let on_transport_failure: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                let _ = thread::Builder::new()
                    .name("teardown".to_string())
                    .spawn(move || Shared::teardown(&shared));
            }
        });
        let reader = reader::spawn(ReaderContext {
            transport,
            table: shared.table.clone(),
            pools: pools.clone(),
            listeners: shared.listeners.clone(),
            stats: shared.stats.clone(),
            stop: reader_stop.clone(),
            link_failed,
            on_transport_failure,
        })?;

        let expire_stop = Arc::new((Mutex::new(false), Condvar::new()));
        let expire_worker = {
            let expire_stop = expire_stop.clone();
            let table = shared.table.clone();
            let stats = shared.stats.clone();
            thread::Builder::new()
                .name("expire".to_string())
                .spawn(move || loop {
                    let (lock, cvar) = &*expire_stop;
                    let stopped = lock.lock().unwrap();
                    let (stopped, _) = cvar.wait_timeout(stopped, EXPIRE_INTERVAL).unwrap();
                    if *stopped {
                        break;
                    }
                    drop(stopped);
                    let expired = table.expire(Instant::now());
                    if expired > 0 {
                        LinkStats::add(&stats.expired_requests, expired);
                        debug!(expired, "pending requests expired");
                    }
                })?
        };

        Ok(Arc::new(Link {
            sender,
            pools,
            reader: Mutex::new(Some(reader)),
            reader_stop,
            expire_stop,
            expire_worker: Mutex::new(Some(expire_worker)),
        }))
    }

    fn connected_link(&self) -> Result<Arc<Link>, ProtocolError> {
        match *self.shared.state.lock().unwrap() {
            ConnectionState::Connected => {}
            ConnectionState::ShuttingDown => return Err(ProtocolError::ConnectionClosed),
            _ => return Err(ProtocolError::NotConnected),
        }
        self.shared
            .link
            .lock()
            .unwrap()
            .clone()
            .ok_or(ProtocolError::NotConnected)
    }

    /// Send a message without waiting for a response.
    pub fn send_async(&self, message: &Message) -> Result<(), ProtocolError> {
        let link = self.connected_link()?;
        link.sender.submit(SendJob {
            frame: codec::encode(message),
            pending: None,
        })
    }

    /// Send a message and wait for its response with the configured default
    /// timeout.
    pub fn send(&self, message: &Message) -> Result<Message, ProtocolError> {
        self.send_and_wait(
            message,
            Duration::from_millis(self.shared.config.default_timeout_ms),
        )
    }

    /// Send a message and block the calling thread until the correlated
    /// response arrives or `timeout` elapses.
    pub fn send_and_wait(
        &self,
        message: &Message,
        timeout: Duration,
    ) -> Result<Message, ProtocolError> {
        let link = self.connected_link()?;
        let key = CorrelationKey(message.response_type());
        let pending = self.shared.table.register(key, timeout)?;

        let job = SendJob {
            frame: codec::encode(message),
            pending: Some(pending.clone()),
        };
        if let Err(e) = link.sender.submit(job) {
            self.shared.table.discard(key);
            pending.resolve(Resolution::Closed);
            return Err(e);
        }

        let result = pending.wait(timeout);
        match &result {
            // A local timeout leaves the entry behind: the expiry sweep
            // cleans it up, and a racing response still resolves only once.
            Err(ProtocolError::Timeout) => {
                debug!(key = %key, "no response within caller timeout");
            }
            Err(_) => self.shared.table.discard(key),
            Ok(_) => {}
        }
        result.map(|response| (*response).clone())
    }

    /// Register a handler for unsolicited messages.
    pub fn subscribe_messages(&self, listener: Arc<dyn MessageListener>) -> SubscriberToken {
        self.shared.listeners.message.add(listener)
    }

    /// Register a handler observing every response message.
    pub fn subscribe_responses(&self, listener: Arc<dyn ResponseListener>) -> SubscriberToken {
        self.shared.listeners.response.add(listener)
    }

    /// Register a handler for file-chunk messages.
    pub fn subscribe_file_transfer(
        &self,
        listener: Arc<dyn FileTransferListener>,
    ) -> SubscriberToken {
        self.shared.listeners.file.add(listener)
    }

    /// Register a handler for connection state changes.
    pub fn subscribe_connection(&self, listener: Arc<dyn ConnectionListener>) -> SubscriberToken {
        self.shared.listeners.connection.add(listener)
    }

    /// Remove a previously registered handler. Returns whether it was still
    /// registered.
    pub fn unsubscribe(&self, token: SubscriberToken) -> bool {
        let listeners = &self.shared.listeners;
        listeners.message.remove(token)
            || listeners.response.remove(token)
            || listeners.file.remove(token)
            || listeners.connection.remove(token)
    }

    /// Tear down the connection: stop accepting sends, resolve outstanding
    /// requests as closed, drain the callback pools, close the transport and
    /// notify disconnect subscribers. Idempotent.
    pub fn shutdown(&self) {
        Shared::teardown(&self.shared);
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn teardown(shared: &Arc<Shared>) {
        let _guard = shared.teardown_lock.lock().unwrap();
        {
            let mut state = shared.state.lock().unwrap();
            match *state {
                ConnectionState::Connected => *state = ConnectionState::ShuttingDown,
                // Already down, or another teardown finished while we
                // waited for the lock
                _ => return,
            }
        }
        info!("shutting down");

        let link = shared.link.lock().unwrap().take();
        if let Some(link) = link {
            // Stop accepting sends and flush the outbound queue
            link.sender.close();

            // Stop the receive loop
            link.reader_stop.store(true, Ordering::Release);
            join_worker(link.reader.lock().unwrap().take());

            // Stop the expiry sweep
            {
                let (lock, cvar) = &*link.expire_stop;
                *lock.lock().unwrap() = true;
                cvar.notify_all();
            }
            join_worker(link.expire_worker.lock().unwrap().take());

            // Resolve every outstanding request with a closed signal
            let closed = shared.table.resolve_all_closed();
            if closed > 0 {
                debug!(closed, "outstanding requests resolved as closed");
            }

            // Drain and stop the callback pools; the transport halves die
            // with the reader and the send worker
            link.pools.close();
            shared
                .dropped_events
                .fetch_add(link.pools.dropped(), Ordering::Relaxed);
        }

        *shared.state.lock().unwrap() = ConnectionState::Disconnected;

        // The pools are stopped, so disconnect subscribers are notified
        // directly on this thread
        for listener in shared.listeners.connection.snapshot() {
            if panic::catch_unwind(AssertUnwindSafe(|| listener.on_connected(false))).is_err() {
                warn!("connection listener panicked");
            }
        }
        info!("shutdown complete");
    }
}

/// Join a worker unless teardown is running on that very thread (a handler
/// may legitimately call `shutdown` from a pool worker).
fn join_worker(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CommConfig::default();
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.default_timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(config.message_queue_depth > 0);
    }

    #[test]
    fn test_initial_state() {
        let comm = Communicator::new(CommConfig::default());
        assert_eq!(comm.state(), ConnectionState::Disconnected);
        assert_eq!(comm.stats(), StatsSnapshot::default());
    }

    #[test]
    fn test_send_requires_connection() {
        let comm = Communicator::new(CommConfig::default());
        assert!(matches!(
            comm.send_async(&Message::Heartbeat),
            Err(ProtocolError::NotConnected)
        ));
        assert!(matches!(
            comm.send_and_wait(&Message::Heartbeat, Duration::from_millis(10)),
            Err(ProtocolError::NotConnected)
        ));
    }

    #[test]
    fn test_shutdown_before_connect_is_noop() {
        let comm = Communicator::new(CommConfig::default());
        comm.shutdown();
        comm.shutdown();
        assert_eq!(comm.state(), ConnectionState::Disconnected);
    }
}
