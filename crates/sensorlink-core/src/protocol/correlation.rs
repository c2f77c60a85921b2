//! Request/response correlation
//!
//! Maps each outstanding request's correlation key to the caller waiting
//! for its response. Every pending request is resolved exactly once: by the
//! matching response, by the expiry sweep, by a failed send, or by
//! connection teardown, whichever happens first.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::codec::Message;

use super::error::ProtocolError;

/// Correlation key: the message-type byte of the expected response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey(
    /// The response message-type byte.
    pub u8,
);

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Terminal outcome written into a pending request's result slot.
#[derive(Debug, Clone)]
pub(crate) enum Resolution {
    /// The matching response arrived.
    Response(Arc<Message>),
    /// The deadline passed with no response.
    TimedOut,
    /// The connection was torn down while the request was outstanding.
    Closed,
    /// The transport write for this request failed.
    SendFailed(String),
}

/// One in-flight request awaiting its response.
#[derive(Debug)]
pub(crate) struct Pending {
    key: CorrelationKey,
    deadline: Instant,
    slot: Mutex<Option<Resolution>>,
    resolved: Condvar,
}

impl Pending {
    fn new(key: CorrelationKey, timeout: Duration) -> Self {
        Self {
            key,
            deadline: Instant::now() + timeout,
            slot: Mutex::new(None),
            resolved: Condvar::new(),
        }
    }

    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    /// Write the outcome if the slot is still empty. First writer wins;
    /// later attempts are no-ops.
    pub fn resolve(&self, resolution: Resolution) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(resolution);
        self.resolved.notify_all();
        true
    }

    fn is_resolved(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Block the calling thread until the slot is written or `timeout`
    /// elapses. A local timeout leaves the slot untouched; the table entry
    /// is cleaned up later by the expiry sweep.
    pub fn wait(&self, timeout: Duration) -> Result<Arc<Message>, ProtocolError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(resolution) = slot.as_ref() {
                return match resolution {
                    Resolution::Response(message) => Ok(message.clone()),
                    Resolution::TimedOut => Err(ProtocolError::Timeout),
                    Resolution::Closed => Err(ProtocolError::ConnectionClosed),
                    Resolution::SendFailed(reason) => {
                        Err(ProtocolError::SendFailed(reason.clone()))
                    }
                };
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ProtocolError::Timeout);
            }
            let (guard, _) = self.resolved.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }
}

/// Table of outstanding requests, keyed by correlation key.
///
/// Mutated by caller threads (register) and the receive loop (resolve); the
/// lock is held only for the brief map operation, never across a wait.
#[derive(Debug, Default)]
pub(crate) struct CorrelationTable {
    entries: Mutex<HashMap<CorrelationKey, Arc<Pending>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending request.
    ///
    /// Fails with `DuplicateKey` while an unresolved entry holds the key; a
    /// key becomes reusable the moment its previous entry is resolved.
    pub fn register(
        &self,
        key: CorrelationKey,
        timeout: Duration,
    ) -> Result<Arc<Pending>, ProtocolError> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(&key) {
            if !existing.is_resolved() {
                return Err(ProtocolError::DuplicateKey(key));
            }
        }
        let pending = Arc::new(Pending::new(key, timeout));
        entries.insert(key, pending.clone());
        Ok(pending)
    }

    /// Resolve the entry for `key` with a response. Returns whether an
    /// unresolved waiter existed.
    pub fn resolve(&self, key: CorrelationKey, message: Arc<Message>) -> bool {
        let pending = self.entries.lock().unwrap().remove(&key);
        match pending {
            Some(pending) => pending.resolve(Resolution::Response(message)),
            None => false,
        }
    }

    /// Drop the entry for `key` without resolving it through the table,
    /// for callers that already resolved their own handle.
    pub fn discard(&self, key: CorrelationKey) {
        self.entries.lock().unwrap().remove(&key);
    }

    /// Resolve every entry whose deadline has passed with a timeout signal.
    /// Returns how many entries expired.
    pub fn expire(&self, now: Instant) -> u64 {
        let expired: Vec<Arc<Pending>> = {
            let mut entries = self.entries.lock().unwrap();
            let keys: Vec<CorrelationKey> = entries
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key))
                .collect()
        };
        let mut count = 0;
        for pending in expired {
            if pending.resolve(Resolution::TimedOut) {
                count += 1;
            }
        }
        count
    }

    /// Resolve every remaining entry with a connection-closed signal.
    pub fn resolve_all_closed(&self) -> u64 {
        let drained: Vec<Arc<Pending>> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain().map(|(_, p)| p).collect()
        };
        let mut count = 0;
        for pending in drained {
            if pending.resolve(Resolution::Closed) {
                count += 1;
            }
        }
        count
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
