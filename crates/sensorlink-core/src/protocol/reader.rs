//! Receive loop
//!
//! The only reader of the transport. Pulls bytes with a bounded timeout,
//! drives the frame reassembler, classifies each decoded message and routes
//! it to the correlation table or the dispatch pools. Subscriber code is
//! never invoked on this thread.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::codec::Message;

use super::correlation::{CorrelationKey, CorrelationTable};
use super::dispatch::DispatchPools;
use super::frame::FrameReassembler;
use super::stats::LinkStats;
use super::transport::Transport;
use super::ListenerSet;

pub(crate) struct ReaderContext {
    pub transport: Box<dyn Transport>,
    pub table: Arc<CorrelationTable>,
    pub pools: Arc<DispatchPools>,
    pub listeners: Arc<ListenerSet>,
    pub stats: Arc<LinkStats>,
    pub stop: Arc<AtomicBool>,
    pub link_failed: Arc<AtomicBool>,
    /// Invoked exactly once when the loop exits because the transport
    /// failed rather than because shutdown asked it to stop.
    pub on_transport_failure: Box<dyn FnOnce() + Send>,
}

pub(crate) fn spawn(ctx: ReaderContext) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("reader".to_string())
        .spawn(move || run(ctx))
}

fn run(mut ctx: ReaderContext) {
    let mut reassembler = FrameReassembler::new();
    let mut buf = [0u8; 1024];
    let mut counted_errors = 0u64;

    let failed = loop {
        if ctx.stop.load(Ordering::Acquire) {
            break false;
        }
        if ctx.link_failed.load(Ordering::Acquire) {
            debug!("send worker reported link failure");
            break true;
        }
        match ctx.transport.read(&mut buf) {
            // EOF: the peer or the OS closed the link
            Ok(0) => {
                debug!("transport returned EOF");
                break true;
            }
            Ok(n) => {
                LinkStats::add(&ctx.stats.rx_bytes, n as u64);
                for message in reassembler.feed(&buf[..n]) {
                    LinkStats::add(&ctx.stats.rx_frames, 1);
                    route(&ctx, Arc::new(message));
                }
                let errors = reassembler.decode_errors();
                if errors > counted_errors {
                    LinkStats::add(&ctx.stats.decode_errors, errors - counted_errors);
                    counted_errors = errors;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "transport read failed");
                break true;
            }
        }
    };

    debug!(failed, "receive loop exited");
    if failed {
        ctx.link_failed.store(true, Ordering::Release);
        (ctx.on_transport_failure)();
    }
}

/// Classify one decoded message and route it.
fn route(ctx: &ReaderContext, message: Arc<Message>) {
    if message.is_response() {
        let key = CorrelationKey(message.msg_type());
        let had_waiter = ctx.table.resolve(key, message.clone());
        debug!(key = %key, had_waiter, "response received");
        // Observers get a copy whether or not a caller was waiting
        for listener in ctx.listeners.response.snapshot() {
            let message = message.clone();
            ctx.pools
                .response
                .submit(Box::new(move || listener.response_received(&message)));
        }
    } else if message.is_file_chunk() {
        for listener in ctx.listeners.file.snapshot() {
            let message = message.clone();
            ctx.pools.file.submit(Box::new(move || {
                if let Message::FileData { offset, data } = &*message {
                    listener.chunk_received(*offset, data);
                }
            }));
        }
    } else {
        debug!(msg_type = message.msg_type(), "unsolicited message received");
        for listener in ctx.listeners.message.snapshot() {
            let message = message.clone();
            ctx.pools
                .message
                .submit(Box::new(move || listener.message_received(&message)));
        }
    }
}
