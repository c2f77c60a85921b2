//! Device Communication
//!
//! Concurrent request/response engine over a framed serial protocol.
//!
//! One dedicated receive loop reads the transport, a single-worker send
//! serializer writes it, and subscriber callbacks run on three independent
//! single-worker pools so a blocking handler can never starve response
//! delivery.

mod communicator;
mod correlation;
mod dispatch;
mod download;
mod error;
mod frame;
mod reader;
mod sender;
mod stats;

pub mod serial;
pub mod transport;

pub(crate) use communicator::ListenerSet;

pub use communicator::{CommConfig, Communicator, ConnectionState};
pub use correlation::CorrelationKey;
pub use dispatch::{
    ConnectionListener, FileTransferListener, MessageListener, ResponseListener, SubscriberToken,
};
pub use download::FileDownloadListener;
pub use error::ProtocolError;
pub use frame::FrameReassembler;
pub use stats::StatsSnapshot;

/// Default baud rate for device communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
