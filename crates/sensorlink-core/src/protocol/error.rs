//! Protocol errors

use thiserror::Error;

use super::correlation::CorrelationKey;

/// Errors that can occur during device communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Response timeout")]
    Timeout,

    #[error("Not connected to device")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection closed while request was outstanding")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("A request with correlation key {0} is already outstanding")]
    DuplicateKey(CorrelationKey),

    #[error("Unexpected response from device")]
    InvalidResponse,

    #[error("File transfer failed: {0}")]
    FileTransfer(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
