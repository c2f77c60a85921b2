//! Transport abstraction
//!
//! A communicator owns exactly one transport. The receive loop holds the
//! read half and the send serializer the write half; the halves are obtained
//! with [`Transport::try_clone_transport`], so no other component touches
//! the underlying link.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use super::{serial, ProtocolError};

/// Prefix selecting a TCP bridge instead of a local serial port.
const TCP_PREFIX: &str = "tcp://";

/// Byte-stream link to the device.
///
/// Reads block for at most the configured read timeout; a timeout surfaces
/// as `ErrorKind::TimedOut` or `ErrorKind::WouldBlock`, which callers treat
/// as "no data yet", never as a failure.
pub trait Transport: Read + Write + Send {
    /// Bound the blocking time of subsequent reads.
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Clone the transport so reader and writer can own separate halves.
    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>>;
}

/// Serial port transport
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Wrap an already configured serial port.
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Transport for SerialTransport {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        let clone = self
            .port
            .try_clone()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Box::new(SerialTransport::new(clone)))
    }
}

/// TCP bridge transport, for devices exposed over a network serial bridge.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect to `host:port`.
    pub fn connect(addr: &str, read_timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))
    }

    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(TcpTransport {
            stream: self.stream.try_clone()?,
        }))
    }
}

/// Open the transport named by `address`: either `tcp://host:port` or a
/// serial port name.
pub fn open(
    address: &str,
    baud_rate: u32,
    read_timeout: Duration,
) -> Result<Box<dyn Transport>, ProtocolError> {
    if let Some(addr) = address.strip_prefix(TCP_PREFIX) {
        let transport = TcpTransport::connect(addr, read_timeout)
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        return Ok(Box::new(transport));
    }

    let mut port = serial::open_port(address, baud_rate, read_timeout)?;
    serial::configure_port(port.as_mut())?;
    serial::clear_buffers(port.as_mut())?;
    Ok(Box::new(SerialTransport::new(port)))
}
