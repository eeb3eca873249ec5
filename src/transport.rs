use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Blocking byte-stream channel to an instrument.
///
/// Implementations own message termination: `write` receives one SCPI
/// message without its line ending and reports how many bytes of that
/// message reached the instrument.
pub trait Transport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read one complete response and return at most its first `max_bytes`.
    ///
    /// A response ends at its first line feed, or after the terminator of an
    /// IEEE 488.2 definite-length block (`#<n><len><data>\n`). Bytes past
    /// `max_bytes` are consumed and dropped so the next query starts clean.
    /// An empty result is reported as [`TransportError::Timeout`].
    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read(max_bytes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Partial write: {written} of {expected} bytes accepted")]
    PartialWrite { written: usize, expected: usize },

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout: no response within {0:?}")]
    Timeout(Duration),

    #[error("Connection closed by instrument")]
    Closed,
}

const TERMINATOR: &[u8] = b"\n";

/// Length of the complete response at the start of `buf`, once it is known.
fn response_len(buf: &[u8]) -> Option<usize> {
    match buf {
        [b'#', digits @ b'1'..=b'9', rest @ ..] => {
            let digits = usize::from(digits - b'0');
            let len: usize = std::str::from_utf8(rest.get(..digits)?).ok()?.parse().ok()?;
            Some(2 + digits + len + TERMINATOR.len())
        }
        _ => buf.iter().position(|&b| b == b'\n').map(|end| end + 1),
    }
}

/// Read from `reader` until one response is complete, the peer closed the
/// stream, or a read timed out after at least one byte was received.
fn read_response<R: Read>(
    reader: &mut R,
    max_bytes: usize,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let mut response = Vec::with_capacity(max_bytes.min(1 << 20));
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        let wanted = match response_len(&response) {
            Some(len) if response.len() >= len => break,
            Some(len) => (len - response.len()).min(chunk.len()),
            None => chunk.len(),
        };
        match reader.read(&mut chunk[..wanted]) {
            Ok(0) if response.is_empty() => return Err(TransportError::Closed),
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                if response.is_empty() {
                    return Err(TransportError::Timeout(timeout));
                }
                log::warn!("Response incomplete after {} bytes", response.len());
                break;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    if response.len() > max_bytes {
        log::debug!(
            "Dropping {} bytes past the {} byte read limit",
            response.len() - max_bytes,
            max_bytes
        );
        response.truncate(max_bytes);
    }
    Ok(response)
}

/// Raw SCPI socket, the LAN interface behind `TCPIP::<host>::INSTR`.
#[derive(Debug)]
pub struct SocketTransport {
    stream: TcpStream,
    timeout: Duration,
}

impl SocketTransport {
    pub const DEFAULT_PORT: u16 = 5555;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        Self::connect_with_timeout(host, port, Self::DEFAULT_TIMEOUT)
    }

    pub fn connect_with_timeout(
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, format!("cannot resolve {host}")))?;

        log::debug!("Connecting to SCPI socket at {}", addr);
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        Ok(Self { stream, timeout })
    }

    /// Drop whatever is still buffered from an earlier exchange.
    fn discard_pending(&mut self) -> Result<(), TransportError> {
        self.stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 4096];
        let drained = loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(n) => log::debug!("Discarding {} stale bytes", n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        self.stream.set_nonblocking(false)?;
        drained?;
        Ok(())
    }
}

impl Transport for SocketTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.discard_pending()?;
        self.stream.write_all(data)?;
        self.stream.write_all(TERMINATOR)?;
        Ok(data.len())
    }

    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        read_response(&mut self.stream, max_bytes, self.timeout)
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        log::debug!("Closing SCPI socket");
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// SCPI over an RS-232 or USB-serial port.
pub struct SerialTransport {
    serial: Box<dyn SerialPort>,
    timeout: Duration,
}

impl SerialTransport {
    pub const DEFAULT_BAUD_RATE: u32 = 9600;

    pub fn open(port: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let timeout = Duration::from_millis(500);
        let serial = serialport::new(port, baud_rate).timeout(timeout).open()?;

        let transport = Self { serial, timeout };
        transport.flush(serialport::ClearBuffer::All)?;
        Ok(transport)
    }

    fn flush(&self, buffer: serialport::ClearBuffer) -> Result<(), TransportError> {
        self.serial.clear(buffer)?;
        Ok(())
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.serial.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.flush(serialport::ClearBuffer::Input)?;
        self.serial.write_all(data)?;
        self.serial.write_all(TERMINATOR)?;
        Ok(data.len())
    }

    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        read_response(&mut self.serial, max_bytes, self.timeout)
    }
}
