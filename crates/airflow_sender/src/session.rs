//! Serial session with one mass-flow controller.
//!
//! One exchange is `<address>\r` out, one `\r`-terminated reply back. The
//! session is generic over any [`SerialLink`] so the protocol can be driven
//! by a scripted port in tests; [`DeviceSession::open`] builds the real one on
//! top of `serialport`.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use airflow_core::config::MAX_READ_TIMEOUT_MS;
use airflow_core::protocol::{query_frame, TERMINATOR, WAKE_REPEATS};
use airflow_core::{DeviceEndpoint, Framing, RawReply};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, trace};

/// Longest single blocking read; the exchange deadline is checked between reads.
const READ_SLICE: Duration = Duration::from_millis(100);

/// Pause after a read that returned no bytes.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Time given to the controller to answer the wake queries before their
/// replies are thrown away.
const WAKE_SETTLE: Duration = Duration::from_millis(500);

/// Byte transport under a [`DeviceSession`].
pub trait SerialLink: Read + Write {
    /// Drops whatever input is already buffered.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// The configured transport could not be acquired.
#[derive(Debug, thiserror::Error)]
#[error("failed to open {path}: {source}")]
pub struct ConnectError {
    pub path: String,
    #[source]
    pub source: serialport::Error,
}

/// Errors during one query/reply exchange.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("read failed: {0}")]
    ReadFailed(#[source] io::Error),

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// Progress of the current exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    QuerySent,
    AwaitingReply,
    Complete,
    Failed,
}

/// One logical connection to a controller.
///
/// `exchange` takes `&mut self`, so a session can never run two exchanges at
/// once. Dropping the session releases the transport.
pub struct DeviceSession<P> {
    port: P,
    address: String,
    framing: Framing,
    read_timeout: Duration,
    single_read_max_len: usize,
    state: ExchangeState,
}

impl DeviceSession<Box<dyn SerialPort>> {
    /// Opens the serial device at the endpoint's line speed, 8N1, no flow control.
    pub fn open(endpoint: &DeviceEndpoint) -> Result<Self, ConnectError> {
        let port = serialport::new(&endpoint.path, endpoint.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(endpoint.read_timeout.min(READ_SLICE))
            .open()
            .map_err(|source| ConnectError {
                path: endpoint.path.clone(),
                source,
            })?;

        // Leftovers from a previous process would be taken for our reply.
        if let Err(e) = port.clear(ClearBuffer::Input) {
            debug!("could not clear input buffer on {}: {e}", endpoint.path);
        }

        info!("Opened {} at {} baud", endpoint.path, endpoint.baud_rate);
        Ok(Self::with_port(port, endpoint))
    }
}

impl<P: SerialLink> DeviceSession<P> {
    /// Wraps an already-open transport.
    pub fn with_port(port: P, endpoint: &DeviceEndpoint) -> Self {
        Self {
            port,
            address: endpoint.address.clone(),
            framing: endpoint.framing,
            read_timeout: endpoint
                .read_timeout
                .min(Duration::from_millis(MAX_READ_TIMEOUT_MS)),
            single_read_max_len: endpoint.single_read_max_len.max(1),
            state: ExchangeState::Idle,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    #[cfg(test)]
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Sends the query five times back to back without reading anything.
    ///
    /// Some controllers need line activity before they start answering. Any
    /// replies to the wake queries are discarded once the line settles.
    pub fn wake(&mut self) -> Result<(), ExchangeError> {
        let query = query_frame(&self.address);
        for _ in 0..WAKE_REPEATS {
            self.port
                .write_all(&query)
                .map_err(ExchangeError::WriteFailed)?;
        }
        self.port.flush().map_err(ExchangeError::WriteFailed)?;
        debug!("wake sequence sent to {:?}", self.address);

        std::thread::sleep(WAKE_SETTLE);
        self.discard_input();
        Ok(())
    }

    /// Queries the controller and reads one reply.
    ///
    /// Stale input left on the line is dropped before the query goes out, so
    /// the reply always answers this query.
    pub fn exchange(&mut self) -> Result<RawReply, ExchangeError> {
        self.state = ExchangeState::Idle;
        self.discard_input();
        let result = self.query().and_then(|()| {
            self.state = ExchangeState::AwaitingReply;
            match self.framing {
                Framing::Terminated => self.read_terminated(),
                Framing::SingleRead => self.read_single(),
            }
        });
        self.state = match &result {
            Ok(_) => ExchangeState::Complete,
            Err(_) => ExchangeState::Failed,
        };
        result
    }

    /// Releases the transport.
    pub fn close(self) {
        debug!("closing session for {:?}", self.address);
    }

    fn discard_input(&mut self) {
        if let Err(e) = self.port.discard_input() {
            debug!("could not discard input for {:?}: {e}", self.address);
        }
    }

    fn query(&mut self) -> Result<(), ExchangeError> {
        let query = query_frame(&self.address);
        self.port
            .write_all(&query)
            .and_then(|()| self.port.flush())
            .map_err(ExchangeError::WriteFailed)?;
        self.state = ExchangeState::QuerySent;
        trace!("query sent: {:?}", String::from_utf8_lossy(&query));
        Ok(())
    }

    /// Reads until the terminator and returns everything up to and including it.
    ///
    /// Bytes that arrived in the same chunk after the terminator are dropped.
    fn read_terminated(&mut self) -> Result<RawReply, ExchangeError> {
        let deadline = Instant::now() + self.read_timeout;
        let mut reply = Vec::with_capacity(64);
        let mut chunk = [0u8; 64];

        loop {
            let n = self.read_chunk(&mut chunk, deadline)?;
            match chunk[..n].iter().position(|&b| b == TERMINATOR) {
                Some(pos) => {
                    reply.extend_from_slice(&chunk[..=pos]);
                    let trailing = n - pos - 1;
                    if trailing > 0 {
                        debug!("discarded {trailing} bytes after terminator");
                    }
                    return Ok(RawReply::new(reply));
                }
                None => reply.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Legacy framing: the first non-empty read is the whole reply.
    fn read_single(&mut self) -> Result<RawReply, ExchangeError> {
        let deadline = Instant::now() + self.read_timeout;
        let mut buf = vec![0u8; self.single_read_max_len];
        let n = self.read_chunk(&mut buf, deadline)?;
        buf.truncate(n);
        Ok(RawReply::new(buf))
    }

    /// Blocks until at least one byte is read, a hard error occurs, or the
    /// deadline passes.
    fn read_chunk(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize, ExchangeError> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ExchangeError::Timeout(self.read_timeout));
            }
            match self.port.read(buf) {
                Ok(0) => std::thread::sleep(IDLE_POLL.min(deadline - now)),
                Ok(n) => return Ok(n),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(ExchangeError::ReadFailed(e)),
            }
        }
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
