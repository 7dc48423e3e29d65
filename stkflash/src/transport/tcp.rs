//! TCP transport to the bridge's serial data port.

use {
    crate::{
        error::{Error, Result},
        transport::Transport,
    },
    log::{debug, trace},
    std::{
        io::{ErrorKind, Read, Write},
        net::{SocketAddr, TcpStream, ToSocketAddrs},
        time::Duration,
    },
};

/// Shortest read timeout handed to the socket; zero would mean "block forever".
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Transport over a TCP connection.
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Connect to `addr`, trying every resolved address in turn.
    pub fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<Self> {
        let stream = connect_stream(addr, timeout)?;
        Self::from_stream(stream)
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true).map_err(connection_error)?;
        let peer = stream.peer_addr().map_err(connection_error)?;
        debug!("Data channel connected to {peer}");
        Ok(Self { stream, peer })
    }

    /// Address of the bridge.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("TX {bytes:02X?}");
        self.stream.write_all(bytes).map_err(connection_error)?;
        self.stream.flush().map_err(connection_error)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.stream
            .set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))
            .map_err(connection_error)?;

        match self.stream.read(buf) {
            Ok(0) => Err(Error::Connection(format!(
                "{} closed the connection",
                self.peer
            ))),
            Ok(n) => {
                trace!("RX {:02X?}", &buf[..n]);
                Ok(n)
            },
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Err(
                Error::Timeout(format!("no data within {}ms", timeout.as_millis())),
            ),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(connection_error(e)),
        }
    }
}

/// Open a TCP stream with a connect timeout on each resolved address.
pub(crate) fn connect_stream<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<TcpStream> {
    let addrs = addr.to_socket_addrs().map_err(connection_error)?;
    let mut last_error = None;

    for candidate in addrs {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connecting to {candidate} failed: {e}");
                last_error = Some(e);
            },
        }
    }

    Err(last_error.map_or_else(
        || Error::Connection("address did not resolve".into()),
        connection_error,
    ))
}

fn connection_error(e: std::io::Error) -> Error {
    Error::Connection(e.to_string())
}
