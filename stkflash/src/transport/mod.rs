//! Byte-stream transport abstraction.
//!
//! The protocol engine never touches sockets directly. It talks to a
//! [`Transport`], which is satisfied by a TCP connection to the bridge's
//! data port in production and by an in-memory simulated bootloader in
//! tests.
//!
//! ```text
//! +------------------+
//! |  Stk500Flasher   |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! | Transport Trait  |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |   TcpTransport   |  ---- TCP ---->  bridge ---- UART ---->  target
//! +------------------+
//! ```
//!
//! Every receive is bounded by a timeout; a transport never blocks
//! indefinitely.

pub mod tcp;

#[cfg(test)]
pub(crate) mod fake;

use crate::error::{Error, Result};
use log::trace;
use std::time::{Duration, Instant};

pub use tcp::TcpTransport;

/// Poll interval used when discarding stale input.
pub const DISCARD_POLL: Duration = Duration::from_millis(1);

/// Upper bound on polls per discard, so a chattering peer cannot stall us.
pub const DISCARD_MAX_POLLS: usize = 10;

/// Duplex byte stream used by the protocol engine.
pub trait Transport {
    /// Send all bytes.
    ///
    /// Fails with [`Error::Connection`] when the stream is broken.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Receive up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns the number of bytes received, or [`Error::Timeout`] when
    /// nothing arrived in time.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Receive exactly `n` bytes within `timeout`.
    fn receive_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut data = vec![0u8; n];
        let mut filled = 0;

        while filled < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receive(&mut data[filled..], remaining) {
                Ok(count) => filled += count,
                Err(Error::Timeout(_)) => {
                    return Err(Error::Timeout(format!(
                        "received {filled} of {n} bytes within {}ms",
                        timeout.as_millis()
                    )));
                },
                Err(e) => return Err(e),
            }
        }

        Ok(data)
    }

    /// Drop any bytes already waiting on the stream.
    ///
    /// Returns the number of bytes discarded.
    fn discard_pending(&mut self) -> Result<usize> {
        let mut buf = [0u8; 128];
        let mut discarded = 0;

        for _ in 0..DISCARD_MAX_POLLS {
            match self.receive(&mut buf, DISCARD_POLL) {
                Ok(count) => {
                    trace!("Discarding {:02X?}", &buf[..count]);
                    discarded += count;
                },
                Err(Error::Timeout(_)) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(discarded)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).send(bytes)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).receive(buf, timeout)
    }

    fn receive_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        (**self).receive_exact(n, timeout)
    }

    fn discard_pending(&mut self) -> Result<usize> {
        (**self).discard_pending()
    }
}
