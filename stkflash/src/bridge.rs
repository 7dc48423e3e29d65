//! Reset control through the bridge's AT command channel.
//!
//! The bridge forwards one TCP port to the target UART and exposes a second
//! port that accepts AT commands. Its `GPIO0` pin drives the target's reset
//! line, so toggling it restarts the target into its bootloader.
//!
//! Commands are sent without line terminators and each reply is read with a
//! single bounded read.

use {
    crate::{
        error::{Error, Result},
        transport::tcp::connect_stream,
    },
    log::{debug, trace, warn},
    std::{
        io::{ErrorKind, Read, Write},
        net::{TcpStream, ToSocketAddrs},
        time::Duration,
    },
};

/// Escape sequence switching the bridge into command mode.
const ENTER_AT: &[u8] = b"+++";
/// Drive the reset line low.
const GPIO_LOW: &[u8] = b"AT+GPIO0=0";
/// Drive the reset line high.
const GPIO_HIGH: &[u8] = b"AT+GPIO0=1";
/// Query the reset line.
const GPIO_QUERY: &[u8] = b"AT+GPIO0=?";
/// Leave command mode.
const EXIT_AT: &[u8] = b"AT+EXITAT";

/// Something that can restart the target into its bootloader.
pub trait ResetControl {
    /// Pulse the reset line.
    fn reset(&mut self) -> Result<()>;

    /// Return the reset line to its idle state and leave command mode.
    fn release(&mut self) -> Result<()>;
}

/// AT dialect spoken by the bridge's control port.
pub struct AtBridge<S: Read + Write> {
    stream: S,
}

impl AtBridge<TcpStream> {
    /// Connect to the control port.
    ///
    /// `timeout` bounds both the connect and every reply read.
    pub fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<Self> {
        let stream = connect_stream(addr, timeout)?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| Error::Connection(e.to_string()))?;
        if let Ok(peer) = stream.peer_addr() {
            debug!("Control channel connected to {peer}");
        }
        Ok(Self::new(stream))
    }
}

impl<S: Read + Write> AtBridge<S> {
    /// Wrap a connected control stream.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Consume the bridge and return the stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn send(&mut self, command: &[u8]) -> Result<()> {
        trace!("AT> {}", String::from_utf8_lossy(command));
        self.stream
            .write_all(command)
            .and_then(|()| self.stream.flush())
            .map_err(|e| Error::Connection(e.to_string()))
    }

    /// Send `command` and read one reply of at most `max` bytes.
    ///
    /// A missing reply is not an error; the bridge does not always answer.
    fn command(&mut self, command: &[u8], max: usize) -> Result<Vec<u8>> {
        self.send(command)?;

        let mut buf = vec![0u8; max];
        let n = match self.stream.read(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => 0,
            Err(e) => return Err(Error::Connection(e.to_string())),
        };
        buf.truncate(n);
        trace!("AT< {:?}", String::from_utf8_lossy(&buf));
        Ok(buf)
    }

    /// Send a command whose reply should acknowledge it.
    fn expect_ok(&mut self, command: &[u8]) -> Result<()> {
        let reply = self.command(command, 4)?;
        if !reply.windows(2).any(|w| w == b"OK") {
            warn!(
                "{} answered {:?}",
                String::from_utf8_lossy(command),
                String::from_utf8_lossy(&reply)
            );
        }
        Ok(())
    }
}

impl<S: Read + Write> ResetControl for AtBridge<S> {
    fn reset(&mut self) -> Result<()> {
        debug!("Pulsing target reset");
        self.send(ENTER_AT)?;
        self.expect_ok(GPIO_LOW)?;
        self.expect_ok(GPIO_HIGH)
    }

    fn release(&mut self) -> Result<()> {
        debug!("Releasing target reset");
        self.command(GPIO_LOW, 4)?;
        let state = self.command(GPIO_QUERY, 8)?;
        debug!("GPIO0 state {:?}", String::from_utf8_lossy(&state));
        self.command(EXIT_AT, 14)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Stream answering each write with the next scripted reply.
    #[derive(Default)]
    struct MockStream {
        replies: VecDeque<Vec<u8>>,
        pending: VecDeque<u8>,
        written: Vec<Vec<u8>>,
    }

    impl MockStream {
        fn with_replies(replies: &[&[u8]]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.to_vec()).collect(),
                ..Self::default()
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.pending.len());
            for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.push(buf.to_vec());
            if buf != ENTER_AT {
                if let Some(reply) = self.replies.pop_front() {
                    self.pending.extend(reply);
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_reset_sequence() {
        let mut bridge = AtBridge::new(MockStream::with_replies(&[b"OK\r\n", b"OK\r\n"]));
        bridge.reset().unwrap();

        let stream = bridge.into_inner();
        assert_eq!(
            stream.written,
            vec![b"+++".to_vec(), b"AT+GPIO0=0".to_vec(), b"AT+GPIO0=1".to_vec()]
        );
    }

    #[test]
    fn test_reset_tolerates_silent_bridge() {
        let mut bridge = AtBridge::new(MockStream::default());
        assert!(bridge.reset().is_ok());
    }

    #[test]
    fn test_release_sequence_reads_bounded_replies() {
        let mut bridge = AtBridge::new(MockStream::with_replies(&[
            b"OK\r\n",
            b"+GPIO0:0",
            b"exit AT mode\r\n",
        ]));
        bridge.release().unwrap();

        let stream = bridge.into_inner();
        assert_eq!(
            stream.written,
            vec![
                b"AT+GPIO0=0".to_vec(),
                b"AT+GPIO0=?".to_vec(),
                b"AT+EXITAT".to_vec()
            ]
        );
        assert!(stream.pending.is_empty());
    }

    #[test]
    fn test_write_failure_is_connection_error() {
        struct Broken;

        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Ok(0)
            }
        }

        impl Write for Broken {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(ErrorKind::BrokenPipe.into())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let err = AtBridge::new(Broken).reset().unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
