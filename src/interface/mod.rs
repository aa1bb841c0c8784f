//! The raw byte [`Transport`] every protocol layer runs on, and its
//! [`std::net::TcpStream`] implementation.

use std::{
    io::{ErrorKind, Read, Write},
    net::TcpStream,
    time::Duration,
};

use tracing::trace;

use crate::{error::Result, InstrumentError};

pub mod session;

pub use session::{DelimiterScan, Session};

/// The raw byte capability every physical interface (serial line, TCP socket,
/// USB bulk endpoints) must provide. The protocol layer assumes nothing beyond
/// "a read may return fewer bytes than requested, including none".
pub trait Transport {
    /// Write `data` to the interface.
    ///
    /// # Errors
    /// [`InstrumentError::BadConnection`] if the interface is gone, otherwise
    /// [`InstrumentError::BadIo`].
    fn write_raw(&mut self, data: &[u8]) -> Result<usize>;

    /// Read at most `buf.len()` bytes, waiting no longer than `timeout`.
    /// Returning `Ok(0)` means nothing arrived in time and is not an error.
    ///
    /// # Errors
    /// [`InstrumentError::BadConnection`] if the interface is gone, otherwise
    /// [`InstrumentError::BadIo`].
    fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        (**self).write_raw(data)
    }

    fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read_raw(buf, timeout)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        (**self).write_raw(data)
    }

    fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read_raw(buf, timeout)
    }
}

impl Transport for TcpStream {
    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self.write(data)?)
    }

    fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        // A zero read timeout is rejected by the socket API.
        self.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match self.read(buf) {
            Ok(0) if !buf.is_empty() => Err(InstrumentError::BadConnection {
                details: "connection closed by peer".to_string(),
            }),
            Ok(n) => {
                trace!("TCP read {n} bytes");
                Ok(n)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod unit {
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        time::Duration,
    };

    use super::Transport;
    use crate::InstrumentError;

    #[test]
    fn tcp_stream_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("should bind to loopback");
        let addr = listener.local_addr().expect("listener should have an address");
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().expect("should accept a client");
            let mut buf = [0u8; 6];
            socket
                .read_exact(&mut buf)
                .expect("should receive the query");
            assert_eq!(&buf, b"*IDN?\n");
            socket.write_all(b"ok\n").expect("should send the reply");
        });

        let mut stream = TcpStream::connect(addr).expect("should connect to loopback");
        assert_eq!(stream.write_raw(b"*IDN?\n").expect("write should succeed"), 6);

        let mut buf = [0u8; 16];
        let mut received = Vec::new();
        while received.len() < 3 {
            let n = stream
                .read_raw(&mut buf, Duration::from_millis(500))
                .expect("read should succeed");
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"ok\n");
        server.join().expect("server thread should finish");

        let result = stream.read_raw(&mut buf, Duration::from_millis(100));
        assert!(matches!(result, Err(InstrumentError::BadConnection { .. })));
    }

    #[test]
    fn tcp_stream_read_times_out_with_no_data() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("should bind to loopback");
        let addr = listener.local_addr().expect("listener should have an address");
        let mut stream = TcpStream::connect(addr).expect("should connect to loopback");
        let (_held, _) = listener.accept().expect("should accept a client");

        let mut buf = [0u8; 16];
        let n = stream
            .read_raw(&mut buf, Duration::from_millis(20))
            .expect("an idle read is not an error");
        assert_eq!(n, 0);
    }
}
