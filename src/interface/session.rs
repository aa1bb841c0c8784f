//! Buffered, timeout-bounded request/response exchanges on top of a raw
//! [`Transport`].

use std::time::{Duration, Instant};

use tracing::{debug, instrument, trace, warn};

use crate::{
    config::{SessionConfig, DEFAULT_BUFFER_SIZE, DEFAULT_TIMEOUT_MS},
    error::Result,
    interface::Transport,
    InstrumentError,
};

/// Data accumulated by [`Session::read_until`] together with the position of
/// the first occurrence of the delimiter in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimiterScan {
    /// Everything read, including the delimiter and anything after it.
    pub data: String,
    /// Byte offset at which the delimiter starts.
    pub position: usize,
}

impl DelimiterScan {
    /// The text preceding the delimiter.
    #[must_use]
    pub fn before_delimiter(&self) -> &str {
        &self.data[..self.position]
    }
}

/// Turns raw byte I/O into text- and delimiter-oriented exchanges. Every raw
/// read and write is bounded by the session capacity.
///
/// A session can own its transport or borrow one (`Session::new(&mut stream)`),
/// since `&mut T` is itself a [`Transport`].
#[derive(Debug)]
pub struct Session<T: Transport> {
    transport: T,
    capacity: usize,
    timeout: Duration,
}

impl<T: Transport> Session<T> {
    #[must_use]
    pub const fn new(transport: T) -> Self {
        Self {
            transport,
            capacity: DEFAULT_BUFFER_SIZE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    #[must_use]
    pub fn with_config(transport: T, config: &SessionConfig) -> Self {
        Self {
            transport,
            capacity: config.buffer_size.max(1),
            timeout: config.timeout(),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// The timeout used by [`Session::read_default`] and
    /// [`Session::query_default`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    #[must_use]
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Write `text` as is. No terminator is appended. Text longer than the
    /// session capacity is truncated.
    ///
    /// # Errors
    /// Any error reported by the transport.
    pub fn write(&mut self, text: &str) -> Result<usize> {
        self.write_bytes(text.as_bytes())
    }

    /// Binary analogue of [`Session::write`].
    ///
    /// # Errors
    /// Any error reported by the transport.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        if data.len() > self.capacity {
            warn!(
                "truncating {} byte write to capacity {}",
                data.len(),
                self.capacity
            );
        }
        let data = &data[..data.len().min(self.capacity)];
        let written = self.transport.write_raw(data)?;
        trace!("wrote {written} bytes: {}", String::from_utf8_lossy(data));
        Ok(written)
    }

    /// Issue one raw read of at most `max_len` bytes (clamped to the session
    /// capacity). An empty result means nothing arrived within `timeout`.
    ///
    /// # Errors
    /// Any error reported by the transport.
    pub fn read_bytes(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max_len.min(self.capacity)];
        let read = self.transport.read_raw(&mut buf, timeout)?;
        buf.truncate(read);
        trace!("read {} bytes", buf.len());
        Ok(buf)
    }

    /// Issue one raw read and return whatever text arrived.
    ///
    /// # Errors
    /// Any error reported by the transport.
    pub fn read(&mut self, timeout: Duration) -> Result<String> {
        let buf = self.read_bytes(self.capacity, timeout)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// [`Session::read`] with the configured timeout.
    ///
    /// # Errors
    /// Any error reported by the transport.
    pub fn read_default(&mut self) -> Result<String> {
        self.read(self.timeout)
    }

    /// Keep reading until `delimiter` shows up in the accumulated data.
    ///
    /// `timeout` is a single deadline measured from the start of the call. It
    /// is checked after every read, before a found delimiter is accepted, so
    /// data that only completes after the deadline is reported as a timeout.
    ///
    /// # Errors
    /// - [`InstrumentError::Timeout`] if the deadline passes first
    /// - [`InstrumentError::InvalidArgument`] for an empty delimiter
    /// - Any error reported by the transport
    #[instrument(skip(self))]
    pub fn read_until(&mut self, delimiter: &str, timeout: Duration) -> Result<DelimiterScan> {
        if delimiter.is_empty() {
            return Err(InstrumentError::InvalidArgument {
                details: "delimiter must not be empty".to_string(),
            });
        }

        let start = Instant::now();
        let mut accumulated: Vec<u8> = Vec::new();
        loop {
            let chunk = self.read_bytes(self.capacity, timeout)?;
            accumulated.extend_from_slice(&chunk);
            let text = String::from_utf8_lossy(&accumulated);
            let position = text.find(delimiter);

            if start.elapsed() > timeout {
                warn!(
                    "delimiter {delimiter:?} not received within {timeout:?}, discarding {} bytes",
                    accumulated.len()
                );
                return Err(InstrumentError::Timeout {
                    details: format!("did not receive delimiter {delimiter:?} in time"),
                });
            }

            if let Some(position) = position {
                debug!("delimiter found at {position}");
                return Ok(DelimiterScan {
                    data: text.into_owned(),
                    position,
                });
            }
        }
    }

    /// [`Session::write`] followed by [`Session::read`].
    ///
    /// # Errors
    /// Any error reported by the transport.
    pub fn query(&mut self, text: &str, timeout: Duration) -> Result<String> {
        self.write(text)?;
        self.read(timeout)
    }

    /// [`Session::query`] with the configured timeout.
    ///
    /// # Errors
    /// Any error reported by the transport.
    pub fn query_default(&mut self, text: &str) -> Result<String> {
        self.query(text, self.timeout)
    }

    /// [`Session::write_bytes`] followed by one raw read of up to the session
    /// capacity.
    ///
    /// # Errors
    /// Any error reported by the transport.
    pub fn query_bytes(&mut self, data: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.write_bytes(data)?;
        self.read_bytes(self.capacity, timeout)
    }
}

#[cfg(test)]
mod unit {
    use std::time::Duration;

    use mockall::{mock, Sequence};

    use super::Session;
    use crate::{
        config::SessionConfig, interface, test_util::ScriptedTransport, InstrumentError,
    };

    const TIMEOUT: Duration = Duration::from_millis(50);

    #[test]
    fn write_adds_no_terminator_and_truncates_to_capacity() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();

        transport
            .expect_write_raw()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|data: &[u8]| data == b"*RST")
            .returning(|data: &[u8]| Ok(data.len()));
        transport
            .expect_write_raw()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|data: &[u8]| data == b"0123")
            .returning(|data: &[u8]| Ok(data.len()));

        let mut session = Session::with_config(
            transport,
            &SessionConfig {
                buffer_size: 4,
                ..SessionConfig::default()
            },
        );
        assert_eq!(session.write("*RST").expect("write should succeed"), 4);
        assert_eq!(session.write("0123456789").expect("write should succeed"), 4);
    }

    #[test]
    fn read_is_bounded_by_capacity() {
        let mut transport = MockTransport::new();
        transport
            .expect_read_raw()
            .times(1)
            .withf(|buf: &[u8], _| buf.len() == 8)
            .returning(|buf: &mut [u8], _| {
                buf[..3].copy_from_slice(b"1.5");
                Ok(3)
            });

        let mut session = Session::with_config(
            transport,
            &SessionConfig {
                buffer_size: 8,
                ..SessionConfig::default()
            },
        );
        assert_eq!(session.read(TIMEOUT).expect("read should succeed"), "1.5");
    }

    #[test]
    fn configured_timeout_is_the_default() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();

        transport
            .expect_write_raw()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|data: &[u8]| data == b"*OPC?\n")
            .returning(|data: &[u8]| Ok(data.len()));
        transport
            .expect_read_raw()
            .times(2)
            .in_sequence(&mut seq)
            .withf(|_, timeout: &Duration| *timeout == Duration::from_millis(250))
            .returning(|buf: &mut [u8], _| {
                buf[..2].copy_from_slice(b"1\n");
                Ok(2)
            });

        let mut session = Session::with_config(
            transport,
            &SessionConfig {
                timeout_ms: 250,
                ..SessionConfig::default()
            },
        );
        assert_eq!(session.timeout(), Duration::from_millis(250));
        assert_eq!(session.query_default("*OPC?\n").expect("query should succeed"), "1\n");
        assert_eq!(session.read_default().expect("read should succeed"), "1\n");
    }

    #[test]
    fn read_with_no_data_is_empty() {
        let mut session = Session::new(ScriptedTransport::new());
        assert_eq!(session.read(TIMEOUT).expect("read should succeed"), "");
    }

    #[test]
    fn read_until_accumulates_partial_reads() {
        let transport = ScriptedTransport::new()
            .reply("+1.23")
            .reply("E-3")
            .reply("\nrest");
        let mut session = Session::new(transport);

        let scan = session
            .read_until("\n", Duration::from_secs(1))
            .expect("delimiter should be found");
        assert_eq!(scan.data, "+1.23E-3\nrest");
        assert_eq!(scan.position, 8);
        assert_eq!(scan.before_delimiter(), "+1.23E-3");
        assert_eq!(session.transport_mut().reads, 3);
    }

    #[test]
    fn read_until_finds_delimiter_split_across_reads() {
        let transport = ScriptedTransport::new().reply("OK\r").reply("\n");
        let mut session = Session::new(transport);

        let scan = session
            .read_until("\r\n", Duration::from_secs(1))
            .expect("delimiter should be found");
        assert_eq!(scan.position, 2);
    }

    #[test]
    fn read_until_times_out_on_late_data() {
        let transport = ScriptedTransport::new()
            .reply("AB")
            .reply_after(Duration::from_millis(60), "C\n");
        let mut session = Session::new(transport);

        let result = session.read_until("\n", TIMEOUT);
        assert!(matches!(result, Err(InstrumentError::Timeout { .. })));
    }

    #[test]
    fn read_until_times_out_when_nothing_arrives() {
        let mut session = Session::new(ScriptedTransport::new());
        let result = session.read_until("\n", Duration::from_millis(5));
        assert!(matches!(result, Err(InstrumentError::Timeout { .. })));
    }

    #[test]
    fn read_until_rejects_empty_delimiter() {
        let mut session = Session::new(ScriptedTransport::new());
        let result = session.read_until("", TIMEOUT);
        assert!(matches!(
            result,
            Err(InstrumentError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn query_writes_then_reads() {
        let mut transport = ScriptedTransport::new().reply("KEYSIGHT,33500B,MY1,1.0\n");
        let mut session = Session::new(&mut transport);

        let reply = session
            .query("*IDN?\n", TIMEOUT)
            .expect("query should succeed");
        assert_eq!(reply, "KEYSIGHT,33500B,MY1,1.0\n");
        assert_eq!(transport.writes, vec![b"*IDN?\n".to_vec()]);
    }

    #[test]
    fn query_bytes_is_binary_safe() {
        let mut transport = ScriptedTransport::new().reply([0x00, 0xFF, 0x10]);
        let mut session = Session::new(&mut transport);

        let reply = session
            .query_bytes(&[0xAA, 0x00], TIMEOUT)
            .expect("query should succeed");
        assert_eq!(reply, vec![0x00, 0xFF, 0x10]);
        assert_eq!(transport.writes, vec![vec![0xAA, 0x00]]);
    }

    #[test]
    fn transport_errors_propagate_unchanged() {
        let mut transport = MockTransport::new();
        transport.expect_read_raw().returning(|_, _| {
            Err(InstrumentError::BadConnection {
                details: "unplugged".to_string(),
            })
        });
        let mut session = Session::new(transport);

        let result = session.read_until("\n", TIMEOUT);
        assert!(matches!(result, Err(InstrumentError::BadConnection { .. })));
    }

    mock! {
        Transport {}

        impl interface::Transport for Transport {
            fn write_raw(&mut self, data: &[u8]) -> crate::error::Result<usize>;
            fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> crate::error::Result<usize>;
        }
    }
}
