//! All the errors that this crate can emit are defined in the
//! [`error::InstrumentError`] enum.

use std::io::ErrorKind;

use thiserror::Error;

/// Define errors that originate from this crate
#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum InstrumentError {
    /// No response (or no delimiter) arrived within the allotted time.
    #[error("timeout: {details}")]
    Timeout {
        /// What was being waited for.
        details: String,
    },

    /// The transport is unavailable or the peer went away. There is no
    /// automatic reconnection; the caller must re-open the transport.
    #[error("bad connection: {details}")]
    BadConnection {
        /// The details of the connection failure
        details: String,
    },

    /// A generic I/O failure, including a destination buffer that is too small
    /// for an announced transfer.
    #[error("I/O error: {details}")]
    BadIo {
        /// More information about the I/O failure.
        details: String,
    },

    /// A header field did not match what the protocol requires (wrong message id,
    /// wrong tag, malformed MBAP fields, ...).
    #[error("protocol violation: {details}")]
    BadProtocol {
        /// Which field was wrong and how.
        details: String,
    },

    /// The responder reported an exception, e.g. a Modbus exception response.
    #[error("device reported exception 0x{code:02X}: {details}")]
    DeviceError {
        /// The exception code reported by the device
        code: u8,
        /// A human-readable name for `code`
        details: String,
    },

    /// A textual reply could not be converted to the requested numeric type.
    #[error("failed to convert '{value}' to {target}")]
    ConversionError {
        /// The text that could not be converted
        value: String,
        /// The name of the target type
        target: &'static str,
    },

    /// The caller passed an argument the protocol cannot encode.
    #[error("invalid argument: {details}")]
    InvalidArgument {
        /// Why the argument was rejected.
        details: String,
    },

    /// A configuration document could not be parsed.
    #[error("configuration error: {source}")]
    ConfigError {
        #[from]
        source: serde_json::Error,
    },
}

impl From<std::io::Error> for InstrumentError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::Timeout {
                details: e.to_string(),
            },
            ErrorKind::NotConnected
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Self::BadConnection {
                details: e.to_string(),
            },
            _ => Self::BadIo {
                details: e.to_string(),
            },
        }
    }
}

pub(crate) type Result<T> = std::result::Result<T, InstrumentError>;

#[cfg(test)]
mod unit {
    use std::io::{Error, ErrorKind};

    use super::InstrumentError;

    #[test]
    fn io_errors_map_to_error_kinds() {
        assert!(matches!(
            InstrumentError::from(Error::new(ErrorKind::TimedOut, "slow")),
            InstrumentError::Timeout { .. }
        ));
        assert!(matches!(
            InstrumentError::from(Error::new(ErrorKind::ConnectionReset, "gone")),
            InstrumentError::BadConnection { .. }
        ));
        assert!(matches!(
            InstrumentError::from(Error::new(ErrorKind::InvalidData, "junk")),
            InstrumentError::BadIo { .. }
        ));
    }

    #[test]
    fn device_error_display_includes_code() {
        let e = InstrumentError::DeviceError {
            code: 2,
            details: "illegal data address".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "device reported exception 0x02: illegal data address"
        );
    }
}
