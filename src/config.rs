//! Configuration for the communication layers.
//!
//! Every structure has sensible defaults, so a configuration document only
//! needs to name the values it wants to change.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default capacity bounding each raw read and write.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default timeout for a single exchange.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Settings for a [`crate::interface::Session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of bytes moved by one raw read or write.
    pub buffer_size: usize,
    /// Timeout of [`crate::interface::Session::read_default`] and
    /// [`crate::interface::Session::query_default`].
    pub timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Settings for a [`crate::protocol::usbtmc::UsbTmc`] framer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbTmcConfig {
    /// Largest response the framer announces (and accepts) per message.
    pub buffer_size: usize,
    /// Time allowed for a complete, possibly multi-packet, response read with
    /// [`crate::protocol::usbtmc::UsbTmc::read_message`].
    pub timeout_ms: u64,
    /// When set, the device is asked to end a response at this byte.
    pub term_char: Option<u8>,
}

impl Default for UsbTmcConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            term_char: None,
        }
    }
}

impl UsbTmcConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Settings for a [`crate::protocol::modbus::ModbusTcp`] client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    /// Time allowed for a complete response frame.
    pub timeout_ms: u64,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl ModbusConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Settings for the operation-complete and self-test polling loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Sleep between two polls.
    pub interval_ms: u64,
    /// Timeout for each individual query.
    pub timeout_ms: u64,
    /// Give up with a timeout after this many polls. `None` polls forever.
    pub max_polls: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_polls: None,
        }
    }
}

impl PollConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// All of the above, as read from a single document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub session: SessionConfig,
    pub usbtmc: UsbTmcConfig,
    pub modbus: ModbusConfig,
    pub poll: PollConfig,
}

impl LabConfig {
    /// Parse a JSON configuration document.
    ///
    /// # Errors
    /// [`crate::InstrumentError::ConfigError`] if the document is not valid.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod unit {
    use super::{LabConfig, DEFAULT_BUFFER_SIZE};
    use crate::InstrumentError;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = LabConfig::from_json(
            r#"{ "usbtmc": { "term_char": 10 }, "poll": { "max_polls": 5 } }"#,
        )
        .expect("document should parse");

        assert_eq!(config.usbtmc.term_char, Some(b'\n'));
        assert_eq!(config.usbtmc.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.poll.max_polls, Some(5));
        assert_eq!(config.poll.interval_ms, 100);
        assert_eq!(config.session, LabConfig::default().session);
    }

    #[test]
    fn malformed_document_is_rejected() {
        let result = LabConfig::from_json("{ \"session\": 3 ");
        assert!(matches!(result, Err(InstrumentError::ConfigError { .. })));
    }
}
