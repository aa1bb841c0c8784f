//! The labcomm crate provides the pieces needed to talk to laboratory
//! instruments at several levels of abstraction:
//!
//! - [`interface::Transport`]: the raw byte capability of a physical interface
//! - [`interface::Session`]: buffered, timeout-bounded text and binary exchanges
//! - [`protocol::usbtmc::UsbTmc`]: USBTMC bulk message framing
//! - [`protocol::modbus::ModbusTcp`]: a Modbus-TCP client codec
//! - [`instrument::CommonCommands`]: IEEE 488.2 status and polling commands
//!
//! Everything is synchronous and half duplex. One instance must not be used
//! from several threads at once.

pub mod config;
pub mod convert;
pub mod error;
pub mod instrument;
pub mod interface;
pub mod protocol;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::LabConfig;
pub use convert::convert_to;
pub use error::InstrumentError;
pub use instrument::{CommonCommands, Identity};
pub use interface::{DelimiterScan, Session, Transport};
pub use protocol::{modbus::ModbusTcp, usbtmc::UsbTmc};
