//! Wire protocols layered on a [`crate::interface::Transport`].

pub mod modbus;
pub mod stb;
pub mod usbtmc;

pub use modbus::{FunctionCode, ModbusTcp};
pub use stb::{EventStatus, StatusByte};
pub use usbtmc::UsbTmc;
