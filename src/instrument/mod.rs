//! Instrument level helpers built on a [`crate::interface::Session`].

pub mod common;
pub mod info;

pub use common::CommonCommands;
pub use info::Identity;
