//! Shared error definitions and the notification hook registry used across
//! the guildrelay crates.

pub mod error;
pub mod hooks;

pub use error::{Error, FromMessage, Result};
