//! Discord adapter: webhooks act as send endpoints, the bot token covers
//! channel lookups, direct sends and webhook provisioning.

pub mod client;
pub mod error;
pub mod mirror;

pub use {
    client::DiscordClient,
    error::{Error, Result},
    mirror::{decode_dispatch, decode_event},
};
