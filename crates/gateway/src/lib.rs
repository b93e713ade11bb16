//! Gateway: WebSocket/HTTP front of the relay.
//!
//! Lifecycle:
//! 1. Build [`state::GatewayState`] from config, platform client and store
//! 2. Start the idle-channel sweeper
//! 3. Serve `/health`, `/ws`, `/mirror` (and `/metrics` with `prometheus`)
//! 4. On shutdown, stop accepting and shut the relay hub down
//!
//! Relay semantics live in `guildrelay-relay`; this crate only moves frames.

pub mod auth;
pub mod delivery_store;
pub mod server;
pub mod state;
pub mod ws;

pub use {
    auth::StaticTokenAuth,
    delivery_store::SqliteDeliveryStore,
    server::{build_gateway_app, start_gateway},
    state::GatewayState,
};
