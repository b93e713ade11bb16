//! Bidirectional relay between duplex client sessions and a guild-chat
//! platform.
//!
//! Client sends go through [`outbound::RelayWorker`] to the platform; the
//! platform's echo feed comes back through [`reconciler::MirrorReconciler`].
//! Both paths end in [`hub::RelayHub::enqueue`], which assigns per-channel
//! sequence numbers, drops duplicates, and fans batches out to subscribers.

pub mod auth;
pub mod endpoint;
pub mod error;
pub mod formatter;
pub mod hub;
pub mod outbound;
pub mod platform;
pub mod reconciler;
pub mod scheduler;
pub mod store;
pub mod subscriptions;
pub mod suppression;
pub mod types;

#[cfg(test)]
mod testing;

pub use {
    auth::AuthResolver,
    error::{Error, Result},
    formatter::{FormattedMessage, Formatter},
    hub::RelayHub,
    outbound::{InFlightTokens, RelayJob, RelayOutcome, RelayResult, RelayWorker},
    platform::{
        ChannelInfo, ChannelKind, Endpoint, PlatformClient, PlatformError, PlatformResult, Route,
        SentMessage,
    },
    reconciler::{MirrorEvent, MirrorEventSink, MirrorMessage, MirrorOutcome, MirrorReconciler},
    scheduler::RelayEvent,
    store::{DeliveryStore, MemoryDeliveryStore},
    types::{DeliveryMapping, Identity, LogicalMessage},
};
