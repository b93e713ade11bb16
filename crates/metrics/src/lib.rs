//! Metrics collection and export for guildrelay.
//!
//! Metric names live in [`definitions`] so every crate records under the same
//! keys. With the `prometheus` feature the recorder renders the Prometheus text
//! format for the gateway's `/metrics` route; without it every macro is a no-op.
//!
//! ```rust,ignore
//! use guildrelay_metrics::{counter, relay};
//!
//! counter!(relay::ATTEMPTS_TOTAL).increment(1);
//! ```

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

pub use metrics::{counter, gauge, histogram};
