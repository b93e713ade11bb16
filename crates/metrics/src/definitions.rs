//! Metric name and label definitions.

/// WebSocket session metrics
pub mod websocket {
    /// Total number of WebSocket sessions accepted
    pub const CONNECTIONS_TOTAL: &str = "guildrelay_websocket_connections_total";
    /// Number of currently connected sessions
    pub const CONNECTIONS_ACTIVE: &str = "guildrelay_websocket_connections_active";
    /// Client frames rejected as malformed or oversized
    pub const FRAMES_REJECTED_TOTAL: &str = "guildrelay_websocket_frames_rejected_total";
}

/// Outbound relay metrics
pub mod relay {
    /// Send attempts made against the platform
    pub const ATTEMPTS_TOTAL: &str = "guildrelay_relay_attempts_total";
    /// Relays that ended with a delivery
    pub const DELIVERED_TOTAL: &str = "guildrelay_relay_delivered_total";
    /// Relays that ended with a `failed` event
    pub const FAILED_TOTAL: &str = "guildrelay_relay_failed_total";
    /// Rate-limit responses received
    pub const RATE_LIMITED_TOTAL: &str = "guildrelay_relay_rate_limited_total";
    /// Endpoints provisioned on the platform
    pub const ENDPOINTS_PROVISIONED_TOTAL: &str = "guildrelay_relay_endpoints_provisioned_total";
    /// End-to-end relay duration, including retries
    pub const DURATION_SECONDS: &str = "guildrelay_relay_duration_seconds";
}

/// Batch scheduler metrics
pub mod scheduler {
    /// Events accepted and assigned a sequence number
    pub const EVENTS_ACCEPTED_TOTAL: &str = "guildrelay_scheduler_events_accepted_total";
    /// Events dropped by the suppression cache
    pub const EVENTS_SUPPRESSED_TOTAL: &str = "guildrelay_scheduler_events_suppressed_total";
    /// Batches flushed to subscribers
    pub const BATCHES_FLUSHED_TOTAL: &str = "guildrelay_scheduler_batches_flushed_total";
    /// Channels removed by cleanup
    pub const CHANNELS_CLEANED_TOTAL: &str = "guildrelay_scheduler_channels_cleaned_total";
}

/// Mirror feed metrics
pub mod mirror {
    /// Echoes recognized as self-authored and discarded
    pub const DISCARDED_TOTAL: &str = "guildrelay_mirror_discarded_total";
    /// External messages ingested
    pub const INGESTED_TOTAL: &str = "guildrelay_mirror_ingested_total";
    /// Tokens found with no matching delivery mapping
    pub const AMBIGUOUS_TOTAL: &str = "guildrelay_mirror_ambiguous_total";
}

/// Common label keys
pub mod labels {
    pub const CODE: &str = "code";
    pub const OP: &str = "op";
    pub const OUTCOME: &str = "outcome";
    pub const ROUTE: &str = "route";
}

/// Histogram buckets for relay durations (in seconds), 10ms to 2 minutes.
pub mod buckets {
    pub const RELAY_DURATION: &[f64] = &[
        0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
    ];
}
