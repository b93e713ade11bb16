use std::sync::Arc;

#[cfg(feature = "metrics")]
use guildrelay_metrics::MetricsHandle;

use {
    guildrelay_common::hooks::HookRegistry,
    guildrelay_config::RelayConfig,
    guildrelay_relay::{
        AuthResolver, DeliveryStore, MirrorReconciler, PlatformClient, RelayHub, RelayWorker,
    },
};

/// Everything a connection handler needs, shared across the server.
pub struct GatewayState {
    pub hub: RelayHub,
    pub worker: Arc<RelayWorker>,
    pub reconciler: Arc<MirrorReconciler>,
    pub auth: Arc<dyn AuthResolver>,
    /// Largest accepted client frame, in bytes.
    pub max_payload_bytes: usize,
    pub version: String,
    #[cfg(feature = "metrics")]
    pub metrics_handle: Option<MetricsHandle>,
}

impl GatewayState {
    /// Wire the relay components together.
    pub fn new(
        config: &RelayConfig,
        platform: Arc<dyn PlatformClient>,
        store: Arc<dyn DeliveryStore>,
        auth: Arc<dyn AuthResolver>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let hub = RelayHub::new(
            config.scheduler.clone(),
            config.auth.restricted_roles.clone(),
            hooks,
        );
        let worker = Arc::new(RelayWorker::new(
            platform,
            Arc::clone(&store),
            hub.clone(),
            config.formatter.clone(),
            config.relay.clone(),
        ));
        let reconciler = Arc::new(MirrorReconciler::new(
            store,
            hub.clone(),
            worker.in_flight(),
            config.formatter.token_marker.clone(),
        ));
        Self {
            hub,
            worker,
            reconciler,
            auth,
            max_payload_bytes: config.server.max_payload_bytes,
            version: env!("CARGO_PKG_VERSION").to_string(),
            #[cfg(feature = "metrics")]
            metrics_handle: None,
        }
    }

    /// Expose `handle` on `/metrics`.
    #[cfg(feature = "metrics")]
    #[must_use]
    pub fn with_metrics_handle(mut self, handle: MetricsHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn connection_count(&self) -> usize {
        self.hub.session_count()
    }
}
