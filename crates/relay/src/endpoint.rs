//! Lazily provisioned send endpoints, cached per host channel.
//!
//! Threads resolve through their parent, so the cache is keyed by the
//! channel that actually owns the endpoint. A host where provisioning was
//! forbidden is remembered as direct-only until invalidated.

use std::sync::Arc;

use {
    dashmap::DashMap,
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use guildrelay_metrics::{counter, relay as relay_metrics};

use crate::{
    platform::{ChannelInfo, Endpoint, PlatformClient, PlatformError, PlatformResult, Route},
    store::DeliveryStore,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum CacheEntry {
    Endpoint(String),
    DirectOnly,
}

pub struct EndpointCache {
    platform: Arc<dyn PlatformClient>,
    store: Arc<dyn DeliveryStore>,
    channels: DashMap<String, ChannelInfo>,
    entries: DashMap<String, CacheEntry>,
    provisioning: DashMap<String, Arc<Mutex<()>>>,
}

impl EndpointCache {
    pub fn new(platform: Arc<dyn PlatformClient>, store: Arc<dyn DeliveryStore>) -> Self {
        Self {
            platform,
            store,
            channels: DashMap::new(),
            entries: DashMap::new(),
            provisioning: DashMap::new(),
        }
    }

    /// Platform metadata for `channel_id`, fetched once.
    pub async fn channel_info(&self, channel_id: &str) -> PlatformResult<ChannelInfo> {
        if let Some(info) = self.channels.get(channel_id) {
            return Ok(info.clone());
        }
        let info = self.platform.resolve_channel(channel_id).await?;
        self.channels.insert(channel_id.to_string(), info.clone());
        Ok(info)
    }

    /// Route for a new send on `channel_id`, provisioning an endpoint if needed.
    pub async fn resolve(&self, channel_id: &str) -> PlatformResult<(ChannelInfo, Route)> {
        let info = self.channel_info(channel_id).await?;
        let Some(host) = info.endpoint_host().map(str::to_string) else {
            let route = Route::Direct {
                channel_id: info.id.clone(),
            };
            return Ok((info, route));
        };

        if let Some(entry) = self.entries.get(&host).map(|e| e.value().clone()) {
            return Ok((info.clone(), route_for(&info, entry)));
        }

        let lock = self
            .provisioning
            .entry(host.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another relay may have provisioned while we waited.
        if let Some(entry) = self.entries.get(&host).map(|e| e.value().clone()) {
            return Ok((info.clone(), route_for(&info, entry)));
        }

        let entry = self.provision(&host).await?;
        self.entries.insert(host, entry.clone());
        Ok((info.clone(), route_for(&info, entry)))
    }

    async fn provision(&self, host: &str) -> PlatformResult<CacheEntry> {
        match self.store.load_endpoint(host).await {
            Ok(Some(url)) => {
                debug!(channel_id = host, "endpoint loaded from store");
                return Ok(CacheEntry::Endpoint(url));
            },
            Ok(None) => {},
            Err(e) => warn!(channel_id = host, error = %e, "failed to load stored endpoint"),
        }

        match self.platform.create_endpoint(host).await {
            Ok(url) => {
                info!(channel_id = host, "endpoint provisioned");
                #[cfg(feature = "metrics")]
                counter!(relay_metrics::ENDPOINTS_PROVISIONED_TOTAL).increment(1);
                if let Err(e) = self.store.save_endpoint(host, &url).await {
                    warn!(channel_id = host, error = %e, "failed to persist endpoint");
                }
                Ok(CacheEntry::Endpoint(url))
            },
            Err(PlatformError::Forbidden { message }) => {
                info!(
                    channel_id = host,
                    reason = %message,
                    "endpoint provisioning forbidden, using direct sends"
                );
                Ok(CacheEntry::DirectOnly)
            },
            Err(e) => Err(e),
        }
    }

    /// Forget the endpoint serving `channel_id` so the next resolve
    /// provisions a fresh one.
    pub async fn invalidate(&self, channel_id: &str) {
        let host = match self.channels.get(channel_id) {
            Some(info) => info.endpoint_host().map(str::to_string),
            None => Some(channel_id.to_string()),
        };
        let Some(host) = host else {
            return;
        };
        if self.entries.remove(&host).is_some() {
            debug!(channel_id = %host, "endpoint invalidated");
        }
        if let Err(e) = self.store.clear_endpoint(&host).await {
            warn!(channel_id = %host, error = %e, "failed to clear stored endpoint");
        }
    }
}

fn route_for(info: &ChannelInfo, entry: CacheEntry) -> Route {
    match entry {
        CacheEntry::Endpoint(url) => Route::Endpoint(Endpoint {
            url,
            thread_id: info.thread_id().map(str::to_string),
        }),
        CacheEntry::DirectOnly => Route::Direct {
            channel_id: info.id.clone(),
        },
    }
}
