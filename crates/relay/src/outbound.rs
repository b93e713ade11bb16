//! Outbound relay: client sends delivered to the platform.
//!
//! Relays on one channel run strictly one at a time; different channels run
//! concurrently. Every relay ends in exactly one scheduler event: the
//! matching `created`/`updated`/`deleted` on success, `failed` otherwise.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    dashmap::{DashMap, DashSet},
    guildrelay_config::{FormatterConfig, OutboundConfig},
    guildrelay_protocol::SendPayload,
    tokio::{sync::Mutex, task::JoinHandle},
    tracing::{debug, info, warn},
    uuid::Uuid,
};

use crate::{
    endpoint::EndpointCache,
    error::{Error, Result},
    formatter::{FormattedMessage, Formatter},
    hub::RelayHub,
    platform::{ChannelInfo, PlatformClient, PlatformError, PlatformResult, Route},
    scheduler::RelayEvent,
    store::DeliveryStore,
    types::{DeliveryMapping, Identity, LogicalMessage},
};

// ── In-flight tokens ────────────────────────────────────────────────────────

/// Correlation tokens whose send is underway but whose mapping is not yet
/// written. The mirror feed checks these so a fast echo is still recognized.
#[derive(Debug, Default)]
pub struct InFlightTokens {
    tokens: DashSet<String>,
}

impl InFlightTokens {
    pub fn register(&self, token: &str) {
        self.tokens.insert(token.to_string());
    }

    pub fn release(&self, token: &str) {
        self.tokens.remove(token);
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

// ── Jobs and results ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOp {
    Create,
    Edit { mapping: DeliveryMapping },
    Delete { mapping: DeliveryMapping },
}

impl RelayOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit { .. } => "edit",
            Self::Delete { .. } => "delete",
        }
    }
}

/// A validated send, ready to relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayJob {
    pub op: RelayOp,
    pub message: LogicalMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered { remote_id: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResult {
    pub outcome: RelayOutcome,
    /// Platform attempts made, including the first.
    pub attempts: u32,
    /// Sequence of the event the relay produced, if it was not suppressed.
    pub sequence: Option<u64>,
}

impl RelayResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, RelayOutcome::Delivered { .. })
    }
}

struct Delivery {
    info: Option<ChannelInfo>,
    route: Option<Route>,
    remote_id: String,
}

// ── Worker ──────────────────────────────────────────────────────────────────

pub struct RelayWorker {
    platform: Arc<dyn PlatformClient>,
    store: Arc<dyn DeliveryStore>,
    endpoints: Arc<EndpointCache>,
    formatter: Formatter,
    hub: RelayHub,
    config: OutboundConfig,
    channel_locks: DashMap<String, Arc<Mutex<()>>>,
    in_flight: Arc<InFlightTokens>,
    failed_relays: AtomicU64,
}

impl RelayWorker {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        store: Arc<dyn DeliveryStore>,
        hub: RelayHub,
        formatter: FormatterConfig,
        config: OutboundConfig,
    ) -> Self {
        let endpoints = Arc::new(EndpointCache::new(
            Arc::clone(&platform),
            Arc::clone(&store),
        ));
        Self {
            platform,
            store,
            endpoints,
            formatter: Formatter::new(formatter),
            hub,
            config,
            channel_locks: DashMap::new(),
            in_flight: Arc::new(InFlightTokens::default()),
            failed_relays: AtomicU64::new(0),
        }
    }

    pub fn endpoints(&self) -> &Arc<EndpointCache> {
        &self.endpoints
    }

    pub fn in_flight(&self) -> Arc<InFlightTokens> {
        Arc::clone(&self.in_flight)
    }

    /// Validate a client `send` and build the job to relay. Errors here are
    /// reported to the sender before anything reaches the platform.
    pub async fn prepare(
        &self,
        identity: &Identity,
        channel_id: &str,
        payload: SendPayload,
    ) -> Result<RelayJob> {
        let is_restricted = self.hub.is_restricted(channel_id);
        match payload {
            SendPayload::Create {
                content,
                attachments,
            } => {
                self.check_content(&content)?;
                if content.trim().is_empty() && attachments.is_empty() {
                    return Err(Error::validation("message has no content"));
                }
                Ok(RelayJob {
                    op: RelayOp::Create,
                    message: LogicalMessage {
                        local_id: Uuid::new_v4().to_string(),
                        channel_id: channel_id.to_string(),
                        content,
                        attachments,
                        correlation_token: None,
                        author: identity.author(),
                        is_restricted,
                        remote_id: None,
                        external: false,
                        revision: 0,
                    },
                })
            },
            SendPayload::Edit {
                message_id,
                content,
            } => {
                self.check_content(&content)?;
                if content.trim().is_empty() {
                    return Err(Error::validation("edited message has no content"));
                }
                let (mapping, mut message) =
                    self.owned_message(identity, channel_id, &message_id).await?;
                message.content = content;
                message.is_restricted = is_restricted;
                Ok(RelayJob {
                    op: RelayOp::Edit { mapping },
                    message,
                })
            },
            SendPayload::Delete { message_id } => {
                let (mapping, message) =
                    self.owned_message(identity, channel_id, &message_id).await?;
                Ok(RelayJob {
                    op: RelayOp::Delete { mapping },
                    message,
                })
            },
        }
    }

    fn check_content(&self, content: &str) -> Result<()> {
        let chars = content.chars().count();
        if chars > self.config.max_content_chars {
            return Err(Error::validation(format!(
                "content is {chars} characters, limit is {}",
                self.config.max_content_chars
            )));
        }
        Ok(())
    }

    async fn owned_message(
        &self,
        identity: &Identity,
        channel_id: &str,
        message_id: &str,
    ) -> Result<(DeliveryMapping, LogicalMessage)> {
        let mapping = self
            .store
            .mapping_by_local_id(channel_id, message_id)
            .await?
            .ok_or_else(|| Error::not_found(channel_id, message_id))?;
        let mut message = self
            .store
            .load_message(channel_id, message_id)
            .await?
            .ok_or_else(|| Error::not_found(channel_id, message_id))?;
        if message.author.id != identity.user_id {
            return Err(Error::validation("only the author can change this message"));
        }
        message.correlation_token = Some(mapping.correlation_token.clone());
        message.remote_id = Some(mapping.remote_message_id.clone());
        Ok((mapping, message))
    }

    /// Relay on a background task so the caller's loop is not blocked.
    pub fn spawn_relay(self: &Arc<Self>, job: RelayJob) -> JoinHandle<RelayResult> {
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.relay(job).await })
    }

    /// Deliver `job` to the platform and enqueue the resulting event.
    pub async fn relay(&self, job: RelayJob) -> RelayResult {
        let channel_id = job.message.channel_id.clone();
        let lock = self
            .channel_locks
            .entry(channel_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let started = Instant::now();
        let formatted = self.formatter.format(&job.message);
        let token = formatted.correlation_token.clone();
        let registered = matches!(job.op, RelayOp::Create);
        if registered {
            self.in_flight.register(&token);
        }

        let (delivery, attempts) = self.deliver(&job, &formatted).await;
        let result = match delivery {
            Ok(delivery) => self.complete(job, &token, delivery, attempts).await,
            Err(error) => self.fail(job, &token, &error, attempts),
        };

        if registered {
            self.in_flight.release(&token);
        }

        #[cfg(feature = "metrics")]
        guildrelay_metrics::histogram!(guildrelay_metrics::relay::DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        debug!(
            channel_id = %channel_id,
            attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "relay finished"
        );
        result
    }

    async fn deliver(
        &self,
        job: &RelayJob,
        formatted: &FormattedMessage,
    ) -> (PlatformResult<Delivery>, u32) {
        let channel_id = job.message.channel_id.as_str();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;
        let mut reprovisioned = false;
        let mut force_direct = false;

        loop {
            attempts += 1;
            #[cfg(feature = "metrics")]
            guildrelay_metrics::counter!(
                guildrelay_metrics::relay::ATTEMPTS_TOTAL,
                guildrelay_metrics::labels::OP => job.op.as_str()
            )
            .increment(1);

            let error = match self.attempt(job, formatted, force_direct).await {
                Ok(delivery) => return (Ok(delivery), attempts),
                Err(error) => error,
            };

            // A message can only be edited through the endpoint that posted it.
            let endpoint_bound = !matches!(job.op, RelayOp::Create)
                && matches!(error, PlatformError::EndpointGone { .. });
            if error.is_structural() || endpoint_bound || attempts >= max_attempts {
                return (Err(error), attempts);
            }

            match &error {
                PlatformError::RateLimited { retry_after } => {
                    let wait = self.rate_limit_wait(*retry_after);
                    warn!(
                        channel_id,
                        attempt = attempts,
                        wait_ms = wait.as_millis() as u64,
                        "rate limited, retrying"
                    );
                    #[cfg(feature = "metrics")]
                    guildrelay_metrics::counter!(guildrelay_metrics::relay::RATE_LIMITED_TOTAL)
                        .increment(1);
                    tokio::time::sleep(wait).await;
                },
                _ if matches!(job.op, RelayOp::Create) && !reprovisioned => {
                    reprovisioned = true;
                    warn!(
                        channel_id,
                        attempt = attempts,
                        error = %error,
                        "relay failed, re-provisioning endpoint"
                    );
                    self.endpoints.invalidate(channel_id).await;
                },
                PlatformError::EndpointGone { .. } if !force_direct => {
                    force_direct = true;
                    warn!(
                        channel_id,
                        attempt = attempts,
                        "endpoint unusable, falling back to direct send"
                    );
                },
                _ => {
                    warn!(
                        channel_id,
                        attempt = attempts,
                        error = %error,
                        "relay failed, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.transient_backoff_ms))
                        .await;
                },
            }
        }
    }

    async fn attempt(
        &self,
        job: &RelayJob,
        formatted: &FormattedMessage,
        force_direct: bool,
    ) -> PlatformResult<Delivery> {
        let channel_id = job.message.channel_id.as_str();
        match &job.op {
            RelayOp::Create => {
                let (info, route) = if force_direct {
                    let info = self.endpoints.channel_info(channel_id).await?;
                    let route = Route::Direct {
                        channel_id: info.id.clone(),
                    };
                    (info, route)
                } else {
                    self.endpoints.resolve(channel_id).await?
                };
                let sent = match &route {
                    Route::Endpoint(endpoint) => {
                        self.platform.send_via_endpoint(endpoint, formatted).await?
                    },
                    Route::Direct { channel_id } => {
                        self.platform.send_direct(channel_id, formatted).await?
                    },
                };
                Ok(Delivery {
                    info: Some(info),
                    route: Some(route),
                    remote_id: sent.remote_id,
                })
            },
            RelayOp::Edit { mapping } => {
                let info = self.endpoints.channel_info(channel_id).await?;
                let route = Route::from_mapping(&mapping.endpoint_url, &info);
                let sent = self
                    .platform
                    .edit_message(&route, &mapping.remote_message_id, formatted)
                    .await?;
                Ok(Delivery {
                    info: Some(info),
                    route: Some(route),
                    remote_id: sent.remote_id,
                })
            },
            RelayOp::Delete { mapping } => {
                let info = self.endpoints.channel_info(channel_id).await?;
                let route = Route::from_mapping(&mapping.endpoint_url, &info);
                match self
                    .platform
                    .delete_message(&route, &mapping.remote_message_id)
                    .await
                {
                    // Already gone on the platform side.
                    Ok(()) | Err(PlatformError::NotFound { .. }) => Ok(Delivery {
                        info: Some(info),
                        route: Some(route),
                        remote_id: mapping.remote_message_id.clone(),
                    }),
                    Err(e) => Err(e),
                }
            },
        }
    }

    fn rate_limit_wait(&self, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or(Duration::from_millis(self.config.rate_limit_default_ms))
            .min(Duration::from_millis(self.config.rate_limit_max_ms))
    }

    async fn complete(
        &self,
        job: RelayJob,
        token: &str,
        delivery: Delivery,
        attempts: u32,
    ) -> RelayResult {
        let RelayJob { op, mut message } = job;
        let channel_id = message.channel_id.clone();
        let op_name = op.as_str();
        message.remote_id = Some(delivery.remote_id.clone());
        message.correlation_token = Some(token.to_string());

        let event = match op {
            RelayOp::Create => {
                let mapping = DeliveryMapping {
                    guild_id: delivery
                        .info
                        .and_then(|i| i.guild_id)
                        .unwrap_or_default(),
                    channel_id: channel_id.clone(),
                    local_message_id: message.local_id.clone(),
                    remote_message_id: delivery.remote_id.clone(),
                    endpoint_url: delivery
                        .route
                        .as_ref()
                        .map(|r| r.endpoint_url().to_string())
                        .unwrap_or_default(),
                    correlation_token: token.to_string(),
                };
                self.persist(&mapping, &message).await;
                RelayEvent::created(message.event_data())
            },
            RelayOp::Edit { mut mapping } => {
                mapping.remote_message_id = delivery.remote_id.clone();
                message.revision = self.next_revision(&message).await;
                self.persist(&mapping, &message).await;
                RelayEvent::updated(message.event_data(), message.revision)
            },
            RelayOp::Delete { mapping } => {
                if let Err(e) = self
                    .store
                    .delete_delivery_mapping(&mapping.channel_id, &mapping.local_message_id)
                    .await
                {
                    warn!(channel_id = %channel_id, error = %e, "failed to delete delivery mapping");
                }
                if let Err(e) = self
                    .store
                    .delete_message(&channel_id, &message.local_id)
                    .await
                {
                    warn!(channel_id = %channel_id, error = %e, "failed to delete message");
                }
                RelayEvent::deleted(message.event_data())
            },
        };

        let sequence = self.hub.enqueue(&channel_id, event);
        info!(
            channel_id = %channel_id,
            op = op_name,
            message_id = %message.local_id,
            remote_id = %delivery.remote_id,
            route = delivery.route.as_ref().map_or("", Route::label),
            attempts,
            "message relayed"
        );
        #[cfg(feature = "metrics")]
        guildrelay_metrics::counter!(
            guildrelay_metrics::relay::DELIVERED_TOTAL,
            guildrelay_metrics::labels::OP => op_name,
            guildrelay_metrics::labels::ROUTE => delivery.route.as_ref().map_or("", Route::label)
        )
        .increment(1);

        RelayResult {
            outcome: RelayOutcome::Delivered {
                remote_id: delivery.remote_id,
            },
            attempts,
            sequence,
        }
    }

    async fn persist(&self, mapping: &DeliveryMapping, message: &LogicalMessage) {
        if let Err(e) = self.store.upsert_delivery_mapping(mapping).await {
            warn!(
                channel_id = %mapping.channel_id,
                message_id = %mapping.local_message_id,
                error = %e,
                "failed to record delivery mapping"
            );
        }
        if let Err(e) = self.store.save_message(message).await {
            warn!(channel_id = %message.channel_id, error = %e, "failed to save message");
        }
    }

    /// Edit count for an edit that just landed. Runs under the channel lock,
    /// so concurrent edits of one message read each other's writes.
    async fn next_revision(&self, message: &LogicalMessage) -> u64 {
        let stored = match self
            .store
            .load_message(&message.channel_id, &message.local_id)
            .await
        {
            Ok(stored) => stored.map_or(0, |m| m.revision),
            Err(e) => {
                warn!(channel_id = %message.channel_id, error = %e, "failed to load edit revision");
                0
            },
        };
        stored.max(message.revision) + 1
    }

    fn fail(
        &self,
        job: RelayJob,
        token: &str,
        error: &PlatformError,
        attempts: u32,
    ) -> RelayResult {
        let RelayJob { op, mut message } = job;
        message.correlation_token = Some(token.to_string());
        let reason = error.to_string();
        warn!(
            channel_id = %message.channel_id,
            op = op.as_str(),
            message_id = %message.local_id,
            attempts,
            structural = error.is_structural(),
            error = %error,
            "relay failed"
        );
        #[cfg(feature = "metrics")]
        guildrelay_metrics::counter!(
            guildrelay_metrics::relay::FAILED_TOTAL,
            guildrelay_metrics::labels::OP => op.as_str()
        )
        .increment(1);

        let attempt = self.failed_relays.fetch_add(1, Ordering::Relaxed) + 1;
        let sequence = self.hub.enqueue(
            &message.channel_id,
            RelayEvent::failed(message.event_data(), reason.clone(), attempt),
        );
        RelayResult {
            outcome: RelayOutcome::Failed { reason },
            attempts,
            sequence,
        }
    }
}
