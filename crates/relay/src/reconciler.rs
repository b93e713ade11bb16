//! Mirror reconciliation: the platform's echo feed, minus our own output.
//!
//! Echoes of relayed messages carry the correlation token in their metadata
//! and are discarded, since the relay already enqueued them. Everything else
//! is external traffic and goes through the same scheduler path, including
//! messages whose token is present but unknown.

use std::sync::Arc;

use {
    async_trait::async_trait,
    guildrelay_protocol::{AttachmentRef, AuthorInfo},
    serde_json::Value,
    tracing::{debug, warn},
};

use crate::{
    error::{Context, Result},
    formatter::parse_token,
    hub::RelayHub,
    outbound::InFlightTokens,
    scheduler::RelayEvent,
    store::DeliveryStore,
    types::LogicalMessage,
};

/// A message as observed on the mirror feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorMessage {
    pub guild_id: Option<String>,
    pub channel_id: String,
    pub remote_id: String,
    pub author: AuthorInfo,
    pub content: String,
    pub attachments: Vec<AttachmentRef>,
    /// Raw rich-block metadata as the platform delivered it.
    pub embeds: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MirrorEvent {
    Created(MirrorMessage),
    Updated(MirrorMessage),
    Deleted {
        guild_id: Option<String>,
        channel_id: String,
        remote_id: String,
    },
}

impl MirrorEvent {
    pub fn channel_id(&self) -> &str {
        match self {
            Self::Created(m) | Self::Updated(m) => &m.channel_id,
            Self::Deleted { channel_id, .. } => channel_id,
        }
    }
}

/// What the reconciler did with one mirror event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// Self-authored echo; already accounted for.
    Discarded,
    /// Treated as external and offered to the scheduler.
    Ingested { sequence: Option<u64> },
    /// Nothing known about it; dropped.
    Ignored,
}

/// Receives events from the platform's mirror feed.
#[async_trait]
pub trait MirrorEventSink: Send + Sync {
    async fn on_mirror_event(&self, event: MirrorEvent);
}

pub struct MirrorReconciler {
    store: Arc<dyn DeliveryStore>,
    hub: RelayHub,
    in_flight: Arc<InFlightTokens>,
    marker: String,
}

impl MirrorReconciler {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        hub: RelayHub,
        in_flight: Arc<InFlightTokens>,
        marker: impl Into<String>,
    ) -> Self {
        Self {
            store,
            hub,
            in_flight,
            marker: marker.into(),
        }
    }

    pub async fn reconcile(&self, event: MirrorEvent) -> Result<MirrorOutcome> {
        let outcome = match event {
            MirrorEvent::Created(message) => self.on_posted(message, false).await?,
            MirrorEvent::Updated(message) => self.on_posted(message, true).await?,
            MirrorEvent::Deleted {
                channel_id,
                remote_id,
                ..
            } => self.on_deleted(&channel_id, &remote_id).await?,
        };

        #[cfg(feature = "metrics")]
        match outcome {
            MirrorOutcome::Discarded => {
                guildrelay_metrics::counter!(guildrelay_metrics::mirror::DISCARDED_TOTAL)
                    .increment(1)
            },
            MirrorOutcome::Ingested { .. } => {
                guildrelay_metrics::counter!(guildrelay_metrics::mirror::INGESTED_TOTAL)
                    .increment(1)
            },
            MirrorOutcome::Ignored => {},
        }
        Ok(outcome)
    }

    async fn on_posted(&self, message: MirrorMessage, edited: bool) -> Result<MirrorOutcome> {
        let guild_id = message.guild_id.clone().unwrap_or_default();

        if let Some(token) = extract_token(&self.marker, &message) {
            if self.in_flight.contains(&token) {
                debug!(channel_id = %message.channel_id, "echo of in-flight relay discarded");
                return Ok(MirrorOutcome::Discarded);
            }
            if self
                .store
                .mapping_by_token(&guild_id, &message.channel_id, &token)
                .await?
                .is_some()
            {
                debug!(channel_id = %message.channel_id, "echo of relayed message discarded");
                return Ok(MirrorOutcome::Discarded);
            }
            warn!(
                channel_id = %message.channel_id,
                remote_id = %message.remote_id,
                token = %token,
                "correlation token has no delivery mapping, ingesting as external"
            );
            #[cfg(feature = "metrics")]
            guildrelay_metrics::counter!(guildrelay_metrics::mirror::AMBIGUOUS_TOTAL).increment(1);
        } else if self
            .store
            .mapping_by_remote_id(&message.remote_id)
            .await?
            .is_some()
        {
            // Platform stripped the metadata, but the id is ours.
            return Ok(MirrorOutcome::Discarded);
        }

        let mut revision = 0;
        if edited
            && let Some(stored) = self
                .store
                .load_message(&message.channel_id, &message.remote_id)
                .await?
        {
            // Embed unfurls and pins arrive as updates with nothing changed.
            if stored.content == message.content && stored.attachments == message.attachments {
                debug!(channel_id = %message.channel_id, "no-op update ignored");
                return Ok(MirrorOutcome::Ignored);
            }
            revision = stored.revision;
        }
        if edited {
            revision += 1;
        }

        let logical = LogicalMessage {
            local_id: message.remote_id.clone(),
            channel_id: message.channel_id.clone(),
            content: message.content,
            attachments: message.attachments,
            correlation_token: None,
            author: message.author,
            is_restricted: self.hub.is_restricted(&message.channel_id),
            remote_id: Some(message.remote_id),
            external: true,
            revision,
        };
        self.store
            .save_message(&logical)
            .await
            .with_context(|| format!("persisting external message {}", logical.local_id))?;

        let event = if edited {
            RelayEvent::updated(logical.event_data(), logical.revision)
        } else {
            RelayEvent::created(logical.event_data())
        };
        let sequence = self.hub.enqueue(&logical.channel_id, event);
        debug!(
            channel_id = %logical.channel_id,
            message_id = %logical.local_id,
            edited,
            ?sequence,
            "external message ingested"
        );
        Ok(MirrorOutcome::Ingested { sequence })
    }

    async fn on_deleted(&self, channel_id: &str, remote_id: &str) -> Result<MirrorOutcome> {
        if let Some(mapping) = self.store.mapping_by_remote_id(remote_id).await? {
            let message = self
                .store
                .load_message(&mapping.channel_id, &mapping.local_message_id)
                .await?;
            self.store
                .delete_delivery_mapping(&mapping.channel_id, &mapping.local_message_id)
                .await?;
            self.store
                .delete_message(&mapping.channel_id, &mapping.local_message_id)
                .await?;

            let mut data = message.map(|m| m.event_data()).unwrap_or_default();
            data.message_id = mapping.local_message_id.clone();
            data.channel_id = mapping.channel_id.clone();
            data.remote_id = Some(mapping.remote_message_id.clone());
            data.correlation_token = Some(mapping.correlation_token.clone());
            let sequence = self
                .hub
                .enqueue(&mapping.channel_id, RelayEvent::deleted(data));
            return Ok(MirrorOutcome::Ingested { sequence });
        }

        if let Some(message) = self.store.load_message(channel_id, remote_id).await?
            && message.external
        {
            self.store.delete_message(channel_id, remote_id).await?;
            let sequence = self
                .hub
                .enqueue(channel_id, RelayEvent::deleted(message.event_data()));
            return Ok(MirrorOutcome::Ingested { sequence });
        }

        debug!(channel_id, remote_id, "delete of unknown message ignored");
        Ok(MirrorOutcome::Ignored)
    }
}

#[async_trait]
impl MirrorEventSink for MirrorReconciler {
    async fn on_mirror_event(&self, event: MirrorEvent) {
        let channel_id = event.channel_id().to_string();
        if let Err(e) = self.reconcile(event).await {
            warn!(channel_id = %channel_id, error = %e, "mirror event dropped");
        }
    }
}

/// Find the correlation token in a mirrored message. The platform may move
/// the footer around, so several shapes are checked before the plain text.
pub fn extract_token(marker: &str, message: &MirrorMessage) -> Option<String> {
    message
        .embeds
        .iter()
        .find_map(|embed| token_in_embed(marker, embed))
        .or_else(|| parse_token(marker, &message.content).map(str::to_string))
}

fn token_in_embed(marker: &str, embed: &Value) -> Option<String> {
    let footer = embed.get("footer");
    token_in_str(marker, footer.and_then(|f| f.get("text")))
        .or_else(|| token_in_str(marker, footer))
        .or_else(|| {
            embed
                .get("fields")
                .and_then(Value::as_array)
                .and_then(|fields| {
                    fields
                        .iter()
                        .find_map(|f| token_in_str(marker, f.get("value")))
                })
        })
        .or_else(|| token_in_str(marker, embed.get("description")))
        .map(str::to_string)
}

fn token_in_str<'a>(marker: &str, value: Option<&'a Value>) -> Option<&'a str> {
    value
        .and_then(Value::as_str)
        .and_then(|s| parse_token(marker, s))
}
