//! The external guild-chat platform, as the relay consumes it.

use std::time::Duration;

use async_trait::async_trait;

use crate::formatter::FormattedMessage;

/// Result type for platform calls.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Failure reported by a platform call, classified for the retry loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    /// The platform asked us to slow down.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Timeouts, 5xx, connection resets.
    #[error("transient platform failure: {message}")]
    Transient { message: String },

    /// The cached endpoint no longer exists; provisioning a new one may help.
    #[error("endpoint gone: {message}")]
    EndpointGone { message: String },

    /// Missing permission on the channel or guild.
    #[error("forbidden: {message}")]
    Forbidden { message: String },

    /// The channel or message no longer exists.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// The platform rejected the payload itself.
    #[error("rejected: {message}")]
    Invalid { message: String },
}

impl PlatformError {
    /// Structural failures abort the relay without further attempts.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Forbidden { .. } | Self::NotFound { .. } | Self::Invalid { .. }
        )
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }
}

/// How a channel can receive relayed messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// Regular guild text channel; hosts its own endpoint.
    Text,
    /// Sub-thread; relays through its parent's endpoint.
    Thread { parent_id: String },
    /// Anything that cannot host an endpoint (DMs, voice text, unknown kinds).
    DirectOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub guild_id: Option<String>,
    pub kind: ChannelKind,
}

impl ChannelInfo {
    /// Channel that owns the endpoint used for this channel, if any.
    pub fn endpoint_host(&self) -> Option<&str> {
        match &self.kind {
            ChannelKind::Text => Some(&self.id),
            ChannelKind::Thread { parent_id } => Some(parent_id),
            ChannelKind::DirectOnly => None,
        }
    }

    pub fn thread_id(&self) -> Option<&str> {
        match &self.kind {
            ChannelKind::Thread { .. } => Some(&self.id),
            _ => None,
        }
    }
}

/// A provisioned send endpoint, addressed for one logical channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    /// Set when posting into a thread through the parent's endpoint.
    pub thread_id: Option<String>,
}

/// Where a send goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Endpoint(Endpoint),
    Direct { channel_id: String },
}

impl Route {
    pub fn endpoint_url(&self) -> &str {
        match self {
            Self::Endpoint(e) => &e.url,
            Self::Direct { .. } => "",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Endpoint(_) => "endpoint",
            Self::Direct { .. } => "direct",
        }
    }

    /// Rebuild the route a mapping was delivered through.
    pub fn from_mapping(endpoint_url: &str, channel: &ChannelInfo) -> Self {
        if endpoint_url.is_empty() {
            Self::Direct {
                channel_id: channel.id.clone(),
            }
        } else {
            Self::Endpoint(Endpoint {
                url: endpoint_url.to_string(),
                thread_id: channel.thread_id().map(str::to_string),
            })
        }
    }
}

/// A message as acknowledged by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub remote_id: String,
}

/// Calls into the guild-chat platform.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn resolve_channel(&self, channel_id: &str) -> PlatformResult<ChannelInfo>;

    /// Provision a new send endpoint on `channel_id`, returning its URL.
    async fn create_endpoint(&self, channel_id: &str) -> PlatformResult<String>;

    async fn send_via_endpoint(
        &self,
        endpoint: &Endpoint,
        message: &FormattedMessage,
    ) -> PlatformResult<SentMessage>;

    async fn send_direct(
        &self,
        channel_id: &str,
        message: &FormattedMessage,
    ) -> PlatformResult<SentMessage>;

    async fn edit_message(
        &self,
        route: &Route,
        remote_id: &str,
        message: &FormattedMessage,
    ) -> PlatformResult<SentMessage>;

    async fn delete_message(&self, route: &Route, remote_id: &str) -> PlatformResult<()>;
}
