//! REST implementation of [`PlatformClient`] for Discord.
//!
//! Webhooks are the provisioned endpoints: they let the relay post under the
//! author's display name. Everything else (channel lookup, direct sends,
//! webhook creation) uses the bot token.

use std::time::Duration;

use {
    async_trait::async_trait,
    guildrelay_config::DiscordConfig,
    guildrelay_relay::{
        ChannelInfo, ChannelKind, Endpoint, PlatformClient, PlatformError, PlatformResult, Route,
        SentMessage, formatter::FormattedMessage,
    },
    reqwest::{RequestBuilder, Response, StatusCode, header},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
    url::Url,
};

use crate::error::Result;

/// Discord's per-message embed limit.
pub const MAX_EMBEDS: usize = 10;

const UNKNOWN_WEBHOOK: u64 = 10_015;
const INVALID_WEBHOOK_TOKEN: u64 = 50_027;

// Channel type ids from the Discord API.
const GUILD_TEXT: u64 = 0;
const GUILD_ANNOUNCEMENT: u64 = 5;
const ANNOUNCEMENT_THREAD: u64 = 10;
const PUBLIC_THREAD: u64 = 11;
const PRIVATE_THREAD: u64 = 12;

/// Which family of routes a request hit; decides how a 401/404 reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Api,
    Webhook,
}

pub struct DiscordClient {
    http: reqwest::Client,
    api_base: String,
    bot_token: Option<Secret<String>>,
    endpoint_name: String,
}

impl DiscordClient {
    pub fn new(config: &DiscordConfig) -> Result<Self> {
        Url::parse(&config.api_base)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .user_agent(concat!("guildrelay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            endpoint_name: config.endpoint_name.clone(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    fn with_bot_auth(&self, request: RequestBuilder) -> PlatformResult<RequestBuilder> {
        let token = self
            .bot_token
            .as_ref()
            .ok_or_else(|| PlatformError::forbidden("no bot token configured"))?;
        Ok(request.header(
            header::AUTHORIZATION,
            format!("Bot {}", token.expose_secret()),
        ))
    }

    async fn execute(&self, request: RequestBuilder, scope: Scope) -> PlatformResult<Response> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        let error = classify(status, retry_after.as_deref(), &body, scope);
        if matches!(error, PlatformError::RateLimited { .. }) {
            warn!(%status, ?error, "discord rate limit");
        } else {
            debug!(%status, ?error, "discord request failed");
        }
        Err(error)
    }

    async fn post_message(
        &self,
        request: RequestBuilder,
        scope: Scope,
    ) -> PlatformResult<SentMessage> {
        let response = self.execute(request, scope).await?;
        let message: WireId = response
            .json()
            .await
            .map_err(|e| PlatformError::Invalid {
                message: format!("unreadable message response: {e}"),
            })?;
        Ok(SentMessage {
            remote_id: message.id,
        })
    }

    /// Request against a message reached through `route`.
    fn message_request(
        &self,
        method: reqwest::Method,
        route: &Route,
        remote_id: &str,
    ) -> PlatformResult<(RequestBuilder, Scope)> {
        match route {
            Route::Endpoint(endpoint) => {
                let url = webhook_url(
                    &endpoint.url,
                    &format!("/messages/{remote_id}"),
                    endpoint.thread_id.as_deref(),
                    false,
                )?;
                Ok((self.http.request(method, url), Scope::Webhook))
            },
            Route::Direct { channel_id } => {
                let url = self.api_url(&format!("/channels/{channel_id}/messages/{remote_id}"));
                let request = self.with_bot_auth(self.http.request(method, url))?;
                Ok((request, Scope::Api))
            },
        }
    }
}

#[async_trait]
impl PlatformClient for DiscordClient {
    async fn resolve_channel(&self, channel_id: &str) -> PlatformResult<ChannelInfo> {
        let request = self.with_bot_auth(
            self.http
                .get(self.api_url(&format!("/channels/{channel_id}"))),
        )?;
        let response = self.execute(request, Scope::Api).await?;
        let channel: WireChannel = response
            .json()
            .await
            .map_err(|e| PlatformError::transient(format!("unreadable channel: {e}")))?;
        Ok(channel.into_info())
    }

    async fn create_endpoint(&self, channel_id: &str) -> PlatformResult<String> {
        let request = self.with_bot_auth(
            self.http
                .post(self.api_url(&format!("/channels/{channel_id}/webhooks")))
                .json(&serde_json::json!({ "name": self.endpoint_name })),
        )?;
        let response = self.execute(request, Scope::Api).await?;
        let webhook: WireWebhook = response
            .json()
            .await
            .map_err(|e| PlatformError::transient(format!("unreadable webhook: {e}")))?;
        let token = webhook.token.ok_or_else(|| PlatformError::Invalid {
            message: "webhook created without a token".into(),
        })?;
        debug!(channel_id, webhook_id = %webhook.id, "provisioned webhook");
        Ok(self.api_url(&format!("/webhooks/{}/{token}", webhook.id)))
    }

    async fn send_via_endpoint(
        &self,
        endpoint: &Endpoint,
        message: &FormattedMessage,
    ) -> PlatformResult<SentMessage> {
        let url = webhook_url(&endpoint.url, "", endpoint.thread_id.as_deref(), true)?;
        let body = MessageBody::new(message, Some(&message.username));
        self.post_message(self.http.post(url).json(&body), Scope::Webhook)
            .await
    }

    async fn send_direct(
        &self,
        channel_id: &str,
        message: &FormattedMessage,
    ) -> PlatformResult<SentMessage> {
        let body = MessageBody::new(message, None);
        let request = self.with_bot_auth(
            self.http
                .post(self.api_url(&format!("/channels/{channel_id}/messages")))
                .json(&body),
        )?;
        self.post_message(request, Scope::Api).await
    }

    async fn edit_message(
        &self,
        route: &Route,
        remote_id: &str,
        message: &FormattedMessage,
    ) -> PlatformResult<SentMessage> {
        let (request, scope) = self.message_request(reqwest::Method::PATCH, route, remote_id)?;
        let body = MessageBody::new(message, None);
        self.post_message(request.json(&body), scope).await
    }

    async fn delete_message(&self, route: &Route, remote_id: &str) -> PlatformResult<()> {
        let (request, scope) = self.message_request(reqwest::Method::DELETE, route, remote_id)?;
        self.execute(request, scope).await?;
        Ok(())
    }
}

// ── Classification ──────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<u64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    retry_after: Option<f64>,
}

fn transport_error(e: reqwest::Error) -> PlatformError {
    if e.is_timeout() {
        PlatformError::transient(format!("timed out: {e}"))
    } else {
        PlatformError::transient(e.to_string())
    }
}

fn retry_after(seconds: f64) -> Option<Duration> {
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

/// Map a non-success response onto the relay's failure classes.
fn classify(
    status: StatusCode,
    retry_after_header: Option<&str>,
    body: &str,
    scope: Scope,
) -> PlatformError {
    let api: ApiError = serde_json::from_str(body).unwrap_or_default();
    let message = api
        .message
        .clone()
        .unwrap_or_else(|| format!("http {status}"));

    match status.as_u16() {
        429 => PlatformError::RateLimited {
            retry_after: api
                .retry_after
                .or_else(|| retry_after_header.and_then(|h| h.trim().parse().ok()))
                .and_then(retry_after),
        },
        408 | 500..=599 => PlatformError::Transient { message },
        401 | 404
            if scope == Scope::Webhook
                && matches!(api.code, Some(UNKNOWN_WEBHOOK | INVALID_WEBHOOK_TOKEN)) =>
        {
            PlatformError::EndpointGone { message }
        },
        401 | 403 => PlatformError::Forbidden { message },
        404 => PlatformError::NotFound { message },
        _ => PlatformError::Invalid { message },
    }
}

fn webhook_url(
    endpoint_url: &str,
    suffix: &str,
    thread_id: Option<&str>,
    wait: bool,
) -> PlatformResult<Url> {
    let mut url = Url::parse(&format!("{}{suffix}", endpoint_url.trim_end_matches('/')))
        .map_err(|e| PlatformError::EndpointGone {
            message: format!("unusable endpoint url: {e}"),
        })?;
    if wait || thread_id.is_some() {
        let mut query = url.query_pairs_mut();
        if wait {
            query.append_pair("wait", "true");
        }
        if let Some(thread_id) = thread_id {
            query.append_pair("thread_id", thread_id);
        }
    }
    Ok(url)
}

// ── Wire types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireWebhook {
    id: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    id: String,
    #[serde(rename = "type")]
    kind: u64,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
}

impl WireChannel {
    fn into_info(self) -> ChannelInfo {
        let kind = match (self.kind, self.parent_id) {
            (GUILD_TEXT | GUILD_ANNOUNCEMENT, _) if self.guild_id.is_some() => ChannelKind::Text,
            (ANNOUNCEMENT_THREAD | PUBLIC_THREAD | PRIVATE_THREAD, Some(parent_id)) => {
                ChannelKind::Thread { parent_id }
            },
            _ => ChannelKind::DirectOnly,
        };
        ChannelInfo {
            id: self.id,
            guild_id: self.guild_id,
            kind,
        }
    }
}

#[derive(Debug, Serialize)]
struct MessageBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    content: &'a str,
    embeds: Vec<Embed<'a>>,
    allowed_mentions: AllowedMentions,
}

#[derive(Debug, Default, Serialize)]
struct Embed<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<Footer<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<Image<'a>>,
}

#[derive(Debug, Serialize)]
struct Footer<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct Image<'a> {
    url: &'a str,
}

/// Relayed text never pings anyone.
#[derive(Debug, Default, Serialize)]
struct AllowedMentions {
    parse: Vec<&'static str>,
}

impl<'a> MessageBody<'a> {
    fn new(message: &'a FormattedMessage, username: Option<&'a str>) -> Self {
        let mut embeds: Vec<Embed<'a>> = message
            .blocks
            .iter()
            .map(|block| Embed {
                description: Some(&block.description),
                color: Some(block.color),
                footer: block.footer.as_deref().map(|text| Footer { text }),
                ..Embed::default()
            })
            .collect();

        // Attachments ride as link embeds in whatever slots the text left.
        for upload in &message.uploads {
            if embeds.len() >= MAX_EMBEDS {
                break;
            }
            let is_image = upload
                .content_type
                .as_deref()
                .is_some_and(|ct| ct.starts_with("image/"));
            embeds.push(Embed {
                title: Some(&upload.filename),
                url: Some(&upload.url),
                image: is_image.then_some(Image { url: &upload.url }),
                ..Embed::default()
            });
        }

        Self {
            username,
            content: &message.primary_text,
            embeds,
            allowed_mentions: AllowedMentions::default(),
        }
    }
}
