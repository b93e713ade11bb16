/// Config schema types (server, auth, relay, scheduler, formatter, storage,
/// platform, metrics, hooks).
use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub relay: OutboundConfig,
    pub scheduler: SchedulerConfig,
    pub formatter: FormatterConfig,
    pub database: DatabaseConfig,
    pub discord: DiscordConfig,
    pub metrics: MetricsConfig,
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Largest accepted client frame, in bytes.
    pub max_payload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18_790,
            max_payload_bytes: 262_144,
        }
    }
}

/// A bearer token accepted by the static token resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    #[serde(serialize_with = "serialize_secret")]
    pub token: Secret<String>,
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenGrant>,
    /// Roles allowed to subscribe to channels flagged as restricted.
    pub restricted_roles: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            restricted_roles: vec!["staff".into()],
        }
    }
}

/// Outbound relay worker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Upper bound on send attempts per relay, including the first.
    pub max_attempts: u32,
    /// Wait applied when a rate-limit response carries no retry hint.
    pub rate_limit_default_ms: u64,
    /// Ceiling on any single advertised rate-limit wait.
    pub rate_limit_max_ms: u64,
    /// Pause between attempts after a transient failure.
    pub transient_backoff_ms: u64,
    /// Hard cap on client message content; longer sends are rejected.
    pub max_content_chars: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            rate_limit_default_ms: 1_000,
            rate_limit_max_ms: 30_000,
            transient_backoff_ms: 250,
            max_content_chars: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    /// Per-channel capacity of the duplicate suppression cache.
    pub suppression_capacity: usize,
    pub idle_channel_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            jitter_min_ms: 10,
            jitter_max_ms: 50,
            suppression_capacity: 512,
            idle_channel_ttl_secs: 3_600,
            sweep_interval_secs: 300,
        }
    }
}

/// Platform formatting caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatterConfig {
    pub text_cap: usize,
    pub block_cap: usize,
    pub max_blocks: usize,
    pub aggregate_cap: usize,
    pub token_marker: String,
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self {
            text_cap: 2_000,
            block_cap: 4_096,
            max_blocks: 10,
            aggregate_cap: 6_000,
            token_marker: "relay-ref:".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://guildrelay.db?mode=rwc".into(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub api_base: String,
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub bot_token: Option<Secret<String>>,
    /// Name given to webhooks the relay provisions.
    pub endpoint_name: String,
    pub request_timeout_secs: u64,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            api_base: "https://discord.com/api/v10".into(),
            bot_token: None,
            endpoint_name: "guildrelay".into(),
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

/// Built-in hook handlers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Append every relay event as a JSON line to this file.
    pub event_log: Option<std::path::PathBuf>,
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}
