//! Configuration loading, env substitution, and validation.
//!
//! Config files: `guildrelay.toml`, `guildrelay.yaml`, or `guildrelay.json`
//! Searched in `./` then `~/.config/guildrelay/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, find_config_file, load_config},
    schema::{
        AuthConfig, DatabaseConfig, DiscordConfig, FormatterConfig, HooksConfig, MetricsConfig,
        OutboundConfig, RelayConfig, SchedulerConfig, ServerConfig, TokenGrant,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
