mod config_commands;
mod event_log;

use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    sqlx::sqlite::SqlitePoolOptions,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    guildrelay_common::hooks::HookRegistry,
    guildrelay_config::{RelayConfig, Severity, validate},
    guildrelay_discord::DiscordClient,
    guildrelay_gateway::{GatewayState, SqliteDeliveryStore, StaticTokenAuth, start_gateway},
};

use crate::event_log::EventLogHook;

#[derive(Parser)]
#[command(
    name = "guildrelay",
    about = "Relay chat between WebSocket clients and Discord channels"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Config file to load instead of searching the standard locations.
    #[arg(long, global = true, env = "GUILDRELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay (default when no subcommand is provided).
    Serve,
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Log validation diagnostics and refuse to start on errors.
fn ensure_valid(config: &RelayConfig) -> anyhow::Result<()> {
    let result = validate(config);
    for d in &result.diagnostics {
        match d.severity {
            Severity::Error => tracing::error!(path = %d.path, "config: {}", d.message),
            Severity::Warning => warn!(path = %d.path, "config: {}", d.message),
            Severity::Info => info!(path = %d.path, "config: {}", d.message),
        }
    }
    if result.has_errors() {
        anyhow::bail!(
            "configuration has {} error(s); run `guildrelay check` for details",
            result.count(Severity::Error)
        );
    }
    Ok(())
}

fn build_hooks(config: &RelayConfig) -> HookRegistry {
    let mut hooks = HookRegistry::new().with_circuit_breaker(5, Duration::from_secs(60));
    if let Some(ref path) = config.hooks.event_log {
        info!(path = %path.display(), "hooks: event log enabled");
        hooks.register(Arc::new(EventLogHook::new(path.clone())));
    }
    hooks
}

async fn serve(cli: Cli) -> anyhow::Result<()> {
    let (path, config) = config_commands::load(cli.config.as_deref())?;
    match path {
        Some(ref p) => info!(path = %p.display(), "config loaded"),
        None => info!("no config file found, using defaults"),
    }
    ensure_valid(&config)?;

    #[cfg(feature = "metrics")]
    let metrics_handle = {
        use guildrelay_metrics::{MetricsRecorderConfig, init_metrics};
        init_metrics(MetricsRecorderConfig {
            enabled: config.metrics.enabled,
            global_labels: vec![("service".into(), "guildrelay".into())],
        })?
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections.max(1))
        .connect(&config.database.url)
        .await
        .with_context(|| format!("failed to open database {}", config.database.url))?;
    SqliteDeliveryStore::init(&pool).await?;
    let store = Arc::new(SqliteDeliveryStore::new(pool));

    if config.discord.bot_token.is_none() {
        warn!("discord.bot_token is not set; channel lookups will fail");
    }
    let platform = Arc::new(DiscordClient::new(&config.discord)?);

    let auth = StaticTokenAuth::from_config(&config.auth);
    if auth.is_empty() {
        warn!("no auth tokens configured; every connection will be rejected");
    } else {
        info!(tokens = auth.len(), "auth tokens loaded");
    }

    let hooks = Arc::new(build_hooks(&config));

    let state = GatewayState::new(&config, platform, store, Arc::new(auth), hooks);
    #[cfg(feature = "metrics")]
    let state = state.with_metrics_handle(metrics_handle);

    let bind = cli.bind.unwrap_or_else(|| config.server.bind.clone());
    let port = cli.port.unwrap_or(config.server.port);

    start_gateway(Arc::new(state), &bind, port, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    })
    .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "guildrelay starting");

    match cli.command {
        None | Some(Commands::Serve) => serve(cli).await,
        Some(Commands::Check { verbose }) => {
            config_commands::check(cli.config.as_deref(), verbose)
        },
    }
}
