//! Semantic validation of a loaded configuration.

use crate::schema::RelayConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "scheduler.jitter_min_ms"
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Check a config for values the relay cannot run with.
pub fn validate(config: &RelayConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if config.relay.max_attempts == 0 {
        result.push(
            Severity::Error,
            "relay.max_attempts",
            "must allow at least one attempt",
        );
    }
    if config.relay.max_content_chars == 0 {
        result.push(Severity::Error, "relay.max_content_chars", "must be positive");
    }
    if config.relay.rate_limit_default_ms > config.relay.rate_limit_max_ms {
        result.push(
            Severity::Warning,
            "relay.rate_limit_default_ms",
            "exceeds rate_limit_max_ms and will be clamped",
        );
    }

    let sched = &config.scheduler;
    if sched.jitter_min_ms > sched.jitter_max_ms {
        result.push(
            Severity::Error,
            "scheduler.jitter_min_ms",
            format!(
                "jitter window is inverted ({} > {})",
                sched.jitter_min_ms, sched.jitter_max_ms
            ),
        );
    }
    if sched.suppression_capacity == 0 {
        result.push(
            Severity::Error,
            "scheduler.suppression_capacity",
            "must be positive or duplicates are never suppressed",
        );
    }
    if sched.sweep_interval_secs == 0 {
        result.push(
            Severity::Info,
            "scheduler.sweep_interval_secs",
            "idle channel sweeping is disabled",
        );
    }

    let fmt = &config.formatter;
    for (path, value) in [
        ("formatter.text_cap", fmt.text_cap),
        ("formatter.block_cap", fmt.block_cap),
        ("formatter.max_blocks", fmt.max_blocks),
        ("formatter.aggregate_cap", fmt.aggregate_cap),
    ] {
        if value == 0 {
            result.push(Severity::Error, path, "must be positive");
        }
    }
    if fmt.aggregate_cap < fmt.block_cap {
        result.push(
            Severity::Warning,
            "formatter.aggregate_cap",
            "smaller than block_cap; blocks will never reach their cap",
        );
    }
    if fmt.token_marker.trim().is_empty() {
        result.push(
            Severity::Error,
            "formatter.token_marker",
            "echoes cannot be recognized without a marker",
        );
    }
    if fmt.aggregate_cap <= fmt.token_marker.chars().count() + 32 {
        result.push(
            Severity::Error,
            "formatter.aggregate_cap",
            "leaves no room for content next to the correlation token",
        );
    }

    if config.auth.tokens.is_empty() {
        result.push(
            Severity::Warning,
            "auth.tokens",
            "no tokens configured; every connection will be rejected",
        );
    }
    if config.discord.bot_token.is_none() {
        result.push(
            Severity::Warning,
            "discord.bot_token",
            "not set; platform calls will be unauthenticated",
        );
    }

    result
}
