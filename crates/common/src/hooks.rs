//! Notification hooks for relay lifecycle events.
//!
//! Cross-subsystem listeners (dashboards, audit logs, bridges to other
//! services) register a [`HookHandler`] and are told about every accepted
//! `created`/`updated`/`deleted`/`failed` event. Hooks are informational:
//! a failing handler is logged and counted, never allowed to stall the relay.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tracing::{debug, info, warn},
};

// ── HookEvent ───────────────────────────────────────────────────────────────

/// Relay events that hooks can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    MessageCreated,
    MessageUpdated,
    MessageDeleted,
    MessageFailed,
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl HookEvent {
    /// All variants, for iteration.
    pub const ALL: &'static [HookEvent] = &[
        Self::MessageCreated,
        Self::MessageUpdated,
        Self::MessageDeleted,
        Self::MessageFailed,
    ];
}

// ── HookPayload ─────────────────────────────────────────────────────────────

/// Payload carried with each notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookPayload {
    pub event: HookEvent,
    pub channel_id: String,
    pub message_id: String,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_token: Option<String>,
    /// True when the message originated on the external platform.
    pub external: bool,
    /// Failure reason, only set for [`HookEvent::MessageFailed`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ── HookHandler trait ───────────────────────────────────────────────────────

#[async_trait]
pub trait HookHandler: Send + Sync {
    /// A human-readable name for this handler.
    fn name(&self) -> &str;

    /// Which events this handler subscribes to.
    fn events(&self) -> &[HookEvent];

    async fn handle(&self, payload: &HookPayload) -> Result<()>;
}

// ── HookStats ───────────────────────────────────────────────────────────────

/// Per-handler health statistics for circuit breaker logic.
pub struct HookStats {
    pub call_count: AtomicU64,
    pub failure_count: AtomicU64,
    pub consecutive_failures: AtomicU64,
    pub disabled: AtomicBool,
    pub disabled_at: std::sync::Mutex<Option<Instant>>,
}

impl HookStats {
    pub fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            disabled: AtomicBool::new(false),
            disabled_at: std::sync::Mutex::new(None),
        }
    }

    pub fn record_success(&self) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for HookStats {
    fn default() -> Self {
        Self::new()
    }
}

struct HandlerEntry {
    handler: Arc<dyn HookHandler>,
    stats: Arc<HookStats>,
}

// ── HookRegistry ────────────────────────────────────────────────────────────

/// Registered notification handlers, grouped by event.
pub struct HookRegistry {
    handlers: HashMap<HookEvent, Vec<HandlerEntry>>,
    circuit_breaker_threshold: u64,
    circuit_breaker_cooldown: Duration,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }

    pub fn with_circuit_breaker(mut self, threshold: u64, cooldown: Duration) -> Self {
        self.circuit_breaker_threshold = threshold;
        self.circuit_breaker_cooldown = cooldown;
        self
    }

    pub fn register(&mut self, handler: Arc<dyn HookHandler>) {
        let stats = Arc::new(HookStats::new());
        for &event in handler.events() {
            self.handlers.entry(event).or_default().push(HandlerEntry {
                handler: Arc::clone(&handler),
                stats: Arc::clone(&stats),
            });
        }
        info!(handler = handler.name(), "hook handler registered");
    }

    pub fn has_handlers(&self, event: HookEvent) -> bool {
        self.handlers.get(&event).is_some_and(|v| !v.is_empty())
    }

    pub fn handler_stats(&self, name: &str) -> Option<Arc<HookStats>> {
        self.handlers
            .values()
            .flatten()
            .find(|entry| entry.handler.name() == name)
            .map(|entry| Arc::clone(&entry.stats))
    }

    /// Returns true when the handler should be skipped.
    fn check_circuit_breaker(&self, entry: &HandlerEntry) -> bool {
        if !entry.stats.disabled.load(Ordering::Relaxed) {
            let consecutive = entry.stats.consecutive_failures.load(Ordering::Relaxed);
            if consecutive >= self.circuit_breaker_threshold {
                entry.stats.disabled.store(true, Ordering::Relaxed);
                *entry
                    .stats
                    .disabled_at
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
                warn!(
                    handler = entry.handler.name(),
                    consecutive, "hook circuit breaker tripped"
                );
                return true;
            }
            return false;
        }

        let disabled_at = entry
            .stats
            .disabled_at
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(at) = *disabled_at
            && at.elapsed() >= self.circuit_breaker_cooldown
        {
            drop(disabled_at);
            entry.stats.disabled.store(false, Ordering::Relaxed);
            entry.stats.consecutive_failures.store(0, Ordering::Relaxed);
            info!(
                handler = entry.handler.name(),
                "hook circuit breaker reset after cooldown"
            );
            return false;
        }
        true
    }

    /// Notify every handler subscribed to the payload's event, in parallel.
    pub async fn dispatch(&self, payload: &HookPayload) {
        let handlers = match self.handlers.get(&payload.event) {
            Some(h) if !h.is_empty() => h,
            _ => return,
        };

        debug!(event = %payload.event, count = handlers.len(), "dispatching hook event");

        let mut futures = Vec::new();
        for entry in handlers {
            if self.check_circuit_breaker(entry) {
                continue;
            }
            let handler = Arc::clone(&entry.handler);
            let stats = Arc::clone(&entry.stats);
            futures.push(async move {
                let result = handler.handle(payload).await;
                match &result {
                    Ok(()) => stats.record_success(),
                    Err(_) => stats.record_failure(),
                }
                (handler.name().to_string(), result)
            });
        }

        for (name, result) in futures::future::join_all(futures).await {
            if let Err(e) = result {
                warn!(handler = %name, event = %payload.event, error = %e, "hook handler failed");
            }
        }
    }
}
