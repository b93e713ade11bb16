//! The relay's single logical context: scheduler, registry and flush timers.
//!
//! Every mutation of cursors, suppression caches, pending batches and
//! subscriptions happens under one lock, and frames are queued to client
//! write loops while it is held. That makes per-channel delivery order equal
//! to enqueue order and guarantees a subscriber's `resync` precedes any batch
//! it is owed.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use {
    guildrelay_common::hooks::{HookEvent, HookPayload, HookRegistry},
    guildrelay_config::SchedulerConfig,
    guildrelay_protocol::{BatchEvent, ChannelRequest, EventOp, ServerFrame},
    rand::Rng,
    tokio::task::JoinHandle,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    scheduler::{BatchScheduler, Enqueued, RelayEvent},
    subscriptions::{FrameSender, SubscriptionRegistry},
    types::Identity,
};

struct HubState {
    scheduler: BatchScheduler,
    registry: SubscriptionRegistry,
    shut_down: bool,
}

struct Shared {
    state: Mutex<HubState>,
    config: SchedulerConfig,
    hooks: Arc<HookRegistry>,
}

/// Handle to the relay's channel state. Cheap to clone.
#[derive(Clone)]
pub struct RelayHub {
    shared: Arc<Shared>,
}

impl RelayHub {
    pub fn new(
        config: SchedulerConfig,
        restricted_roles: Vec<String>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let state = HubState {
            scheduler: BatchScheduler::new(config.suppression_capacity),
            registry: SubscriptionRegistry::new(restricted_roles),
            shut_down: false,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                config,
                hooks,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    // ── Sessions ────────────────────────────────────────────────────────────

    /// Register a connection. Frames for it are queued on `sender`.
    pub fn connect(&self, identity: Identity, sender: FrameSender) -> Result<String> {
        let mut state = self.lock();
        if state.shut_down {
            return Err(Error::Message("relay hub is shut down".into()));
        }
        let session_id = state.registry.connect(identity, sender);
        #[cfg(feature = "metrics")]
        guildrelay_metrics::gauge!(guildrelay_metrics::websocket::CONNECTIONS_ACTIVE)
            .set(state.registry.session_count() as f64);
        Ok(session_id)
    }

    /// Subscribe to the authorized subset of `channels`, answering each with
    /// `resync {channel, cursor}`. Returns the accepted `(channel, cursor)`
    /// pairs.
    pub fn subscribe(
        &self,
        session_id: &str,
        channels: &[ChannelRequest],
    ) -> Result<Vec<(String, u64)>> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let scheduler = &state.scheduler;
        let accepted = state
            .registry
            .subscribe(session_id, channels, |c| scheduler.cursor(c))?;

        if let Some(sender) = state.registry.sender(session_id) {
            for (channel, cursor) in &accepted {
                send_frame(&sender, &ServerFrame::Resync {
                    channel: channel.clone(),
                    cursor: *cursor,
                });
            }
        }
        Ok(accepted)
    }

    pub fn acknowledge(&self, session_id: &str, channel_id: &str, cursor: u64) -> Result<()> {
        self.lock()
            .registry
            .acknowledge(session_id, channel_id, cursor)
    }

    /// Reset the session's baseline to the channel's current cursor and
    /// report it. Nothing missed earlier is replayed.
    pub fn resync(&self, session_id: &str, channel_id: &str) -> Result<u64> {
        let mut state = self.lock();
        let cursor = state.scheduler.cursor(channel_id);
        state.registry.resync(session_id, channel_id, cursor)?;
        if let Some(sender) = state.registry.sender(session_id) {
            send_frame(&sender, &ServerFrame::Resync {
                channel: channel_id.to_string(),
                cursor,
            });
        }
        Ok(cursor)
    }

    /// Drop the session. In-flight relays it started still complete and
    /// reach the channel's other subscribers.
    pub fn disconnect(&self, session_id: &str) -> bool {
        let mut state = self.lock();
        let removed = state.registry.disconnect(session_id);
        #[cfg(feature = "metrics")]
        guildrelay_metrics::gauge!(guildrelay_metrics::websocket::CONNECTIONS_ACTIVE)
            .set(state.registry.session_count() as f64);
        removed
    }

    /// Queue a frame for one session, outside any channel batch.
    pub fn send_to(&self, session_id: &str, frame: &ServerFrame) -> bool {
        match self.lock().registry.sender(session_id) {
            Some(sender) => send_frame(&sender, frame),
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock().registry.session_count()
    }

    pub fn is_restricted(&self, channel_id: &str) -> bool {
        self.lock().registry.is_restricted(channel_id)
    }

    pub fn is_subscribed(&self, session_id: &str, channel_id: &str) -> bool {
        self.lock()
            .registry
            .subscription(session_id, channel_id)
            .is_some()
    }

    // ── Events ──────────────────────────────────────────────────────────────

    /// Offer an event to `channel_id`. Returns its sequence number, or `None`
    /// if it was suppressed as a duplicate.
    pub fn enqueue(&self, channel_id: &str, event: RelayEvent) -> Option<u64> {
        let hook_payload = self.hook_payload(channel_id, &event);
        let op = event.op;

        let sequence = {
            let mut state = self.lock();
            if state.shut_down {
                return None;
            }
            match state.scheduler.enqueue(channel_id, event, Instant::now()) {
                Enqueued::Suppressed => {
                    #[cfg(feature = "metrics")]
                    guildrelay_metrics::counter!(
                        guildrelay_metrics::scheduler::EVENTS_SUPPRESSED_TOTAL,
                        guildrelay_metrics::labels::OP => op.as_str()
                    )
                    .increment(1);
                    return None;
                },
                Enqueued::Accepted {
                    sequence,
                    schedule_flush,
                } => {
                    if schedule_flush {
                        let timer = self.spawn_flush(channel_id);
                        state.scheduler.set_flush_timer(channel_id, timer);
                    }
                    sequence
                },
            }
        };

        debug!(channel_id, op = op.as_str(), sequence, "event accepted");
        #[cfg(feature = "metrics")]
        guildrelay_metrics::counter!(
            guildrelay_metrics::scheduler::EVENTS_ACCEPTED_TOTAL,
            guildrelay_metrics::labels::OP => op.as_str()
        )
        .increment(1);

        if let Some(mut payload) = hook_payload {
            payload.sequence = sequence;
            let hooks = Arc::clone(&self.shared.hooks);
            tokio::spawn(async move { hooks.dispatch(&payload).await });
        }
        Some(sequence)
    }

    fn hook_payload(&self, channel_id: &str, event: &RelayEvent) -> Option<HookPayload> {
        let hook_event = match event.op {
            EventOp::Created => HookEvent::MessageCreated,
            EventOp::Updated => HookEvent::MessageUpdated,
            EventOp::Deleted => HookEvent::MessageDeleted,
            EventOp::Failed => HookEvent::MessageFailed,
        };
        if !self.shared.hooks.has_handlers(hook_event) {
            return None;
        }
        Some(HookPayload {
            event: hook_event,
            channel_id: channel_id.to_string(),
            message_id: event.data.message_id.clone(),
            sequence: 0,
            correlation_token: event.data.correlation_token.clone(),
            external: event.data.external,
            reason: event.data.reason.clone(),
        })
    }

    fn spawn_flush(&self, channel_id: &str) -> tokio::task::AbortHandle {
        let min = self.shared.config.jitter_min_ms;
        let max = self.shared.config.jitter_max_ms.max(min);
        let delay = Duration::from_millis(rand::rng().random_range(min..=max));
        let hub = self.clone();
        let channel_id = channel_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            hub.flush(&channel_id);
        })
        .abort_handle()
    }

    /// Send everything pending on `channel_id` to its current subscribers.
    pub fn flush(&self, channel_id: &str) {
        let mut state = self.lock();
        let events = state.scheduler.take_pending(channel_id);
        if events.is_empty() {
            return;
        }
        let subscribers = state.registry.subscribers(channel_id);
        debug!(
            channel_id,
            events = events.len(),
            subscribers = subscribers.len(),
            "flushing batch"
        );

        let mut shared_frame: Option<String> = None;
        for sub in &subscribers {
            let deliver_all = events.first().is_some_and(|e| e.sequence > sub.baseline);
            if deliver_all {
                let frame = shared_frame.get_or_insert_with(|| {
                    encode(&ServerFrame::Batch {
                        channel: channel_id.to_string(),
                        events: events.clone(),
                    })
                });
                if !frame.is_empty() {
                    let _ = sub.sender.send(frame.clone());
                }
                continue;
            }
            let visible: Vec<BatchEvent> = events
                .iter()
                .filter(|e| e.sequence > sub.baseline)
                .cloned()
                .collect();
            if !visible.is_empty() {
                send_frame(&sub.sender, &ServerFrame::Batch {
                    channel: channel_id.to_string(),
                    events: visible,
                });
            }
        }
        drop(state);

        #[cfg(feature = "metrics")]
        guildrelay_metrics::counter!(guildrelay_metrics::scheduler::BATCHES_FLUSHED_TOTAL)
            .increment(1);
    }

    // ── Channel lifecycle ───────────────────────────────────────────────────

    pub fn cursor(&self, channel_id: &str) -> u64 {
        self.lock().scheduler.cursor(channel_id)
    }

    pub fn pending_len(&self, channel_id: &str) -> usize {
        self.lock().scheduler.pending_len(channel_id)
    }

    /// Forget the channel's cursor, suppression cache and pending batch. The
    /// restricted mark goes too once the channel has no subscribers.
    pub fn cleanup_channel(&self, channel_id: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            state.registry.forget_channel(channel_id);
            state.scheduler.cleanup_channel(channel_id)
        };
        if removed {
            info!(channel_id, "channel state cleaned up");
            #[cfg(feature = "metrics")]
            guildrelay_metrics::counter!(guildrelay_metrics::scheduler::CHANNELS_CLEANED_TOTAL)
                .increment(1);
        }
        removed
    }

    /// Clean up channels with no subscribers and no activity for `ttl`.
    pub fn sweep_idle(&self, ttl: Duration) -> Vec<String> {
        let mut state = self.lock();
        let idle: Vec<String> = state
            .scheduler
            .idle_channels(Instant::now(), ttl)
            .into_iter()
            .filter(|c| !state.registry.has_subscribers(c))
            .collect();
        for channel_id in &idle {
            state.scheduler.cleanup_channel(channel_id);
            state.registry.forget_channel(channel_id);
        }
        drop(state);

        if !idle.is_empty() {
            info!(count = idle.len(), "idle channels swept");
            #[cfg(feature = "metrics")]
            guildrelay_metrics::counter!(guildrelay_metrics::scheduler::CHANNELS_CLEANED_TOTAL)
                .increment(idle.len() as u64);
        }
        idle
    }

    /// Periodically sweep idle channels. `None` when sweeping is disabled.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let interval_secs = self.shared.config.sweep_interval_secs;
        if interval_secs == 0 {
            return None;
        }
        let ttl = Duration::from_secs(self.shared.config.idle_channel_ttl_secs);
        let hub = self.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                if hub.is_shut_down() {
                    break;
                }
                hub.sweep_idle(ttl);
            }
        }))
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// Abort all flush timers and drop every session and channel.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        state.scheduler.clear();
        state.registry.clear();
        info!("relay hub shut down");
    }
}

fn encode(frame: &ServerFrame) -> String {
    serde_json::to_string(frame).unwrap_or_else(|e| {
        warn!(error = %e, "failed to serialize frame");
        String::new()
    })
}

/// Queue `frame` on `sender`. False if the client is gone.
fn send_frame(sender: &FrameSender, frame: &ServerFrame) -> bool {
    let text = encode(frame);
    !text.is_empty() && sender.send(text).is_ok()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        guildrelay_protocol::EventData,
        std::sync::atomic::{AtomicUsize, Ordering},
        tokio::sync::mpsc,
    };

    fn hub() -> RelayHub {
        let config = SchedulerConfig {
            jitter_min_ms: 1,
            jitter_max_ms: 5,
            ..SchedulerConfig::default()
        };
        RelayHub::new(config, vec!["staff".into()], Arc::new(HookRegistry::new()))
    }

    fn member() -> Identity {
        Identity {
            user_id: "u1".into(),
            display_name: "Ada".into(),
            roles: Vec::new(),
        }
    }

    fn req(id: &str) -> ChannelRequest {
        ChannelRequest {
            id: id.into(),
            restricted: false,
        }
    }

    fn created(id: &str) -> RelayEvent {
        RelayEvent::created(EventData {
            message_id: id.into(),
            channel_id: "c1".into(),
            correlation_token: Some(format!("tok-{id}")),
            ..Default::default()
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(text) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    fn batch_sequences(frames: &[ServerFrame]) -> Vec<u64> {
        frames
            .iter()
            .filter_map(|f| match f {
                ServerFrame::Batch { events, .. } => Some(events.iter().map(|e| e.sequence)),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[tokio::test]
    async fn subscribe_answers_with_current_cursor() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = hub.connect(member(), tx).unwrap();

        hub.enqueue("c1", created("m1"));
        hub.enqueue("c1", created("m2"));

        let accepted = hub.subscribe(&session, &[req("c1")]).unwrap();
        assert_eq!(accepted, vec![("c1".to_string(), 2)]);
        assert_eq!(drain(&mut rx), vec![ServerFrame::Resync {
            channel: "c1".into(),
            cursor: 2,
        }]);
    }

    #[tokio::test]
    async fn repeated_subs_without_events_report_same_cursor() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = hub.connect(member(), tx).unwrap();
        hub.enqueue("c1", created("m1"));
        hub.flush("c1");

        hub.subscribe(&session, &[req("c1")]).unwrap();
        hub.subscribe(&session, &[req("c1")]).unwrap();
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], frames[1]);
    }

    #[tokio::test]
    async fn delivered_sequences_increase_from_resync_cursor() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = hub.connect(member(), tx).unwrap();

        hub.enqueue("c1", created("m1"));
        hub.enqueue("c1", created("m2"));
        hub.subscribe(&session, &[req("c1")]).unwrap();
        hub.enqueue("c1", created("m3"));
        hub.enqueue("c1", created("m3"));
        hub.enqueue("c1", created("m4"));
        hub.flush("c1");

        let frames = drain(&mut rx);
        let ServerFrame::Resync { cursor, .. } = frames[0] else {
            panic!("expected resync first");
        };
        assert_eq!(cursor, 2);
        // Events queued before the sub (1, 2) are not redelivered.
        assert_eq!(batch_sequences(&frames), vec![3, 4]);
    }

    #[tokio::test]
    async fn duplicate_events_are_batched_once() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = hub.connect(member(), tx).unwrap();
        hub.subscribe(&session, &[req("c1")]).unwrap();

        assert_eq!(hub.enqueue("c1", created("m1")), Some(1));
        assert_eq!(hub.enqueue("c1", created("m1")), None);
        let mut update = created("m1");
        update.op = EventOp::Updated;
        assert_eq!(hub.enqueue("c1", update), Some(2));
        hub.flush("c1");

        let frames = drain(&mut rx);
        let ServerFrame::Batch { events, .. } = &frames[1] else {
            panic!("expected batch");
        };
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].op, EventOp::Created);
        assert_eq!(events[1].op, EventOp::Updated);
    }

    #[tokio::test]
    async fn jittered_timer_flushes_burst_as_one_batch() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = hub.connect(member(), tx).unwrap();
        hub.subscribe(&session, &[req("c1")]).unwrap();
        rx.recv().await.unwrap();

        for i in 0..5 {
            hub.enqueue("c1", created(&format!("m{i}")));
        }
        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let frame: ServerFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(batch_sequences(&[frame]), vec![1, 2, 3, 4, 5]);
        assert_eq!(hub.pending_len("c1"), 0);
    }

    #[tokio::test]
    async fn cleanup_resets_channel_numbering() {
        let hub = hub();
        hub.enqueue("c1", created("m1"));
        hub.enqueue("c1", created("m2"));

        assert!(hub.cleanup_channel("c1"));
        assert_eq!(hub.cursor("c1"), 0);
        assert_eq!(hub.pending_len("c1"), 0);
        assert_eq!(hub.enqueue("c1", created("m1")), Some(1));
    }

    #[tokio::test]
    async fn batches_only_reach_subscribers_of_the_channel() {
        let hub = hub();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = hub.connect(member(), tx_a).unwrap();
        let b = hub.connect(member(), tx_b).unwrap();
        hub.subscribe(&a, &[req("c1")]).unwrap();
        hub.subscribe(&b, &[req("c2")]).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.enqueue("c1", created("m1"));
        hub.flush("c1");
        assert_eq!(batch_sequences(&drain(&mut rx_a)), vec![1]);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn disconnected_session_stops_receiving() {
        let hub = hub();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = hub.connect(member(), tx_a).unwrap();
        let b = hub.connect(member(), tx_b).unwrap();
        hub.subscribe(&a, &[req("c1")]).unwrap();
        hub.subscribe(&b, &[req("c1")]).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        assert!(hub.disconnect(&a));
        hub.enqueue("c1", created("m1"));
        hub.flush("c1");
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(batch_sequences(&drain(&mut rx_b)), vec![1]);
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn resync_moves_baseline_past_pending_events() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = hub.connect(member(), tx).unwrap();
        hub.subscribe(&session, &[req("c1")]).unwrap();
        hub.enqueue("c1", created("m1"));

        assert_eq!(hub.resync(&session, "c1").unwrap(), 1);
        hub.enqueue("c1", created("m2"));
        hub.flush("c1");

        let frames = drain(&mut rx);
        assert_eq!(batch_sequences(&frames), vec![2]);
        assert!(matches!(
            hub.resync(&session, "other"),
            Err(Error::NotSubscribed { .. })
        ));
    }

    #[tokio::test]
    async fn sweep_skips_channels_with_subscribers() {
        let hub = hub();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = hub.connect(member(), tx).unwrap();
        hub.subscribe(&session, &[req("watched")]).unwrap();
        hub.enqueue("watched", created("m1"));
        hub.enqueue("idle", created("m1"));
        hub.flush("watched");
        hub.flush("idle");

        let swept = hub.sweep_idle(Duration::ZERO);
        assert_eq!(swept, vec!["idle".to_string()]);
        assert_eq!(hub.cursor("watched"), 1);
        assert_eq!(hub.cursor("idle"), 0);
    }

    #[tokio::test]
    async fn sweep_forgets_restriction_of_abandoned_channels() {
        let hub = hub();
        let staff = Identity {
            roles: vec!["staff".into()],
            ..member()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = hub.connect(staff, tx).unwrap();
        let restricted = ChannelRequest {
            id: "staff-room".into(),
            restricted: true,
        };
        hub.subscribe(&session, &[restricted]).unwrap();
        hub.enqueue("staff-room", created("m1"));
        hub.flush("staff-room");

        assert!(hub.sweep_idle(Duration::ZERO).is_empty());
        assert!(hub.is_restricted("staff-room"));

        hub.disconnect(&session);
        assert_eq!(hub.sweep_idle(Duration::ZERO), vec!["staff-room".to_string()]);
        assert!(!hub.is_restricted("staff-room"));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.connect(member(), tx).unwrap();
        hub.enqueue("c1", created("m1"));

        hub.shutdown();
        assert!(hub.is_shut_down());
        assert_eq!(hub.session_count(), 0);
        assert_eq!(hub.enqueue("c1", created("m2")), None);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(hub.connect(member(), tx).is_err());
        // Sender dropped with the session.
        assert!(rx.recv().await.is_none());
    }

    struct CountingHook {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl guildrelay_common::hooks::HookHandler for CountingHook {
        fn name(&self) -> &str {
            "counting"
        }

        fn events(&self) -> &[HookEvent] {
            &[HookEvent::MessageFailed]
        }

        async fn handle(&self, payload: &HookPayload) -> anyhow::Result<()> {
            assert_eq!(payload.reason.as_deref(), Some("gone"));
            assert_eq!(payload.sequence, 1);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn hooks_fire_for_subscribed_events() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks = HookRegistry::new();
        hooks.register(Arc::new(CountingHook {
            calls: Arc::clone(&calls),
        }));
        let hub = RelayHub::new(SchedulerConfig::default(), Vec::new(), Arc::new(hooks));

        hub.enqueue("c1", RelayEvent::failed(EventData::default(), "gone", 1));
        hub.enqueue("c1", created("m2"));

        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
