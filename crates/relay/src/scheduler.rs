//! Per-channel cursor assignment, duplicate suppression and pending batches.
//!
//! The scheduler is plain state: it never spawns or sleeps. [`crate::hub`]
//! owns the flush timers and calls back into it under its lock.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use {
    guildrelay_protocol::{BatchEvent, EventData, EventOp},
    tokio::task::AbortHandle,
    tracing::debug,
};

use crate::suppression::{DedupKey, SuppressionCache};

/// An event offered to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    pub op: EventOp,
    pub data: EventData,
    pub revision: u64,
}

impl RelayEvent {
    pub fn created(data: EventData) -> Self {
        Self {
            op: EventOp::Created,
            data,
            revision: 0,
        }
    }

    /// An edit. `revision` is the message's edit count, so every accepted
    /// edit gets its own key even when it restores earlier content.
    pub fn updated(data: EventData, revision: u64) -> Self {
        Self {
            op: EventOp::Updated,
            data,
            revision,
        }
    }

    pub fn deleted(data: EventData) -> Self {
        Self {
            op: EventOp::Deleted,
            data,
            revision: 0,
        }
    }

    /// A relay that did not reach the platform. `attempt` identifies the
    /// relay so repeated failures for one message are each reported.
    pub fn failed(mut data: EventData, reason: impl Into<String>, attempt: u64) -> Self {
        data.reason = Some(reason.into());
        Self {
            op: EventOp::Failed,
            data,
            revision: attempt,
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            op: self.op,
            message_id: self.data.message_id.clone(),
            token: self.data.correlation_token.clone(),
            revision: self.revision,
        }
    }
}

/// Result of [`BatchScheduler::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Seen recently; dropped without consuming a sequence number.
    Suppressed,
    Accepted {
        sequence: u64,
        /// No flush was outstanding; the caller must schedule one.
        schedule_flush: bool,
    },
}

#[derive(Debug)]
struct ChannelState {
    sequence: u64,
    suppression: SuppressionCache,
    pending: Vec<BatchEvent>,
    flush_scheduled: bool,
    flush_timer: Option<AbortHandle>,
    last_activity: Instant,
}

impl ChannelState {
    fn new(capacity: usize, now: Instant) -> Self {
        Self {
            sequence: 0,
            suppression: SuppressionCache::new(capacity),
            pending: Vec::new(),
            flush_scheduled: false,
            flush_timer: None,
            last_activity: now,
        }
    }

    fn abort_timer(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            timer.abort();
        }
        self.flush_scheduled = false;
    }
}

#[derive(Debug)]
pub struct BatchScheduler {
    suppression_capacity: usize,
    channels: HashMap<String, ChannelState>,
}

impl BatchScheduler {
    pub fn new(suppression_capacity: usize) -> Self {
        Self {
            suppression_capacity,
            channels: HashMap::new(),
        }
    }

    pub fn enqueue(&mut self, channel_id: &str, event: RelayEvent, now: Instant) -> Enqueued {
        let capacity = self.suppression_capacity;
        let state = self
            .channels
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelState::new(capacity, now));
        state.last_activity = now;

        if !state.suppression.insert(event.dedup_key()) {
            debug!(
                channel_id,
                op = event.op.as_str(),
                message_id = %event.data.message_id,
                "duplicate event suppressed"
            );
            return Enqueued::Suppressed;
        }

        state.sequence += 1;
        let sequence = state.sequence;
        state.pending.push(BatchEvent {
            op: event.op,
            sequence,
            data: event.data,
        });

        let schedule_flush = !state.flush_scheduled;
        state.flush_scheduled = true;
        Enqueued::Accepted {
            sequence,
            schedule_flush,
        }
    }

    /// Remember the timer that will flush `channel_id`.
    pub fn set_flush_timer(&mut self, channel_id: &str, timer: AbortHandle) {
        match self.channels.get_mut(channel_id) {
            Some(state) => state.flush_timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Remove and return everything pending for `channel_id`.
    pub fn take_pending(&mut self, channel_id: &str) -> Vec<BatchEvent> {
        let Some(state) = self.channels.get_mut(channel_id) else {
            return Vec::new();
        };
        state.flush_scheduled = false;
        state.flush_timer = None;
        std::mem::take(&mut state.pending)
    }

    /// Current cursor: the last sequence number assigned on the channel.
    pub fn cursor(&self, channel_id: &str) -> u64 {
        self.channels.get(channel_id).map_or(0, |s| s.sequence)
    }

    pub fn pending_len(&self, channel_id: &str) -> usize {
        self.channels.get(channel_id).map_or(0, |s| s.pending.len())
    }

    pub fn has_flush_scheduled(&self, channel_id: &str) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|s| s.flush_scheduled)
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.channels.contains_key(channel_id)
    }

    /// Drop cursor, suppression cache, pending batch and timer for a channel.
    pub fn cleanup_channel(&mut self, channel_id: &str) -> bool {
        match self.channels.remove(channel_id) {
            Some(mut state) => {
                state.abort_timer();
                true
            },
            None => false,
        }
    }

    /// Channels with nothing pending and no activity for at least `ttl`.
    pub fn idle_channels(&self, now: Instant, ttl: Duration) -> Vec<String> {
        self.channels
            .iter()
            .filter(|(_, s)| {
                s.pending.is_empty() && now.saturating_duration_since(s.last_activity) >= ttl
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Abort every flush timer and forget all channel state.
    pub fn clear(&mut self) {
        for state in self.channels.values_mut() {
            state.abort_timer();
        }
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(id: &str, token: Option<&str>) -> EventData {
        EventData {
            message_id: id.into(),
            channel_id: "c1".into(),
            correlation_token: token.map(Into::into),
            content: "hello".into(),
            ..Default::default()
        }
    }

    #[test]
    fn sequences_increase_and_duplicates_do_not_consume_them() {
        let mut s = BatchScheduler::new(16);
        let now = Instant::now();

        assert_eq!(
            s.enqueue("c1", RelayEvent::created(data("m1", Some("t1"))), now),
            Enqueued::Accepted {
                sequence: 1,
                schedule_flush: true,
            }
        );
        assert_eq!(
            s.enqueue("c1", RelayEvent::created(data("m1", Some("t1"))), now),
            Enqueued::Suppressed
        );
        assert_eq!(
            s.enqueue("c1", RelayEvent::created(data("m2", None)), now),
            Enqueued::Accepted {
                sequence: 2,
                schedule_flush: false,
            }
        );
        assert_eq!(s.cursor("c1"), 2);

        let pending = s.take_pending("c1");
        assert_eq!(
            pending.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(!s.has_flush_scheduled("c1"));
    }

    #[test]
    fn created_and_updated_for_same_message_are_distinct() {
        let mut s = BatchScheduler::new(16);
        let now = Instant::now();
        s.enqueue("c1", RelayEvent::created(data("m1", Some("t1"))), now);
        s.enqueue("c1", RelayEvent::updated(data("m1", Some("t1")), 1), now);
        assert_eq!(s.pending_len("c1"), 2);
    }

    #[test]
    fn repeated_revision_is_suppressed_but_next_revision_is_not() {
        let mut s = BatchScheduler::new(16);
        let now = Instant::now();
        s.enqueue("c1", RelayEvent::updated(data("m1", Some("t1")), 1), now);
        assert_eq!(
            s.enqueue("c1", RelayEvent::updated(data("m1", Some("t1")), 1), now),
            Enqueued::Suppressed
        );
        // Same content as revision 1, still a distinct edit.
        assert!(matches!(
            s.enqueue("c1", RelayEvent::updated(data("m1", Some("t1")), 2), now),
            Enqueued::Accepted { sequence: 2, .. }
        ));
    }

    #[test]
    fn failures_of_separate_relays_are_all_kept() {
        let mut s = BatchScheduler::new(16);
        let now = Instant::now();
        for attempt in 1..=2 {
            assert!(matches!(
                s.enqueue(
                    "c1",
                    RelayEvent::failed(data("m1", Some("t1")), "forbidden", attempt),
                    now
                ),
                Enqueued::Accepted { .. }
            ));
        }
        assert_eq!(
            s.enqueue("c1", RelayEvent::failed(data("m1", Some("t1")), "forbidden", 2), now),
            Enqueued::Suppressed
        );
        assert_eq!(s.pending_len("c1"), 2);
    }

    #[test]
    fn channels_are_numbered_independently() {
        let mut s = BatchScheduler::new(16);
        let now = Instant::now();
        s.enqueue("c1", RelayEvent::created(data("m1", None)), now);
        s.enqueue("c1", RelayEvent::created(data("m2", None)), now);
        assert!(matches!(
            s.enqueue("c2", RelayEvent::created(data("m1", None)), now),
            Enqueued::Accepted { sequence: 1, .. }
        ));
    }

    #[test]
    fn cleanup_resets_cursor_suppression_and_pending() {
        let mut s = BatchScheduler::new(16);
        let now = Instant::now();
        s.enqueue("c1", RelayEvent::created(data("m1", Some("t1"))), now);
        s.enqueue("c1", RelayEvent::created(data("m2", Some("t2"))), now);

        assert!(s.cleanup_channel("c1"));
        assert_eq!(s.cursor("c1"), 0);
        assert_eq!(s.pending_len("c1"), 0);
        assert!(!s.contains("c1"));

        // Suppression state is gone too, so the same key is accepted at 1.
        assert_eq!(
            s.enqueue("c1", RelayEvent::created(data("m1", Some("t1"))), now),
            Enqueued::Accepted {
                sequence: 1,
                schedule_flush: true,
            }
        );
        assert!(!s.cleanup_channel("missing"));
    }

    #[test]
    fn failed_events_carry_reason() {
        let event = RelayEvent::failed(data("m1", Some("t1")), "missing permissions", 1);
        assert_eq!(event.op, EventOp::Failed);
        assert_eq!(event.data.reason.as_deref(), Some("missing permissions"));
    }

    #[test]
    fn idle_channels_exclude_pending_and_recent() {
        let mut s = BatchScheduler::new(16);
        let start = Instant::now();
        s.enqueue("quiet", RelayEvent::created(data("m1", None)), start);
        s.take_pending("quiet");
        s.enqueue("busy", RelayEvent::created(data("m1", None)), start);

        let later = start + Duration::from_secs(120);
        s.enqueue("recent", RelayEvent::created(data("m1", None)), later);
        s.take_pending("recent");

        let idle = s.idle_channels(later, Duration::from_secs(60));
        assert_eq!(idle, vec!["quiet".to_string()]);
    }
}
