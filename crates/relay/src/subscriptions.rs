//! Which sessions want which channels.

use std::collections::{HashMap, HashSet};

use {
    guildrelay_protocol::{ChannelRequest, MAX_CHANNELS_PER_SUB},
    tokio::sync::mpsc,
    tracing::{debug, info},
    uuid::Uuid,
};

use crate::{
    error::{Error, Result},
    types::Identity,
};

/// Serialized frames queued for one client's write loop.
pub type FrameSender = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    pub channel_id: String,
    pub authorized: bool,
    /// Cursor reported by the latest resync; only later events are delivered.
    pub baseline: u64,
    /// Last cursor the client acknowledged.
    pub acked: Option<u64>,
}

#[derive(Debug)]
struct Session {
    identity: Identity,
    sender: FrameSender,
    channels: HashMap<String, ChannelSubscription>,
}

/// A subscriber captured at flush time.
#[derive(Debug, Clone)]
pub struct SubscriberSnapshot {
    pub session_id: String,
    pub baseline: u64,
    pub sender: FrameSender,
}

#[derive(Debug)]
pub struct SubscriptionRegistry {
    restricted_roles: Vec<String>,
    sessions: HashMap<String, Session>,
    by_channel: HashMap<String, HashSet<String>>,
    restricted_channels: HashSet<String>,
}

impl SubscriptionRegistry {
    pub fn new(restricted_roles: Vec<String>) -> Self {
        Self {
            restricted_roles,
            sessions: HashMap::new(),
            by_channel: HashMap::new(),
            restricted_channels: HashSet::new(),
        }
    }

    /// Register a connection and return its session id.
    pub fn connect(&mut self, identity: Identity, sender: FrameSender) -> String {
        let session_id = Uuid::new_v4().to_string();
        info!(session_id = %session_id, user_id = %identity.user_id, "session connected");
        self.sessions.insert(session_id.clone(), Session {
            identity,
            sender,
            channels: HashMap::new(),
        });
        session_id
    }

    /// Subscribe to each authorized channel and return `(channel, cursor)`
    /// pairs to answer with `resync`. Unauthorized channels are dropped.
    pub fn subscribe(
        &mut self,
        session_id: &str,
        requests: &[ChannelRequest],
        cursor: impl Fn(&str) -> u64,
    ) -> Result<Vec<(String, u64)>> {
        if requests.len() > MAX_CHANNELS_PER_SUB {
            return Err(Error::validation(format!(
                "at most {MAX_CHANNELS_PER_SUB} channels per sub"
            )));
        }
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        let privileged = session.identity.has_any_role(&self.restricted_roles);

        let mut accepted = Vec::new();
        for request in requests {
            let restricted =
                request.restricted || self.restricted_channels.contains(&request.id);
            if restricted && !privileged {
                debug!(
                    session_id,
                    channel_id = %request.id,
                    "restricted channel dropped from sub"
                );
                continue;
            }
            if request.restricted {
                self.restricted_channels.insert(request.id.clone());
            }

            let current = cursor(&request.id);
            session
                .channels
                .entry(request.id.clone())
                .and_modify(|s| s.baseline = current)
                .or_insert_with(|| ChannelSubscription {
                    channel_id: request.id.clone(),
                    authorized: true,
                    baseline: current,
                    acked: None,
                });
            self.by_channel
                .entry(request.id.clone())
                .or_default()
                .insert(session_id.to_string());
            accepted.push((request.id.clone(), current));
        }
        Ok(accepted)
    }

    /// Record the client's cursor. Diagnostic only; nothing is redelivered.
    pub fn acknowledge(&mut self, session_id: &str, channel_id: &str, cursor: u64) -> Result<()> {
        let sub = self.subscription_mut(session_id, channel_id)?;
        sub.acked = Some(cursor);
        debug!(session_id, channel_id, cursor, "cursor acknowledged");
        Ok(())
    }

    /// Move the session's baseline for `channel_id` to `cursor`.
    pub fn resync(&mut self, session_id: &str, channel_id: &str, cursor: u64) -> Result<()> {
        let sub = self.subscription_mut(session_id, channel_id)?;
        sub.baseline = cursor;
        Ok(())
    }

    /// Drop the session and all of its subscriptions.
    pub fn disconnect(&mut self, session_id: &str) -> bool {
        let Some(session) = self.sessions.remove(session_id) else {
            return false;
        };
        for channel_id in session.channels.keys() {
            self.detach(session_id, channel_id);
        }
        info!(
            session_id,
            channels = session.channels.len(),
            "session disconnected"
        );
        true
    }

    pub fn subscribers(&self, channel_id: &str) -> Vec<SubscriberSnapshot> {
        let Some(ids) = self.by_channel.get(channel_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| {
                let session = self.sessions.get(id)?;
                let sub = session.channels.get(channel_id)?;
                Some(SubscriberSnapshot {
                    session_id: id.clone(),
                    baseline: sub.baseline,
                    sender: session.sender.clone(),
                })
            })
            .collect()
    }

    pub fn subscription(&self, session_id: &str, channel_id: &str) -> Option<&ChannelSubscription> {
        self.sessions.get(session_id)?.channels.get(channel_id)
    }

    pub fn sender(&self, session_id: &str) -> Option<FrameSender> {
        self.sessions.get(session_id).map(|s| s.sender.clone())
    }

    pub fn has_subscribers(&self, channel_id: &str) -> bool {
        self.by_channel
            .get(channel_id)
            .is_some_and(|ids| !ids.is_empty())
    }

    pub fn is_restricted(&self, channel_id: &str) -> bool {
        self.restricted_channels.contains(channel_id)
    }

    /// Drop the channel's restricted mark once nobody is subscribed to it.
    pub fn forget_channel(&mut self, channel_id: &str) -> bool {
        !self.has_subscribers(channel_id) && self.restricted_channels.remove(channel_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Forget every session; dropping the senders ends their write loops.
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.by_channel.clear();
    }

    fn subscription_mut(
        &mut self,
        session_id: &str,
        channel_id: &str,
    ) -> Result<&mut ChannelSubscription> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        session
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| Error::NotSubscribed {
                channel_id: channel_id.to_string(),
            })
    }

    fn detach(&mut self, session_id: &str, channel_id: &str) {
        if let Some(ids) = self.by_channel.get_mut(channel_id) {
            ids.remove(session_id);
            if ids.is_empty() {
                self.by_channel.remove(channel_id);
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn identity(roles: &[&str]) -> Identity {
        Identity {
            user_id: "u1".into(),
            display_name: "Ada".into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn req(id: &str, restricted: bool) -> ChannelRequest {
        ChannelRequest {
            id: id.into(),
            restricted,
        }
    }

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(vec!["staff".into()])
    }

    #[test]
    fn unauthorized_restricted_channels_are_silently_dropped() {
        let mut reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = reg.connect(identity(&["member"]), tx);

        let accepted = reg
            .subscribe(&session, &[req("general", false), req("staff-room", true)], |_| 0)
            .unwrap();
        assert_eq!(accepted, vec![("general".to_string(), 0)]);
        assert!(reg.subscription(&session, "staff-room").is_none());
        assert!(!reg.has_subscribers("staff-room"));
    }

    #[test]
    fn restriction_sticks_to_the_channel() {
        let mut reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let staff = reg.connect(identity(&["staff"]), tx.clone());
        let member = reg.connect(identity(&[]), tx);

        reg.subscribe(&staff, &[req("staff-room", true)], |_| 0)
            .unwrap();
        assert!(reg.is_restricted("staff-room"));

        // Omitting the flag does not bypass it.
        let accepted = reg
            .subscribe(&member, &[req("staff-room", false)], |_| 0)
            .unwrap();
        assert!(accepted.is_empty());
    }

    #[test]
    fn restriction_is_forgotten_only_without_subscribers() {
        let mut reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let staff = reg.connect(identity(&["staff"]), tx);
        reg.subscribe(&staff, &[req("staff-room", true)], |_| 0)
            .unwrap();

        assert!(!reg.forget_channel("staff-room"));
        assert!(reg.is_restricted("staff-room"));

        reg.disconnect(&staff);
        assert!(reg.forget_channel("staff-room"));
        assert!(!reg.is_restricted("staff-room"));
    }

    #[test]
    fn resubscribe_reports_cursor_and_moves_baseline() {
        let mut reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = reg.connect(identity(&[]), tx);

        let first = reg.subscribe(&session, &[req("c1", false)], |_| 4).unwrap();
        let second = reg.subscribe(&session, &[req("c1", false)], |_| 4).unwrap();
        assert_eq!(first, second);

        reg.subscribe(&session, &[req("c1", false)], |_| 9).unwrap();
        assert_eq!(reg.subscription(&session, "c1").unwrap().baseline, 9);
        assert_eq!(reg.subscribers("c1").len(), 1);
    }

    #[test]
    fn ack_and_resync_require_subscription() {
        let mut reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = reg.connect(identity(&[]), tx);

        assert!(matches!(
            reg.acknowledge(&session, "c1", 3),
            Err(Error::NotSubscribed { .. })
        ));
        reg.subscribe(&session, &[req("c1", false)], |_| 0).unwrap();
        reg.acknowledge(&session, "c1", 3).unwrap();
        reg.resync(&session, "c1", 5).unwrap();

        let sub = reg.subscription(&session, "c1").unwrap();
        assert_eq!(sub.acked, Some(3));
        assert_eq!(sub.baseline, 5);
        assert!(matches!(
            reg.resync("nope", "c1", 1),
            Err(Error::UnknownSession { .. })
        ));
    }

    #[test]
    fn disconnect_removes_all_subscriptions() {
        let mut reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = reg.connect(identity(&[]), tx);
        reg.subscribe(&session, &[req("c1", false), req("c2", false)], |_| 0)
            .unwrap();

        assert!(reg.disconnect(&session));
        assert!(!reg.has_subscribers("c1"));
        assert!(!reg.has_subscribers("c2"));
        assert_eq!(reg.session_count(), 0);
        assert!(!reg.disconnect(&session));
    }

    #[test]
    fn oversized_sub_is_rejected() {
        let mut reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = reg.connect(identity(&[]), tx);
        let requests: Vec<_> = (0..=MAX_CHANNELS_PER_SUB)
            .map(|i| req(&format!("c{i}"), false))
            .collect();
        assert!(matches!(
            reg.subscribe(&session, &requests, |_| 0),
            Err(Error::Validation { .. })
        ));
    }
}
