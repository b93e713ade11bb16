use std::collections::{HashSet, VecDeque};

use guildrelay_protocol::EventOp;

/// Identity of an event for duplicate detection.
///
/// `revision` distinguishes successive edits of one message; it is zero for
/// every other operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub op: EventOp,
    pub message_id: String,
    pub token: Option<String>,
    pub revision: u64,
}

/// Bounded, insertion-ordered set of recently accepted keys for one channel.
///
/// Once `capacity` is exceeded the oldest key is evicted first.
#[derive(Debug)]
pub struct SuppressionCache {
    capacity: usize,
    order: VecDeque<DedupKey>,
    seen: HashSet<DedupKey>,
}

impl SuppressionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.seen.contains(key)
    }

    /// Record `key`. Returns false if it was already present.
    pub fn insert(&mut self, key: DedupKey) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(op: EventOp, id: &str) -> DedupKey {
        DedupKey {
            op,
            message_id: id.into(),
            token: Some("tok".into()),
            revision: 0,
        }
    }

    #[test]
    fn repeated_key_is_rejected() {
        let mut cache = SuppressionCache::new(8);
        assert!(cache.insert(key(EventOp::Created, "m1")));
        assert!(!cache.insert(key(EventOp::Created, "m1")));
        assert!(cache.insert(key(EventOp::Updated, "m1")));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn oldest_key_is_evicted_first() {
        let mut cache = SuppressionCache::new(2);
        cache.insert(key(EventOp::Created, "m1"));
        cache.insert(key(EventOp::Created, "m2"));
        cache.insert(key(EventOp::Created, "m3"));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&key(EventOp::Created, "m1")));
        assert!(cache.contains(&key(EventOp::Created, "m2")));
        assert!(cache.contains(&key(EventOp::Created, "m3")));
        // Evicted keys are accepted again.
        assert!(cache.insert(key(EventOp::Created, "m1")));
    }

    #[test]
    fn revisions_are_distinct_keys() {
        let mut cache = SuppressionCache::new(8);
        let mut first = key(EventOp::Updated, "m1");
        first.revision = 1;
        let mut second = first.clone();
        second.revision = 2;
        assert!(cache.insert(first.clone()));
        assert!(cache.insert(second));
        assert!(!cache.insert(first));
    }

    #[test]
    fn zero_capacity_suppresses_nothing() {
        let mut cache = SuppressionCache::new(0);
        assert!(cache.insert(key(EventOp::Created, "m1")));
        assert!(cache.insert(key(EventOp::Created, "m1")));
        assert!(cache.is_empty());
    }
}
