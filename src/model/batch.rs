//! Batches handed to delivery, and the record persisted when delivery fails.

use serde::{Deserialize, Serialize};

use super::{Event, Metadata};

/// Coarse device class attached to every batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Desktop,
    Mobile,
    Tablet,
    #[default]
    Unknown,
}

impl Device {
    /// Classify from a user-agent string.
    pub fn from_user_agent(ua: &str) -> Self {
        let ua = ua.to_ascii_lowercase();
        if ua.contains("ipad") || ua.contains("tablet") {
            Device::Tablet
        } else if ua.contains("mobi") || ua.contains("iphone") || ua.contains("android") {
            Device::Mobile
        } else if ua.is_empty() {
            Device::Unknown
        } else {
            Device::Desktop
        }
    }
}

/// A bounded set of queued events plus identity, built at flush time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsBatch {
    pub user_id: String,
    pub session_id: String,
    pub device: Device,
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_metadata: Option<Metadata>,
}

impl EventsBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

/// One undelivered batch as written to the `queue-recovery` slot, with the
/// identity it was built under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedQueue {
    pub user_id: String,
    pub session_id: String,
    pub device: Device,
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_metadata: Option<Metadata>,
    /// Wall-clock millis of the latest write.
    pub persisted_at: i64,
}

impl PersistedQueue {
    pub fn from_batch(batch: &EventsBatch, persisted_at: i64) -> Self {
        Self {
            user_id: batch.user_id.clone(),
            session_id: batch.session_id.clone(),
            device: batch.device,
            events: batch.events.clone(),
            global_metadata: batch.global_metadata.clone(),
            persisted_at,
        }
    }

    /// Rebuild the batch for another delivery attempt.
    pub fn to_batch(&self) -> EventsBatch {
        EventsBatch {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            device: self.device,
            events: self.events.clone(),
            global_metadata: self.global_metadata.clone(),
        }
    }

    /// Same user, session and device.
    pub fn same_identity(&self, other: &PersistedQueue) -> bool {
        self.user_id == other.user_id
            && self.session_id == other.session_id
            && self.device == other.device
    }

    /// Append the events of a newer record with the same identity, keeping
    /// order and skipping events already present.
    pub fn merge(&mut self, newer: PersistedQueue) {
        for event in newer.events {
            if !self.contains(&event) {
                self.events.push(event);
            }
        }
        self.persisted_at = self.persisted_at.max(newer.persisted_at);
    }

    /// Same fingerprint and timestamp as an event already held.
    fn contains(&self, event: &Event) -> bool {
        let fingerprint = event.fingerprint();
        self.events
            .iter()
            .any(|e| e.timestamp == event.timestamp && e.fingerprint() == fingerprint)
    }

    pub fn is_stale(&self, now: i64, max_age_ms: i64) -> bool {
        now.saturating_sub(self.persisted_at) > max_age_ms
    }
}

/// Everything in the `queue-recovery` slot, oldest first. Records are split
/// by identity, so events of an earlier session are never redelivered under
/// a later one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryBacklog {
    pub batches: Vec<PersistedQueue>,
}

impl RecoveryBacklog {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Total events held.
    pub fn len(&self) -> usize {
        self.batches.iter().map(|b| b.events.len()).sum()
    }

    /// Add a record, merging into the newest one when the identity matches.
    pub fn push(&mut self, record: PersistedQueue) {
        match self.batches.last_mut() {
            Some(last) if last.same_identity(&record) => last.merge(record),
            _ => self.batches.push(record),
        }
    }

    /// Forget the events of a delivered batch.
    pub fn acknowledge(&mut self, batch: &EventsBatch) {
        let delivered = PersistedQueue::from_batch(batch, 0);
        for record in self.batches.iter_mut().filter(|r| r.same_identity(&delivered)) {
            record.events.retain(|e| !delivered.contains(e));
        }
        self.batches.retain(|r| !r.events.is_empty());
    }

    /// Drop records older than `max_age_ms`. Returns the events dropped.
    pub fn drop_stale(&mut self, now: i64, max_age_ms: i64) -> usize {
        let before = self.len();
        self.batches.retain(|r| !r.is_stale(now, max_age_ms));
        before - self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(events: Vec<Event>, persisted_at: i64) -> PersistedQueue {
        PersistedQueue {
            user_id: "u".into(),
            session_id: "s".into(),
            device: Device::Desktop,
            events,
            global_metadata: None,
            persisted_at,
        }
    }

    #[test]
    fn merge_keeps_order_and_skips_repeats() {
        let a = Event::page_view("/a").at(1);
        let b = Event::page_view("/b").at(2);
        let c = Event::page_view("/c").at(3);

        let mut first = queue(vec![a.clone(), b.clone()], 10);
        first.merge(queue(vec![b.clone(), c.clone()], 20));

        assert_eq!(first.events, vec![a, b, c]);
        assert_eq!(first.persisted_at, 20);
    }

    #[test]
    fn backlog_keeps_sessions_apart() {
        let mut backlog = RecoveryBacklog::default();
        backlog.push(queue(vec![Event::page_view("/a").at(1)], 10));
        backlog.push(queue(vec![Event::page_view("/b").at(2)], 20));

        let mut later = queue(vec![Event::page_view("/c").at(3)], 30);
        later.session_id = "s2".into();
        backlog.push(later);

        assert_eq!(backlog.batches.len(), 2);
        assert_eq!(backlog.batches[0].session_id, "s");
        assert_eq!(backlog.batches[0].events.len(), 2);
        assert_eq!(backlog.batches[1].session_id, "s2");
        assert_eq!(backlog.len(), 3);
    }

    #[test]
    fn acknowledged_events_leave_the_backlog() {
        let a = Event::page_view("/a").at(1);
        let b = Event::page_view("/b").at(2);
        let mut backlog = RecoveryBacklog::default();
        backlog.push(queue(vec![a.clone(), b.clone()], 10));

        let mut sent = backlog.batches[0].to_batch();
        sent.events = vec![a];
        backlog.acknowledge(&sent);
        assert_eq!(backlog.batches[0].events, vec![b.clone()]);

        sent.events = vec![b];
        backlog.acknowledge(&sent);
        assert!(backlog.is_empty());
    }

    #[test]
    fn stale_records_are_dropped() {
        let mut backlog = RecoveryBacklog::default();
        backlog.push(queue(vec![Event::page_view("/a").at(1)], 0));
        let mut fresh = queue(vec![Event::page_view("/b").at(2)], 1_000);
        fresh.session_id = "s2".into();
        backlog.push(fresh);

        assert_eq!(backlog.drop_stale(1_500, 1_000), 1);
        assert_eq!(backlog.batches.len(), 1);
        assert_eq!(backlog.batches[0].session_id, "s2");
    }

    #[test]
    fn device_classification() {
        assert_eq!(
            Device::from_user_agent("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0) Mobile"),
            Device::Mobile
        );
        assert_eq!(Device::from_user_agent("Mozilla/5.0 (iPad)"), Device::Tablet);
        assert_eq!(
            Device::from_user_agent("Mozilla/5.0 (X11; Linux x86_64)"),
            Device::Desktop
        );
        assert_eq!(Device::from_user_agent(""), Device::Unknown);
    }
}
