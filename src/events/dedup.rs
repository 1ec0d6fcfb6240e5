//! Duplicate suppression and rate limiting.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::model::Fingerprint;

/// Hard ceiling on tracked fingerprints.
pub const MAX_FINGERPRINTS: usize = 1000;

const MINUTE: Duration = Duration::from_secs(60);
const SECOND: Duration = Duration::from_secs(1);

/// Why an event was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Same fingerprint accepted less than the dedup window ago.
    Duplicate,
    /// Same fingerprint already accepted the maximum times this minute.
    PerMinute,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_accepted: Instant,
    minute_start: Instant,
    minute_count: u32,
}

/// Fingerprint -> last accepted occurrence.
///
/// Only accepted occurrences count; a suppressed duplicate does not extend
/// the window.
#[derive(Debug)]
pub struct FingerprintMap {
    window: Duration,
    per_minute: u32,
    ceiling: usize,
    entries: HashMap<Fingerprint, Entry>,
}

impl FingerprintMap {
    pub fn new(window: Duration, per_minute: u32) -> Self {
        Self::with_ceiling(window, per_minute, MAX_FINGERPRINTS)
    }

    pub fn with_ceiling(window: Duration, per_minute: u32, ceiling: usize) -> Self {
        Self {
            window,
            per_minute: per_minute.max(1),
            ceiling: ceiling.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn check(&mut self, fingerprint: Fingerprint, now: Instant) -> Verdict {
        if let Some(entry) = self.entries.get_mut(&fingerprint) {
            if now.saturating_duration_since(entry.last_accepted) < self.window {
                return Verdict::Duplicate;
            }
            if now.saturating_duration_since(entry.minute_start) >= MINUTE {
                entry.minute_start = now;
                entry.minute_count = 0;
            }
            if entry.minute_count >= self.per_minute {
                return Verdict::PerMinute;
            }
            entry.last_accepted = now;
            entry.minute_count += 1;
            return Verdict::Accept;
        }

        if self.entries.len() >= self.ceiling {
            self.sweep(now);
        }
        if self.entries.len() >= self.ceiling {
            self.evict_oldest();
        }
        self.entries.insert(
            fingerprint,
            Entry {
                last_accepted: now,
                minute_start: now,
                minute_count: 1,
            },
        );
        Verdict::Accept
    }

    /// Forget fingerprints whose windows have all lapsed.
    pub fn sweep(&mut self, now: Instant) {
        let retention = self.window.max(MINUTE);
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_accepted) < retention);
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_accepted)
            .map(|(fp, _)| *fp);
        if let Some(fp) = oldest {
            self.entries.remove(&fp);
        }
    }
}

/// Rolling one-second window over all accepted events.
#[derive(Debug)]
pub struct RateWindow {
    limit: usize,
    accepted: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(per_second: u32) -> Self {
        Self {
            limit: per_second.max(1) as usize,
            accepted: VecDeque::new(),
        }
    }

    /// Record an event if the window has room.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        while let Some(front) = self.accepted.front() {
            if now.saturating_duration_since(*front) >= SECOND {
                self.accepted.pop_front();
            } else {
                break;
            }
        }
        if self.accepted.len() >= self.limit {
            return false;
        }
        self.accepted.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint(n)
    }

    #[test]
    fn repeat_within_window_is_a_duplicate() {
        let mut map = FingerprintMap::new(Duration::from_secs(1), 60);
        let t0 = Instant::now();
        assert_eq!(map.check(fp(1), t0), Verdict::Accept);
        assert_eq!(map.check(fp(1), t0 + Duration::from_millis(500)), Verdict::Duplicate);
        assert_eq!(map.check(fp(1), t0 + Duration::from_millis(1000)), Verdict::Accept);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn per_minute_ceiling() {
        let mut map = FingerprintMap::new(Duration::from_secs(1), 3);
        let t0 = Instant::now();
        let verdicts: Vec<Verdict> = (0..5)
            .map(|i| map.check(fp(7), t0 + Duration::from_secs(2 * i)))
            .collect();
        assert_eq!(
            verdicts,
            [
                Verdict::Accept,
                Verdict::Accept,
                Verdict::Accept,
                Verdict::PerMinute,
                Verdict::PerMinute
            ]
        );
        assert_eq!(map.check(fp(7), t0 + MINUTE), Verdict::Accept);
    }

    #[test]
    fn size_never_exceeds_the_ceiling() {
        let mut map = FingerprintMap::with_ceiling(Duration::from_secs(1), 60, 10);
        let t0 = Instant::now();
        for i in 0..100 {
            map.check(fp(i), t0 + Duration::from_millis(i));
            assert!(map.len() <= 10);
        }
    }

    #[test]
    fn sweep_drops_lapsed_entries() {
        let mut map = FingerprintMap::new(Duration::from_secs(1), 60);
        let t0 = Instant::now();
        map.check(fp(1), t0);
        map.check(fp(2), t0 + Duration::from_secs(30));
        map.sweep(t0 + Duration::from_secs(61));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn rate_window_rolls() {
        let mut rate = RateWindow::new(2);
        let t0 = Instant::now();
        assert!(rate.try_acquire(t0));
        assert!(rate.try_acquire(t0));
        assert!(!rate.try_acquire(t0 + Duration::from_millis(999)));
        assert!(rate.try_acquire(t0 + Duration::from_secs(1)));
    }
}
