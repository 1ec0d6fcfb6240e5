//! Per-destination circuit breaker.
//!
//! `Closed` lets every delivery through. After `threshold` consecutive
//! failures it opens and every delivery is skipped. Once the cool-down has
//! elapsed, or a health probe succeeds, it goes half-open and lets the next
//! delivery through as a trial: success closes it, failure re-opens it.

use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::time::Instant;
use tracing::info;

use crate::telemetry::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerStatus::Closed => "closed",
            BreakerStatus::Open => "open",
            BreakerStatus::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    destination: String,
    threshold: u32,
    cooldown: Duration,
    status: BreakerStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    resets: u64,
}

impl CircuitBreaker {
    pub fn new(destination: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            destination: destination.into(),
            threshold: threshold.max(1),
            cooldown,
            status: BreakerStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            resets: 0,
        }
    }

    pub fn status(&self) -> BreakerStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == BreakerStatus::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Times the breaker closed again after opening.
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Whether a delivery may be attempted now. Moves an open breaker whose
    /// cool-down has elapsed to half-open.
    pub fn allow_request(&mut self) -> bool {
        match self.status {
            BreakerStatus::Closed | BreakerStatus::HalfOpen => true,
            BreakerStatus::Open => {
                let cooled = self
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.cooldown);
                if cooled {
                    self.transition(BreakerStatus::HalfOpen);
                }
                cooled
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.status != BreakerStatus::Closed {
            self.resets += 1;
            self.opened_at = None;
            self.transition(BreakerStatus::Closed);
        }
    }

    /// Returns true if this failure opened the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let open = match self.status {
            BreakerStatus::HalfOpen => true,
            BreakerStatus::Closed => self.consecutive_failures >= self.threshold,
            // Already open: keep the original timestamp so the cool-down
            // is not pushed back.
            BreakerStatus::Open => false,
        };
        if open {
            self.opened_at = Some(Instant::now());
            self.transition(BreakerStatus::Open);
        }
        open
    }

    /// A health probe reached the destination while the breaker was open.
    pub fn probe_succeeded(&mut self) {
        if self.status == BreakerStatus::Open {
            self.transition(BreakerStatus::HalfOpen);
        }
    }

    fn transition(&mut self, to: BreakerStatus) {
        let from = self.status;
        self.status = to;
        info!(destination = %self.destination, %from, %to, "circuit breaker transition");
        metrics::breaker_transitions().add(
            1,
            &[
                KeyValue::new("destination", self.destination.clone()),
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("collector", 5, Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn opens_once_after_threshold() {
        let mut b = breaker();
        let opened: Vec<bool> = (0..8).map(|_| b.record_failure()).collect();
        assert_eq!(opened, [false, false, false, false, true, false, false, false]);
        assert!(b.is_open());
        assert!(!b.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_moves_to_half_open_and_success_closes() {
        let mut b = breaker();
        for _ in 0..5 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!b.allow_request());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(b.allow_request());
        assert_eq!(b.status(), BreakerStatus::HalfOpen);

        b.record_success();
        assert_eq!(b.status(), BreakerStatus::Closed);
        assert_eq!(b.consecutive_failures(), 0);
        assert_eq!(b.resets(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_immediately() {
        let mut b = breaker();
        for _ in 0..5 {
            b.record_failure();
        }
        b.probe_succeeded();
        assert_eq!(b.status(), BreakerStatus::HalfOpen);

        assert!(b.record_failure());
        assert!(b.is_open());
        assert!(!b.allow_request());
    }

    #[test]
    fn success_while_closed_only_resets_the_count() {
        let mut b = breaker();
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.consecutive_failures(), 0);
        assert_eq!(b.resets(), 0);
        assert_eq!(b.status(), BreakerStatus::Closed);
    }
}
