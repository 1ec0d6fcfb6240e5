//! Metric instrument factories for pulse-agent.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"pulse-agent"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for pulse-agent instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("pulse-agent")
}

/// Counter: events accepted into the queue.
/// Labels: `type`.
pub fn events_tracked() -> Counter<u64> {
    meter()
        .u64_counter("pulse.events.tracked")
        .with_description("Number of events accepted into the queue")
        .build()
}

/// Counter: events dropped before queueing.
/// Labels: `reason` ("duplicate" | "per_minute" | "rate_limited" | "sampled_out" | "vetoed" | "overflow").
pub fn events_suppressed() -> Counter<u64> {
    meter()
        .u64_counter("pulse.events.suppressed")
        .with_description("Number of events dropped before queueing")
        .build()
}

/// Counter: batches delivered.
/// Labels: `destination`.
pub fn batches_sent() -> Counter<u64> {
    meter()
        .u64_counter("pulse.batches.sent")
        .with_description("Number of batches delivered")
        .build()
}

/// Counter: batches that could not be delivered and were persisted.
/// Labels: `destination`, `cause` ("error" | "circuit_open").
pub fn batches_failed() -> Counter<u64> {
    meter()
        .u64_counter("pulse.batches.failed")
        .with_description("Number of batches not delivered")
        .build()
}

/// Counter: circuit breaker state transitions.
/// Labels: `destination`, `from`, `to`.
pub fn breaker_transitions() -> Counter<u64> {
    meter()
        .u64_counter("pulse.breaker.transitions")
        .with_description("Number of circuit breaker state transitions")
        .build()
}

/// Counter: writes that fell through to a lower storage tier.
/// Labels: `tier` (the tier that refused).
pub fn storage_fallbacks() -> Counter<u64> {
    meter()
        .u64_counter("pulse.storage.fallbacks")
        .with_description("Number of storage writes refused by a tier")
        .build()
}

/// Counter: election results.
/// Labels: `role` ("leader" | "follower").
pub fn election_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("pulse.election.outcomes")
        .with_description("Number of completed tab elections")
        .build()
}

/// Histogram: flush duration in milliseconds.
/// Labels: `trigger` ("timer" | "manual" | "teardown").
pub fn flush_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("pulse.flush.duration_ms")
        .with_description("Flush duration in milliseconds")
        .with_unit("ms")
        .build()
}
