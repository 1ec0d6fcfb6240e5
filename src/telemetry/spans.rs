//! Span helpers for flushes and tab elections.

use tracing::Span;

/// Start a span for one flush.
///
/// `flush.delivered` is declared empty and filled via [`record_delivered`].
pub fn start_flush_span(trigger: &str, events: usize) -> Span {
    tracing::info_span!(
        "pulse.flush",
        "flush.trigger" = trigger,
        "flush.events" = events,
        "flush.delivered" = tracing::field::Empty,
    )
}

/// Record how many destinations accepted the batch.
pub fn record_delivered(span: &Span, destinations: usize) {
    span.record("flush.delivered", destinations);
}

/// Start a span for one election round of a tab.
pub fn start_election_span(tab_id: &str) -> Span {
    tracing::info_span!(
        "pulse.election",
        "tab.id" = tab_id,
        "tab.role" = tracing::field::Empty,
    )
}

/// Record a role change of a tab on the given span.
///
/// Emits a tracing `info` event scoped to the span.
pub fn record_role_change(span: &Span, from: &str, to: &str) {
    span.record("tab.role", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "role_change");
    });
}
