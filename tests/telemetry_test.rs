//! Integration tests for telemetry initialization and span helpers.

use opentelemetry::KeyValue;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let config = pulse_agent::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "pulse-test".to_string(),
        ..Default::default()
    };
    if let Ok(guard) = pulse_agent::telemetry::init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.flush();
    }
}

#[test]
fn flush_span_creates_and_records_delivery() {
    let span = pulse_agent::telemetry::spans::start_flush_span("manual", 12);
    pulse_agent::telemetry::spans::record_delivered(&span, 2);
}

#[test]
fn election_span_creates_and_records_role_change() {
    let span = pulse_agent::telemetry::spans::start_election_span("tab-1");
    pulse_agent::telemetry::spans::record_role_change(&span, "candidate", "leader");
}

#[test]
fn metric_instruments_accept_recordings_without_a_provider() {
    use pulse_agent::telemetry::metrics;

    metrics::events_tracked().add(1, &[KeyValue::new("type", "page_view")]);
    metrics::events_suppressed().add(1, &[KeyValue::new("reason", "duplicate")]);
    metrics::batches_sent().add(1, &[KeyValue::new("destination", "primary")]);
    metrics::flush_duration_ms().record(3.5, &[KeyValue::new("trigger", "timer")]);
}
