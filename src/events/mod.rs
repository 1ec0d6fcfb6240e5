//! Event manager: queueing, suppression, batching and delivery.
//!
//! `track()` is synchronous and never fails for environmental reasons. An
//! event passes the pre-send transform, sampling, duplicate and rate limits,
//! then lands in the queue and is emitted to subscribers immediately. The
//! flush timer, `flush()` and `force_immediate_send()` all drain the queue
//! into one batch and hand it to every destination through that
//! destination's circuit breaker. A flushed batch is written to the recovery
//! slot before it is sent and removed only once every destination took it,
//! so undelivered events survive a reload and go out ahead of newer ones,
//! under the identity they were tracked with.

pub mod breaker;
pub mod dedup;
pub mod delivery;
pub mod emitter;
pub mod transform;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::model::{Device, Event, EventsBatch, Metadata, PersistedQueue, RecoveryBacklog, now_ms};
use crate::state::{StateKey, StateStore};
use crate::storage::{StorageManager, keys};
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_delivered, start_flush_span};

use dedup::{FingerprintMap, RateWindow, Verdict};
use transform::{Outcome, apply_batch, apply_event};

pub use breaker::{BreakerStatus, CircuitBreaker};
pub use delivery::{Destination, HttpDestination};
pub use emitter::{Emitter, SubscriptionId};
pub use transform::{BatchTransform, EventTransform, TransformError, Transforms};

/// Told about every user-driven event, so the session stays alive.
pub trait ActivitySink: Send + Sync {
    fn record_activity(&self);
}

impl ActivitySink for crate::coordinator::Coordinator {
    fn record_activity(&self) {
        crate::coordinator::Coordinator::record_activity(self);
    }
}

#[derive(Debug, Clone)]
pub struct EventManagerConfig {
    pub dedup_window: Duration,
    pub max_same_event_per_minute: u32,
    pub max_events_per_second: u32,
    pub max_queue_len: usize,
    pub flush_interval: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
    pub health_check_interval: Duration,
    pub recovery_max_age: Duration,
    /// Log batches instead of delivering them.
    pub qa_mode: bool,
}

impl Default for EventManagerConfig {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for EventManagerConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            dedup_window: config.dedup_window,
            max_same_event_per_minute: config.max_same_event_per_minute,
            max_events_per_second: config.max_events_per_second,
            max_queue_len: config.max_queue_len,
            flush_interval: config.flush_interval,
            breaker_failure_threshold: config.breaker_failure_threshold,
            breaker_cooldown: config.breaker_cooldown,
            health_check_interval: config.health_check_interval,
            recovery_max_age: config.recovery_max_age,
            qa_mode: config.qa_mode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    SampledOut,
    Vetoed,
    Duplicate,
    PerMinute,
    RateLimited,
    /// Evicted from a full queue.
    Overflow,
}

impl SuppressReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SuppressReason::SampledOut => "sampled_out",
            SuppressReason::Vetoed => "vetoed",
            SuppressReason::Duplicate => "duplicate",
            SuppressReason::PerMinute => "per_minute",
            SuppressReason::RateLimited => "rate_limited",
            SuppressReason::Overflow => "overflow",
        }
    }
}

impl std::fmt::Display for SuppressReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    Queued,
    Suppressed(SuppressReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Timer,
    Manual,
    Teardown,
}

impl FlushTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::Timer => "timer",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Teardown => "teardown",
        }
    }
}

/// What one flush did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub events: usize,
    /// Destinations that accepted everything sent in this flush.
    pub delivered_to: usize,
    /// Some events stayed in the recovery slot.
    pub persisted: bool,
}

/// Recovery and diagnostics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStats {
    pub circuit_breaker_resets: u64,
    pub persistence_failures: u64,
    pub network_timeouts: u64,
    pub current_failure_count: u32,
    pub circuit_breaker_open: bool,
    pub fingerprint_map_size: usize,
    pub fallback_mode: bool,
    pub storage_tier: String,
    pub suppressed_events: u64,
}

struct Pipeline {
    queue: VecDeque<Event>,
    fingerprints: FingerprintMap,
    rate: RateWindow,
}

pub struct EventManager {
    config: EventManagerConfig,
    state: Arc<StateStore>,
    storage: Arc<StorageManager>,
    destinations: Vec<Arc<dyn Destination>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    transforms: Transforms,
    emitter: Emitter,
    activity: Option<Arc<dyn ActivitySink>>,
    global_metadata: Option<Metadata>,
    pipeline: Mutex<Pipeline>,
    /// Serializes flushes so batches leave in queue order.
    flush_lock: tokio::sync::Mutex<()>,
    suppressed: AtomicU64,
    network_timeouts: AtomicU64,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventManager {
    pub fn new(config: EventManagerConfig, state: Arc<StateStore>, storage: Arc<StorageManager>) -> Self {
        let pipeline = Pipeline {
            queue: VecDeque::new(),
            fingerprints: FingerprintMap::new(config.dedup_window, config.max_same_event_per_minute),
            rate: RateWindow::new(config.max_events_per_second),
        };
        Self {
            config,
            state,
            storage,
            destinations: Vec::new(),
            breakers: Mutex::new(HashMap::new()),
            transforms: Transforms::default(),
            emitter: Emitter::new(),
            activity: None,
            global_metadata: None,
            pipeline: Mutex::new(pipeline),
            flush_lock: tokio::sync::Mutex::new(()),
            suppressed: AtomicU64::new(0),
            network_timeouts: AtomicU64::new(0),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_destination(mut self, destination: Arc<dyn Destination>) -> Self {
        let name = destination.name().to_string();
        self.breakers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.clone(),
                CircuitBreaker::new(
                    name,
                    self.config.breaker_failure_threshold,
                    self.config.breaker_cooldown,
                ),
            );
        self.destinations.push(destination);
        self
    }

    pub fn with_transforms(mut self, transforms: Transforms) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_activity(mut self, sink: Arc<dyn ActivitySink>) -> Self {
        self.activity = Some(sink);
        self
    }

    /// Attached to every batch. Must already be sanitized.
    pub fn with_global_metadata(mut self, metadata: Option<Metadata>) -> Self {
        self.global_metadata = metadata;
        self
    }

    // -- lifecycle ----------------------------------------------------------

    /// Check the recovery slot, then start the flush and health-check
    /// timers. Returns the number of recovered events. Idempotent.
    pub fn start(self: &Arc<Self>) -> usize {
        if self.started.swap(true, Ordering::SeqCst) || self.is_stopped() {
            return 0;
        }
        let recovered = self.recover();

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(flush_loop(
            Arc::downgrade(self),
            self.config.flush_interval,
        )));
        if !self.destinations.is_empty() {
            tasks.push(tokio::spawn(health_loop(
                Arc::downgrade(self),
                self.config.health_check_interval,
            )));
        }
        recovered
    }

    /// Cancel every timer. After this returns no timer-driven flush or probe
    /// runs again and `track()` fails with `TornDown`. A final
    /// `force_immediate_send()` is still allowed. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        debug!("event manager stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // -- subscribers --------------------------------------------------------

    pub fn subscribe_events<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.emitter.subscribe_events(listener)
    }

    pub fn subscribe_batches<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&EventsBatch) + Send + Sync + 'static,
    {
        self.emitter.subscribe_batches(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }

    // -- tracking -----------------------------------------------------------

    pub fn track(&self, event: Event) -> Result<TrackOutcome> {
        if self.is_stopped() {
            return Err(Error::TornDown("event manager"));
        }
        let lifecycle = event.event_type.is_session_lifecycle();

        if !lifecycle {
            if let Some(activity) = &self.activity {
                activity.record_activity();
            }
            if self.state.get_as::<bool>(StateKey::SampledIn) == Some(false) {
                return Ok(self.suppress(SuppressReason::SampledOut, &event));
            }
        }

        let event = match apply_event(self.transforms.before_send.as_ref(), event) {
            Outcome::Keep(event) => event,
            Outcome::Veto => return Ok(TrackOutcome::Suppressed(self.count(SuppressReason::Vetoed))),
        };

        let evicted = {
            let mut pipeline = self.pipeline();
            if !lifecycle {
                let now = Instant::now();
                let verdict = pipeline.fingerprints.check(event.fingerprint(), now);
                let reason = match verdict {
                    Verdict::Accept if pipeline.rate.try_acquire(now) => None,
                    Verdict::Accept => Some(SuppressReason::RateLimited),
                    Verdict::Duplicate => Some(SuppressReason::Duplicate),
                    Verdict::PerMinute => Some(SuppressReason::PerMinute),
                };
                if let Some(reason) = reason {
                    drop(pipeline);
                    return Ok(self.suppress(reason, &event));
                }
            }
            pipeline.queue.push_back(event.clone());
            self.enforce_queue_bound(&mut pipeline)
        };

        let outcome = match evicted {
            Some(evicted) if evicted == event && !lifecycle => {
                return Ok(self.suppress(SuppressReason::Overflow, &event));
            }
            Some(evicted) => {
                self.suppress(SuppressReason::Overflow, &evicted);
                TrackOutcome::Queued
            }
            None => TrackOutcome::Queued,
        };

        metrics::events_tracked().add(1, &[KeyValue::new("type", event.event_type.to_string())]);
        self.emitter.emit_event(&event);
        Ok(outcome)
    }

    /// Events currently queued, oldest first.
    pub fn queued(&self) -> Vec<Event> {
        self.pipeline().queue.iter().cloned().collect()
    }

    pub fn queue_len(&self) -> usize {
        self.pipeline().queue.len()
    }

    /// Drop the oldest non-session event while the queue is over its bound.
    fn enforce_queue_bound(&self, pipeline: &mut Pipeline) -> Option<Event> {
        if pipeline.queue.len() <= self.config.max_queue_len {
            return None;
        }
        let index = pipeline
            .queue
            .iter()
            .position(|e| !e.event_type.is_session_lifecycle())
            .unwrap_or(0);
        pipeline.queue.remove(index)
    }

    fn suppress(&self, reason: SuppressReason, event: &Event) -> TrackOutcome {
        if self.config.qa_mode {
            info!(%reason, event_type = %event.event_type, "event suppressed");
        } else {
            debug!(%reason, event_type = %event.event_type, "event suppressed");
        }
        TrackOutcome::Suppressed(self.count(reason))
    }

    fn count(&self, reason: SuppressReason) -> SuppressReason {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        metrics::events_suppressed().add(1, &[KeyValue::new("reason", reason.as_str())]);
        reason
    }

    // -- flushing -----------------------------------------------------------

    pub async fn flush(&self) -> FlushReport {
        self.flush_with(FlushTrigger::Manual).await
    }

    /// Build a batch from the queue, write it ahead to the recovery slot,
    /// then deliver everything the slot holds, oldest first. Events leave
    /// the slot only once every destination accepted them, so a flush that
    /// is cut short loses nothing.
    async fn flush_with(&self, trigger: FlushTrigger) -> FlushReport {
        let _serial = self.flush_lock.lock().await;
        let started = Instant::now();

        let events = self.drain();
        if !events.is_empty()
            && let Some(batch) = self.build_batch(events)
        {
            self.emitter.emit_batch(&batch);
            self.persist(&batch);
        }

        let backlog = self.load_backlog();
        if backlog.is_empty() {
            return FlushReport::default();
        }

        let span = start_flush_span(trigger.as_str(), backlog.len());
        let report = self.deliver_backlog(backlog).instrument(span.clone()).await;
        record_delivered(&span, report.delivered_to);
        metrics::flush_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("trigger", trigger.as_str())],
        );
        report
    }

    /// Teardown path: no awaits. Destinations get a fire-and-forget send;
    /// whatever cannot be handed off is persisted for the next load.
    pub fn force_immediate_send(&self) -> usize {
        let events = self.drain();
        if events.is_empty() {
            return 0;
        }
        let Some(batch) = self.build_batch(events) else {
            return 0;
        };
        let count = batch.len();
        let _span = start_flush_span(FlushTrigger::Teardown.as_str(), count).entered();

        self.emitter.emit_batch(&batch);
        if self.config.qa_mode {
            log_batch(&batch);
            return count;
        }

        let mut handed_off = 0;
        for destination in &self.destinations {
            if self.breaker_allows(destination.name()) && destination.send_sync(&batch) {
                handed_off += 1;
            }
        }
        if handed_off < self.destinations.len() {
            self.persist(&batch);
        }
        count
    }

    async fn deliver_backlog(&self, backlog: RecoveryBacklog) -> FlushReport {
        let mut report = FlushReport::default();
        let mut accepted = vec![true; self.destinations.len()];

        for record in &backlog.batches {
            let batch = record.to_batch();
            report.events += batch.len();
            if self.config.qa_mode {
                log_batch(&batch);
            } else if !self.deliver(&batch, &mut accepted).await {
                // Newer records wait behind this one.
                report.persisted = true;
                break;
            }
            self.acknowledge(&batch);
        }

        if !self.config.qa_mode {
            report.delivered_to = accepted.iter().filter(|ok| **ok).count();
        }
        report
    }

    /// One attempt per destination. True if every destination accepted.
    async fn deliver(&self, batch: &EventsBatch, accepted: &mut [bool]) -> bool {
        let mut complete = true;
        for (destination, accepted) in self.destinations.iter().zip(accepted.iter_mut()) {
            let name = destination.name();
            if !self.breaker_allows(name) {
                debug!(destination = name, "circuit open, delivery skipped");
                metrics::batches_failed().add(
                    1,
                    &[
                        KeyValue::new("destination", name.to_string()),
                        KeyValue::new("cause", "circuit_open"),
                    ],
                );
                *accepted = false;
                complete = false;
                continue;
            }

            match destination.send(batch).await {
                Ok(()) => {
                    self.with_breaker(name, CircuitBreaker::record_success);
                    metrics::batches_sent().add(1, &[KeyValue::new("destination", name.to_string())]);
                }
                Err(e) => {
                    warn!(destination = name, error = %e, events = batch.len(), "delivery failed");
                    if e.is_timeout() {
                        self.network_timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    self.with_breaker(name, CircuitBreaker::record_failure);
                    metrics::batches_failed().add(
                        1,
                        &[
                            KeyValue::new("destination", name.to_string()),
                            KeyValue::new("cause", "error"),
                        ],
                    );
                    *accepted = false;
                    complete = false;
                }
            }
        }
        complete
    }

    fn drain(&self) -> Vec<Event> {
        self.pipeline().queue.drain(..).collect()
    }

    /// Attach identity and run the pre-batch transform. `None` if vetoed.
    fn build_batch(&self, events: Vec<Event>) -> Option<EventsBatch> {
        let snapshot = self.state.snapshot();
        let text = |key| {
            snapshot
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let batch = EventsBatch {
            user_id: text(StateKey::UserId),
            session_id: text(StateKey::SessionId),
            device: snapshot
                .get(StateKey::Device)
                .and_then(|v| serde_json::from_value::<Device>(v.clone()).ok())
                .unwrap_or_default(),
            events,
            global_metadata: self.global_metadata.clone(),
        };

        let count = batch.len();
        match apply_batch(self.transforms.before_batch.as_ref(), batch) {
            Outcome::Keep(batch) => Some(batch),
            Outcome::Veto => {
                debug!(events = count, "batch vetoed by transform");
                self.suppressed.fetch_add(count as u64, Ordering::Relaxed);
                None
            }
        }
    }

    // -- recovery -----------------------------------------------------------

    /// Events an earlier page left undelivered. They stay in the recovery
    /// slot and go out ahead of anything tracked now.
    fn recover(&self) -> usize {
        let pending = self.load_backlog().len();
        if pending > 0 {
            info!(events = pending, "undelivered events waiting from an earlier page");
        }
        pending
    }

    /// The recovery slot, minus records too old to send.
    fn load_backlog(&self) -> RecoveryBacklog {
        let mut backlog = self.read_backlog();
        let max_age = self.config.recovery_max_age.as_millis() as i64;
        let dropped = backlog.drop_stale(now_ms(), max_age);
        if dropped > 0 {
            info!(events = dropped, "discarding stale persisted events");
            self.store_backlog(&backlog);
        }
        backlog
    }

    fn read_backlog(&self) -> RecoveryBacklog {
        self.storage
            .read::<RecoveryBacklog>(keys::QUEUE_RECOVERY)
            .unwrap_or_default()
    }

    fn store_backlog(&self, backlog: &RecoveryBacklog) {
        if backlog.is_empty() {
            self.storage.remove(keys::QUEUE_RECOVERY);
        } else {
            let tier = self.storage.write(keys::QUEUE_RECOVERY, backlog);
            debug!(events = backlog.len(), %tier, "recovery slot written");
            self.refresh_fallback_mode();
        }
    }

    /// Mirror a storage downgrade into the state store. Only recovery writes
    /// are large enough to overflow a tier mid-session.
    fn refresh_fallback_mode(&self) {
        let fallback = self.storage.is_fallback_mode();
        if self.state.get_as::<bool>(StateKey::FallbackMode) == Some(fallback) {
            return;
        }
        if let Err(e) = self.state.set_detached(StateKey::FallbackMode, fallback) {
            debug!(error = %e, "fallback mode not recorded");
        }
    }

    fn persist(&self, batch: &EventsBatch) {
        let mut backlog = self.read_backlog();
        backlog.push(PersistedQueue::from_batch(batch, now_ms()));
        self.store_backlog(&backlog);
    }

    fn acknowledge(&self, batch: &EventsBatch) {
        let mut backlog = self.read_backlog();
        backlog.acknowledge(batch);
        self.store_backlog(&backlog);
    }

    // -- breakers -----------------------------------------------------------

    fn breakers(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn breaker_allows(&self, destination: &str) -> bool {
        self.breakers()
            .get_mut(destination)
            .is_none_or(CircuitBreaker::allow_request)
    }

    fn with_breaker<R>(&self, destination: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> Option<R> {
        self.breakers().get_mut(destination).map(f)
    }

    pub fn breaker_status(&self, destination: &str) -> Option<BreakerStatus> {
        self.breakers().get(destination).map(CircuitBreaker::status)
    }

    async fn probe_open_destinations(&self) {
        for destination in &self.destinations {
            let open = self
                .breakers()
                .get(destination.name())
                .is_some_and(CircuitBreaker::is_open);
            if open && destination.health_check().await {
                debug!(destination = destination.name(), "health check passed");
                self.with_breaker(destination.name(), CircuitBreaker::probe_succeeded);
            }
        }
    }

    // -- diagnostics --------------------------------------------------------

    pub fn diagnostics(&self) -> RecoveryStats {
        let (resets, failures, open) = {
            let breakers = self.breakers();
            (
                breakers.values().map(CircuitBreaker::resets).sum::<u64>(),
                breakers
                    .values()
                    .map(CircuitBreaker::consecutive_failures)
                    .sum::<u32>(),
                breakers.values().any(CircuitBreaker::is_open),
            )
        };
        RecoveryStats {
            circuit_breaker_resets: resets,
            persistence_failures: self.storage.persistence_failures(),
            network_timeouts: self.network_timeouts.load(Ordering::Relaxed),
            current_failure_count: failures,
            circuit_breaker_open: open,
            fingerprint_map_size: self.pipeline().fingerprints.len(),
            fallback_mode: self.storage.is_fallback_mode(),
            storage_tier: self.storage.active_tier().name().to_string(),
            suppressed_events: self.suppressed.load(Ordering::Relaxed),
        }
    }

    fn pipeline(&self) -> MutexGuard<'_, Pipeline> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep_fingerprints(&self) {
        self.pipeline().fingerprints.sweep(Instant::now());
    }
}

impl Drop for EventManager {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

fn log_batch(batch: &EventsBatch) {
    match serde_json::to_string(batch) {
        Ok(json) => info!(events = batch.len(), batch = %json, "qa mode: batch not sent"),
        Err(e) => warn!(error = %e, "qa mode: batch not serializable"),
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

async fn flush_loop(manager: Weak<EventManager>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            return;
        };
        if manager.is_stopped() {
            return;
        }
        manager.sweep_fingerprints();
        manager.flush_with(FlushTrigger::Timer).await;
    }
}

async fn health_loop(manager: Weak<EventManager>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            return;
        };
        if manager.is_stopped() {
            return;
        }
        manager.probe_open_destinations().await;
    }
}
