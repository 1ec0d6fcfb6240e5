//! End-to-end tests of the agent facade.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pulse_agent::agent::{self, Agent, Environment, Lifecycle};
use pulse_agent::config::AgentConfig;
use pulse_agent::coordinator::Role;
use pulse_agent::error::{DeliveryError, Error};
use pulse_agent::events::{Destination, SuppressReason, TrackOutcome};
use pulse_agent::model::{Event, EventType, EventsBatch, Payload, SessionEndReason};
use pulse_agent::sanitize::{RawValue, Rejection};
use serde_json::json;

#[derive(Default)]
struct Recorder {
    batches: Mutex<Vec<EventsBatch>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.events.clone())
            .collect()
    }
}

#[async_trait]
impl Destination for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn send(&self, batch: &EventsBatch) -> Result<(), DeliveryError> {
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }

    fn send_sync(&self, batch: &EventsBatch) -> bool {
        self.batches.lock().unwrap().push(batch.clone());
        true
    }
}

fn agent_with(recorder: &Arc<Recorder>) -> Agent {
    let environment = Environment::new()
        .with_tab_id("tab-1")
        .with_destination(Arc::clone(recorder) as Arc<dyn Destination>);
    Agent::new(AgentConfig::default(), environment).unwrap()
}

#[tokio::test(start_paused = true)]
async fn nothing_works_before_init() {
    let agent = agent_with(&Arc::new(Recorder::default()));
    assert_eq!(agent.lifecycle(), Lifecycle::Uninitialized);
    assert!(matches!(agent.track(Event::page_view("/a")), Err(Error::NotInitialized)));
    assert!(agent.session_id().is_none());
}

#[tokio::test(start_paused = true)]
async fn concurrent_init_shares_one_attempt() {
    let agent = agent_with(&Arc::new(Recorder::default()));

    let (first, second) = tokio::join!(agent.init(), agent.init());
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert!(agent.init().await.is_ok());
    assert_eq!(agent.lifecycle(), Lifecycle::Initialized);
    assert_eq!(agent.tab_id(), Some("tab-1"));

    // A lone tab leads and owns the session.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(agent.role(), Some(Role::Leader));
    assert!(agent.session_id().is_some());
}

#[test]
fn invalid_config_is_refused_up_front() {
    let config = AgentConfig {
        sampling_rate: 0.0,
        ..AgentConfig::default()
    };
    let err = Agent::new(config, Environment::new()).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test(start_paused = true)]
async fn failed_init_is_reported_to_every_caller() {
    let oversized: Vec<String> = (0..100).map(|_| "x".repeat(1000)).collect();
    let config = AgentConfig {
        global_metadata: json!({"blob": oversized}).as_object().cloned(),
        ..AgentConfig::default()
    };
    let agent = Agent::new(config, Environment::new()).unwrap();

    let Error::Init(first) = agent.init().await.unwrap_err() else {
        panic!("expected an initialization failure");
    };
    assert!(matches!(
        first.as_ref(),
        Error::Validation(Rejection::TooLarge { .. })
    ));
    assert_eq!(agent.lifecycle(), Lifecycle::Failed);

    // A retry does not rebuild; it sees the same cause.
    let Error::Init(second) = agent.init().await.unwrap_err() else {
        panic!("expected an initialization failure");
    };
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test(start_paused = true)]
async fn custom_events_are_validated_synchronously() {
    let agent = agent_with(&Arc::new(Recorder::default()));
    agent.init().await.unwrap();

    let err = agent.track_custom("", None).unwrap_err();
    assert!(matches!(err, Error::Validation(Rejection::InvalidName(_))));

    let err = agent
        .track_custom("<script>alert(1)</script>", None)
        .unwrap_err();
    assert!(matches!(err, Error::Validation(Rejection::InvalidName(_))));

    let too_many: serde_json::Map<String, serde_json::Value> =
        (0..11).map(|n| (format!("k{n}"), json!(n))).collect();
    let err = agent
        .track_custom("signup", Some(RawValue::from(serde_json::Value::Object(too_many))))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(Rejection::TooManyKeys { .. })));

    let outcome = agent
        .track_custom("signup", Some(RawValue::from(json!({"plan": "<b>pro</b>"}))))
        .unwrap();
    assert_eq!(outcome, TrackOutcome::Queued);
}

#[tokio::test(start_paused = true)]
async fn custom_event_metadata_is_cleaned_before_queueing() {
    let agent = agent_with(&Arc::new(Recorder::default()));
    agent.init().await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    agent
        .subscribe_events(move |e| sink.lock().unwrap().push(e.clone()))
        .unwrap();

    agent
        .track_custom("signup", Some(RawValue::from(json!({"plan": "<b>pro</b>"}))))
        .unwrap();
    agent.track_custom("logout", Some(RawValue::from(json!({})))).unwrap();

    let seen = seen.lock().unwrap();
    let custom: Vec<&Event> = seen
        .iter()
        .filter(|e| e.event_type == EventType::Custom)
        .collect();
    assert_eq!(custom.len(), 2);
    assert_eq!(custom[0].metadata.as_ref().unwrap()["plan"], json!("pro"));
    assert_eq!(custom[1].metadata, None);
}

#[tokio::test(start_paused = true)]
async fn page_hidden_hands_the_queue_off_immediately() {
    let recorder = Arc::new(Recorder::default());
    let agent = agent_with(&recorder);
    agent.init().await.unwrap();

    agent.track(Event::page_view("https://example.com/")).unwrap();
    assert!(agent.page_hidden().unwrap() >= 1);
    assert!(
        recorder
            .events()
            .iter()
            .any(|e| e.event_type == EventType::PageView)
    );
}

#[tokio::test(start_paused = true)]
async fn destroy_ends_the_session_and_sends_what_is_queued() {
    let recorder = Arc::new(Recorder::default());
    let agent = agent_with(&recorder);
    agent.init().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let session = agent.session_id().unwrap();

    agent.track(Event::page_view("https://example.com/")).unwrap();
    agent.destroy();
    agent.destroy();

    assert_eq!(agent.lifecycle(), Lifecycle::Uninitialized);
    assert!(matches!(agent.track(Event::page_view("/b")), Err(Error::TornDown(_))));
    assert!(matches!(agent.init().await, Err(Error::TornDown(_))));

    let events = recorder.events();
    let kinds: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![EventType::SessionStart, EventType::PageView, EventType::SessionEnd]
    );
    let end = events.last().unwrap();
    assert_eq!(
        end.payload,
        Some(Payload::SessionEnd {
            reason: SessionEndReason::PageUnload
        })
    );
    assert_eq!(end.metadata.as_ref().unwrap()["session_id"], json!(session));
}

#[tokio::test(start_paused = true)]
async fn manual_end_then_activity_starts_a_new_session() {
    let recorder = Arc::new(Recorder::default());
    let agent = agent_with(&recorder);
    agent.init().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let first = agent.session_id().unwrap();

    agent.end_session().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(agent.session_id(), None);

    assert_eq!(
        agent.track(Event::page_view("https://example.com/next")).unwrap(),
        TrackOutcome::Queued
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = agent.session_id().unwrap();
    assert_ne!(first, second);

    agent.flush().await.unwrap();
    let kinds: Vec<EventType> = recorder.events().iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventType::SessionStart,
            EventType::SessionEnd,
            EventType::PageView,
            EventType::SessionStart,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn sampled_out_agent_still_reports_session_lifecycle() {
    let recorder = Arc::new(Recorder::default());
    let config = AgentConfig {
        sampling_rate: f64::MIN_POSITIVE,
        ..AgentConfig::default()
    };
    let environment = Environment::new()
        .with_destination(Arc::clone(&recorder) as Arc<dyn Destination>);
    let agent = Agent::new(config, environment).unwrap();
    agent.init().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        agent.track(Event::page_view("https://example.com/")).unwrap(),
        TrackOutcome::Suppressed(SuppressReason::SampledOut)
    );
    agent.flush().await.unwrap();
    let kinds: Vec<EventType> = recorder.events().iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![EventType::SessionStart]);
}

#[tokio::test(start_paused = true)]
async fn process_wide_slot_reuses_and_releases_the_agent() {
    assert!(agent::instance().is_none());

    let first = agent::init(AgentConfig::default(), Environment::new())
        .await
        .unwrap();
    let again = agent::init(AgentConfig::default(), Environment::new())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert!(agent::instance().is_some_and(|a| Arc::ptr_eq(&a, &first)));

    agent::destroy();
    assert!(agent::instance().is_none());
    assert!(matches!(first.track(Event::page_view("/a")), Err(Error::TornDown(_))));
}
