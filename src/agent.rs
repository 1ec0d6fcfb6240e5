//! The agent: one per page, owning every core component.
//!
//! An [`Agent`] is constructed from a validated [`AgentConfig`] and an
//! [`Environment`] describing what the page offers (storage backends, the
//! cross-tab bus, extra destinations, transform hooks). Initialization is a
//! single shared future: concurrent `init()` callers all wait on the same
//! attempt and see the same result.
//!
//! For embedders that want a top-level API there is one process-wide slot,
//! see [`init`], [`instance`] and [`destroy`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::{OnceCell, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::coordinator::{Coordinator, CoordinatorConfig, Role, SessionSignal, TabBus};
use crate::error::{Error, Result};
use crate::events::{
    ActivitySink, Destination, EventManager, EventManagerConfig, FlushReport, HttpDestination,
    RecoveryStats, SubscriptionId, TrackOutcome, Transforms,
};
use crate::model::{Device, Event, EventsBatch, Metadata, SessionEndReason};
use crate::sanitize::{Limits, RawValue, sanitize_metadata, validate_event_name};
use crate::state::{StateKey, StateStore};
use crate::storage::{StorageBackend, StorageManager, keys};

const ANONYMOUS_USER: &str = "anonymous";

/// Lifecycle of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Initialized,
    Failed,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Initializing => "initializing",
            Lifecycle::Initialized => "initialized",
            Lifecycle::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// What the host page provides.
#[derive(Clone, Default)]
pub struct Environment {
    pub tab_id: Option<String>,
    pub page_url: Option<String>,
    pub durable: Option<Arc<dyn StorageBackend>>,
    pub ephemeral: Option<Arc<dyn StorageBackend>>,
    pub bus: Option<Arc<TabBus>>,
    /// Delivered to in addition to the configured HTTP destinations.
    pub destinations: Vec<Arc<dyn Destination>>,
    pub transforms: Transforms,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tab_id(mut self, tab_id: impl Into<String>) -> Self {
        self.tab_id = Some(tab_id.into());
        self
    }

    pub fn with_page_url(mut self, url: impl Into<String>) -> Self {
        self.page_url = Some(url.into());
        self
    }

    pub fn with_durable(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.durable = Some(backend);
        self
    }

    pub fn with_ephemeral(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.ephemeral = Some(backend);
        self
    }

    pub fn with_bus(mut self, bus: Arc<TabBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_destination(mut self, destination: Arc<dyn Destination>) -> Self {
        self.destinations.push(destination);
        self
    }

    pub fn with_transforms(mut self, transforms: Transforms) -> Self {
        self.transforms = transforms;
        self
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("tab_id", &self.tab_id)
            .field("page_url", &self.page_url)
            .field("durable", &self.durable.as_ref().map(|b| b.tier()))
            .field("ephemeral", &self.ephemeral.as_ref().map(|b| b.tier()))
            .field("bus", &self.bus.is_some())
            .field("destinations", &self.destinations.len())
            .field("transforms", &self.transforms)
            .finish()
    }
}

/// Components that exist once initialization succeeded.
struct Core {
    tab_id: String,
    state: Arc<StateStore>,
    coordinator: Arc<Coordinator>,
    events: Arc<EventManager>,
    signal_task: JoinHandle<()>,
}

pub struct Agent {
    config: AgentConfig,
    environment: Mutex<Option<Environment>>,
    init: OnceCell<std::result::Result<Arc<Core>, Arc<Error>>>,
    lifecycle: watch::Sender<Lifecycle>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.config)
            .field("initialized", &self.init.initialized())
            .field("destroyed", &self.destroyed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Validate `config` and prepare an agent. Nothing runs until `init()`.
    pub fn new(config: AgentConfig, environment: Environment) -> Result<Self> {
        config.validate()?;
        let (lifecycle, _) = watch::channel(Lifecycle::Uninitialized);
        Ok(Self {
            config,
            environment: Mutex::new(Some(environment)),
            init: OnceCell::new(),
            lifecycle,
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub fn watch_lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Build and start every component. Concurrent and repeated calls share
    /// the first attempt.
    pub async fn init(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::TornDown("agent"));
        }
        let outcome = self
            .init
            .get_or_init(|| async {
                self.lifecycle.send_replace(Lifecycle::Initializing);
                match self.build().await {
                    Ok(core) => {
                        self.lifecycle.send_replace(Lifecycle::Initialized);
                        info!(tab = %core.tab_id, "agent initialized");
                        Ok(Arc::new(core))
                    }
                    Err(e) => {
                        self.lifecycle.send_replace(Lifecycle::Failed);
                        warn!(error = %e, "agent initialization failed");
                        Err(Arc::new(e))
                    }
                }
            })
            .await;
        outcome
            .as_ref()
            .map(|_| ())
            .map_err(|e| Error::Init(Arc::clone(e)))
    }

    async fn build(&self) -> Result<Core> {
        let environment = self
            .environment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();
        let config = &self.config;
        let tab_id = environment
            .tab_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let storage = Arc::new(StorageManager::new(
            config.storage_namespace.clone(),
            environment.durable,
            environment.ephemeral,
        ));
        if config.qa_mode {
            storage.write(keys::QA_MODE, &true);
        }
        let qa_mode = config.qa_mode || storage.read::<bool>(keys::QA_MODE).unwrap_or(false);
        storage.set_qa_mode(qa_mode);

        let global_metadata = match &config.global_metadata {
            Some(metadata) => Some(sanitize_metadata(
                &RawValue::from(Value::Object(metadata.clone())),
                &Limits::GENERAL,
            )?),
            None => None,
        };

        let mut destinations = environment.destinations;
        for destination in &config.destinations {
            destinations.push(Arc::new(HttpDestination::new(destination)?));
        }

        let state = Arc::new(StateStore::new());
        let device = config
            .user_agent
            .as_deref()
            .map(Device::from_user_agent)
            .unwrap_or_default();
        state
            .set(
                StateKey::UserId,
                config.user_id.as_deref().unwrap_or(ANONYMOUS_USER),
            )
            .await?;
        state.set(StateKey::Device, device).await?;
        if let Some(url) = config.destinations.first().map(|d| d.url.clone()) {
            state.set(StateKey::ApiUrl, url).await?;
        }
        if let Some(url) = environment.page_url {
            state.set(StateKey::PageUrl, url).await?;
        }
        state.set(StateKey::QaMode, qa_mode).await?;
        state.set(StateKey::FallbackMode, storage.is_fallback_mode()).await?;

        let (coordinator, signals) = Coordinator::new(
            tab_id.clone(),
            CoordinatorConfig::from(config),
            Arc::clone(&state),
            Arc::clone(&storage),
            environment.bus,
        );
        let coordinator = Arc::new(coordinator);

        let mut events = EventManager::new(
            EventManagerConfig {
                qa_mode,
                ..EventManagerConfig::from(config)
            },
            Arc::clone(&state),
            Arc::clone(&storage),
        )
        .with_transforms(environment.transforms)
        .with_activity(Arc::clone(&coordinator) as Arc<dyn ActivitySink>)
        .with_global_metadata(global_metadata);
        for destination in destinations {
            events = events.with_destination(destination);
        }
        let events = Arc::new(events);

        // Recovered events go first, before the session can produce new ones.
        events.start();
        coordinator.start();
        let signal_task = tokio::spawn(forward_signals(Arc::downgrade(&events), signals));

        state.set(StateKey::Initialized, true).await?;
        Ok(Core {
            tab_id,
            state,
            coordinator,
            events,
            signal_task,
        })
    }

    fn core(&self) -> Result<&Arc<Core>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::TornDown("agent"));
        }
        match self.init.get() {
            Some(Ok(core)) => Ok(core),
            _ => Err(Error::NotInitialized),
        }
    }

    // -- producers ----------------------------------------------------------

    pub fn track(&self, event: Event) -> Result<TrackOutcome> {
        self.core()?.events.track(event)
    }

    /// Track a named custom event. The name and metadata are validated
    /// synchronously; invalid input is an error, never a silent drop.
    pub fn track_custom(&self, name: &str, metadata: Option<RawValue>) -> Result<TrackOutcome> {
        let core = self.core()?;
        let name = validate_event_name(name)?;
        let metadata = metadata
            .map(|raw| sanitize_metadata(&raw, &Limits::CUSTOM_EVENT))
            .transpose()?
            .filter(|m| !m.is_empty());
        core.events.track(Event::custom(name, metadata))
    }

    // -- delivery -----------------------------------------------------------

    pub async fn flush(&self) -> Result<FlushReport> {
        let events = Arc::clone(&self.core()?.events);
        Ok(events.flush().await)
    }

    /// The page lost visibility: hand everything queued to the destinations
    /// now, without waiting.
    pub fn page_hidden(&self) -> Result<usize> {
        Ok(self.core()?.events.force_immediate_send())
    }

    // -- session ------------------------------------------------------------

    pub fn session_id(&self) -> Option<String> {
        let core = self.core().ok()?;
        core.state
            .get(StateKey::SessionId)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn end_session(&self) -> Result<()> {
        self.core()?.coordinator.end_session(SessionEndReason::Manual);
        Ok(())
    }

    pub fn role(&self) -> Option<Role> {
        self.core().ok().map(|core| core.coordinator.role())
    }

    pub fn tab_id(&self) -> Option<&str> {
        self.core().ok().map(|core| core.tab_id.as_str())
    }

    // -- observability ------------------------------------------------------

    pub fn diagnostics(&self) -> Result<RecoveryStats> {
        Ok(self.core()?.events.diagnostics())
    }

    pub fn subscribe_events<F>(&self, listener: F) -> Result<SubscriptionId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Ok(self.core()?.events.subscribe_events(listener))
    }

    pub fn subscribe_batches<F>(&self, listener: F) -> Result<SubscriptionId>
    where
        F: Fn(&EventsBatch) + Send + Sync + 'static,
    {
        Ok(self.core()?.events.subscribe_batches(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core().is_ok_and(|core| core.events.unsubscribe(id))
    }

    // -- teardown -----------------------------------------------------------

    /// Page teardown. Ends or hands over the session, cancels every timer,
    /// then sends what is queued without awaiting. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(Ok(core)) = self.init.get() {
            for signal in core.coordinator.shutdown() {
                record_signal(&core.events, signal);
            }
            core.signal_task.abort();
            core.events.stop();
            let sent = core.events.force_immediate_send();
            core.state.close();
            info!(tab = %core.tab_id, events = sent, "agent destroyed");
        }
        self.lifecycle.send_replace(Lifecycle::Uninitialized);
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn forward_signals(events: Weak<EventManager>, mut signals: mpsc::UnboundedReceiver<SessionSignal>) {
    while let Some(signal) = signals.recv().await {
        let Some(events) = events.upgrade() else {
            return;
        };
        record_signal(&events, signal);
    }
}

fn record_signal(events: &EventManager, signal: SessionSignal) {
    let (event, session_id) = match signal {
        SessionSignal::Started(session) => (Event::session_start(), session.id),
        SessionSignal::Ended { session_id, reason } => (Event::session_end(reason), session_id),
    };
    let mut metadata = Metadata::new();
    metadata.insert("session_id".to_string(), Value::String(session_id.to_string()));
    let event = Event {
        metadata: Some(metadata),
        ..event
    };
    if let Err(e) = events.track(event) {
        debug!(error = %e, "session event not recorded");
    }
}

// ---------------------------------------------------------------------------
// Process-wide slot
// ---------------------------------------------------------------------------

static INSTANCE: Mutex<Option<Arc<Agent>>> = Mutex::new(None);

/// Initialize the process-wide agent. If one already exists it is returned
/// as is and `config` is ignored.
pub async fn init(config: AgentConfig, environment: Environment) -> Result<Arc<Agent>> {
    let (agent, fresh) = {
        let mut slot = INSTANCE.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(existing) => (Arc::clone(existing), false),
            None => {
                let agent = Arc::new(Agent::new(config, environment)?);
                *slot = Some(Arc::clone(&agent));
                (agent, true)
            }
        }
    };
    if !fresh {
        debug!("agent already registered, reusing it");
    }

    if let Err(e) = agent.init().await {
        let mut slot = INSTANCE.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|a| Arc::ptr_eq(a, &agent)) {
            *slot = None;
        }
        return Err(e);
    }
    Ok(agent)
}

/// The process-wide agent, if one is registered.
pub fn instance() -> Option<Arc<Agent>> {
    INSTANCE.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Tear down and unregister the process-wide agent.
pub fn destroy() {
    let agent = INSTANCE.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(agent) = agent {
        agent.destroy();
    }
}
