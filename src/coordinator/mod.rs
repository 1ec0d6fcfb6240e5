//! Cross-tab session coordination.
//!
//! Every tab of an origin runs one coordinator. The tabs elect a single
//! leader, and only the leader creates, extends or expires the shared
//! session. Followers adopt whatever session the leader publishes and report
//! their user activity back on each heartbeat, so the leader's inactivity
//! check covers every tab.
//!
//! Lifecycle of a tab:
//!
//! ```text
//! Unelected -> Candidate -> Leader | Follower
//!              ^                      |
//!              +---- leader timeout --+
//! ```

pub mod channel;
pub mod election;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, Span, debug, info, warn};

use crate::config::AgentConfig;
use crate::model::{Session, SessionEndReason, SessionId, now_ms};
use crate::state::{StateKey, StateStore};
use crate::storage::{StorageManager, keys};
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_role_change, start_election_span};

use channel::{Inbox, Outbox};
use election::winner;

pub use channel::{TabBus, TabMessage};
pub use election::{Claim, Role};

/// Timing and sampling knobs of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub heartbeat_interval: Duration,
    /// Silence after which followers presume the leader dead.
    pub leader_timeout: Duration,
    /// How long a candidate waits for an answer before concluding.
    pub election_grace: Duration,
    pub session_timeout: Duration,
    pub sampling_rate: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for CoordinatorConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            leader_timeout: config.leader_timeout,
            election_grace: config.election_grace,
            session_timeout: config.session_timeout,
            sampling_rate: config.sampling_rate,
        }
    }
}

/// Session lifecycle changes the local event pipeline must record.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    Started(Session),
    Ended {
        session_id: SessionId,
        reason: SessionEndReason,
    },
}

/// The leader's persisted heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabInfo {
    pub leader: String,
    pub heartbeat_at: i64,
    pub session_id: Option<SessionId>,
}

struct Inner {
    role: Role,
    claim: Claim,
    /// The leader this tab follows, once known.
    leader: Option<Claim>,
    leader_seen: Instant,
    /// Competing claims seen during the current election.
    rivals: Vec<Claim>,
    election_deadline: Option<Instant>,
    session: Option<Session>,
    session_dirty: bool,
    /// Latest activity of any tab, as known by this one.
    last_activity: Instant,
    /// Follower activity not yet reported to the leader.
    unreported_activity: Option<i64>,
    /// Followers and when they last reported in. Leader only.
    peers: HashMap<String, Instant>,
    stopped: bool,
}

struct Shared {
    tab_id: String,
    config: CoordinatorConfig,
    state: Arc<StateStore>,
    storage: Arc<StorageManager>,
    outbox: Outbox,
    inner: Mutex<Inner>,
    role_tx: watch::Sender<Role>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    shutdown: Notify,
    span: Span,
}

/// One tab's view of the cross-tab session.
pub struct Coordinator {
    shared: Arc<Shared>,
    inbox: Mutex<Option<Inbox>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Connect to the other tabs. Nothing is announced until [`start`](Self::start).
    ///
    /// Session starts and ends are delivered on the returned receiver.
    pub fn new(
        tab_id: impl Into<String>,
        config: CoordinatorConfig,
        state: Arc<StateStore>,
        storage: Arc<StorageManager>,
        bus: Option<Arc<TabBus>>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionSignal>) {
        let tab_id = tab_id.into();
        let (outbox, inbox) = channel::connect(bus, &storage);
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (role_tx, _) = watch::channel(Role::Unelected);
        let now = Instant::now();

        let inner = Inner {
            role: Role::Unelected,
            claim: Claim::new(tab_id.clone()),
            leader: None,
            leader_seen: now,
            rivals: Vec::new(),
            election_deadline: None,
            session: None,
            session_dirty: false,
            last_activity: now,
            unreported_activity: None,
            peers: HashMap::new(),
            stopped: false,
        };

        let shared = Arc::new(Shared {
            span: start_election_span(&tab_id),
            tab_id,
            config,
            state,
            storage,
            outbox,
            inner: Mutex::new(inner),
            role_tx,
            signals,
            shutdown: Notify::new(),
        });

        let coordinator = Self {
            shared,
            inbox: Mutex::new(Some(inbox)),
            task: Mutex::new(None),
        };
        (coordinator, signal_rx)
    }

    /// Announce this tab and run the election loop. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(inbox) = self.inbox.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        {
            let mut inner = self.shared.lock();
            self.shared.begin_election(&mut inner);
        }
        let shared = Arc::clone(&self.shared);
        let span = self.shared.span.clone();
        let handle = tokio::spawn(run(shared, inbox).instrument(span));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        debug!(tab = %self.shared.tab_id, link = self.shared.outbox.kind(), "coordinator started");
    }

    pub fn tab_id(&self) -> &str {
        &self.shared.tab_id
    }

    pub fn role(&self) -> Role {
        *self.shared.role_tx.borrow()
    }

    /// Follow role changes.
    pub fn watch_role(&self) -> watch::Receiver<Role> {
        self.shared.role_tx.subscribe()
    }

    /// How this tab reaches its peers: `bus`, `storage` or `isolated`.
    pub fn link_kind(&self) -> &'static str {
        self.shared.outbox.kind()
    }

    pub fn session(&self) -> Option<Session> {
        self.shared.lock().session.clone()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.lock().session.as_ref().map(|s| s.id)
    }

    /// Sampling decision of the current session, if one is known yet.
    pub fn is_sampled_in(&self) -> Option<bool> {
        self.shared.lock().session.as_ref().map(|s| s.is_sampled_in)
    }

    /// Followers this leader heard from recently. Zero on non-leaders.
    pub fn peer_count(&self) -> usize {
        let inner = self.shared.lock();
        if inner.role != Role::Leader {
            return 0;
        }
        live_peers(&inner, self.shared.config.leader_timeout)
    }

    /// Note user activity in this tab. On the leader this extends the
    /// session, or starts a new one if the previous one ended.
    pub fn record_activity(&self) {
        let mut inner = self.shared.lock();
        if inner.stopped {
            return;
        }
        inner.last_activity = Instant::now();
        match inner.role {
            Role::Leader => {
                let signals = self.shared.touch_session(&mut inner, now_ms());
                self.shared.emit(signals);
            }
            _ => inner.unreported_activity = Some(now_ms()),
        }
    }

    /// End the shared session now. Followers forward the request to the leader.
    pub fn end_session(&self, reason: SessionEndReason) {
        let mut inner = self.shared.lock();
        match inner.role {
            Role::Leader => {
                let signals = self.shared.end_session(&mut inner, reason);
                self.shared.emit(signals);
            }
            Role::Follower => self.shared.outbox.post(TabMessage::EndRequest {
                tab: self.shared.tab_id.clone(),
                reason,
            }),
            Role::Unelected | Role::Candidate => {
                debug!(%reason, "no leader yet, end request dropped");
            }
        }
    }

    /// Page teardown. A leader with no live followers ends the session and
    /// returns the end signal for the caller to record synchronously; a
    /// leader with followers hands over by resigning. Idempotent.
    pub fn shutdown(&self) -> Vec<SessionSignal> {
        let signals = {
            let mut inner = self.shared.lock();
            if inner.stopped {
                return Vec::new();
            }
            inner.stopped = true;

            let mut signals = Vec::new();
            if inner.role == Role::Leader {
                if live_peers(&inner, self.shared.config.leader_timeout) == 0 {
                    signals = self.shared.end_session(&mut inner, SessionEndReason::PageUnload);
                } else if let Some(session) = &inner.session {
                    self.shared.storage.write(keys::SESSION, session);
                }
                self.shared.storage.remove(keys::TAB_INFO);
                self.shared.outbox.post(TabMessage::Resign {
                    tab: self.shared.tab_id.clone(),
                });
            }
            self.shared.set_role(&mut inner, Role::Unelected);
            signals
        };
        self.shared.shutdown.notify_one();
        signals
    }
}

impl Drop for Coordinator {
    /// A tab that vanishes without [`shutdown`](Self::shutdown) just goes
    /// silent; its peers notice through the leader timeout.
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

async fn run(shared: Arc<Shared>, mut inbox: Inbox) {
    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = shared.lock().election_deadline;

        tokio::select! {
            _ = shared.shutdown.notified() => {
                debug!("coordinator stopped");
                return;
            }
            message = inbox.recv(&shared.tab_id) => {
                shared.handle(message);
            }
            _ = sleep_until(deadline), if deadline.is_some() => {
                shared.conclude_election();
            }
            _ = heartbeat.tick() => {
                shared.tick();
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn live_peers(inner: &Inner, timeout: Duration) -> usize {
    inner.peers.values().filter(|seen| seen.elapsed() <= timeout).count()
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, signals: Vec<SessionSignal>) {
        for signal in signals {
            // The receiver goes away with the agent; nothing left to record.
            let _ = self.signals.send(signal);
        }
    }

    fn set_role(&self, inner: &mut Inner, to: Role) {
        let from = inner.role;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            warn!(%from, %to, "ignoring invalid role transition");
            return;
        }
        inner.role = to;
        record_role_change(&self.span, &from.to_string(), &to.to_string());
        if matches!(to, Role::Leader | Role::Follower) {
            metrics::election_outcomes().add(1, &[KeyValue::new("role", to.to_string())]);
        }
        self.role_tx.send_replace(to);
    }

    // -- election -----------------------------------------------------------

    fn begin_election(&self, inner: &mut Inner) {
        inner.claim = Claim::new(self.tab_id.clone());
        inner.leader = None;
        inner.rivals.clear();
        inner.election_deadline = Some(Instant::now() + self.config.election_grace);
        self.set_role(inner, Role::Candidate);
        self.outbox.post(TabMessage::Announce {
            claim: inner.claim.clone(),
        });
    }

    fn conclude_election(&self) {
        let mut inner = self.lock();
        inner.election_deadline = None;
        if inner.role != Role::Candidate {
            return;
        }

        let won = winner(inner.rivals.iter().chain([&inner.claim])) == Some(&inner.claim);
        if !won {
            // The winner announces itself; until then its silence counts
            // against the leader timeout like any other.
            inner.leader_seen = Instant::now();
            self.set_role(&mut inner, Role::Follower);
            return;
        }

        self.set_role(&mut inner, Role::Leader);
        inner.rivals.clear();
        let signals = self.establish_session(&mut inner);
        self.assert_leadership(&inner);
        self.persist_heartbeat(&mut inner);
        info!(session = ?inner.session.as_ref().map(|s| s.id.to_string()), "tab elected leader");
        drop(inner);
        self.emit(signals);
    }

    fn assert_leadership(&self, inner: &Inner) {
        self.outbox.post(TabMessage::Leader {
            claim: inner.claim.clone(),
            session: inner.session.clone(),
        });
    }

    // -- messages -----------------------------------------------------------

    fn handle(&self, message: TabMessage) {
        let mut inner = self.lock();
        if inner.stopped {
            return;
        }
        let signals = match message {
            TabMessage::Announce { claim } => {
                match inner.role {
                    Role::Leader => {
                        inner.peers.insert(claim.tab.clone(), Instant::now());
                        self.assert_leadership(&inner);
                    }
                    Role::Candidate => inner.rivals.push(claim),
                    Role::Follower | Role::Unelected => {}
                }
                Vec::new()
            }
            TabMessage::Leader { claim, session } => self.on_leader(&mut inner, claim, session),
            TabMessage::Alive { tab, active_at } => {
                if inner.role == Role::Leader {
                    inner.peers.insert(tab, Instant::now());
                    if let Some(at) = active_at {
                        inner.last_activity = Instant::now();
                        self.touch_session(&mut inner, at)
                    } else {
                        Vec::new()
                    }
                } else {
                    Vec::new()
                }
            }
            TabMessage::SessionEnded { tab, session_id, .. } => {
                let from_leader = inner.leader.as_ref().is_some_and(|l| l.tab == tab);
                let current = inner.session.as_ref().is_some_and(|s| s.id == session_id);
                if inner.role == Role::Follower && from_leader && current {
                    inner.session = None;
                    self.unpublish_session();
                }
                Vec::new()
            }
            TabMessage::EndRequest { tab, reason } => {
                if inner.role == Role::Leader {
                    debug!(%tab, %reason, "follower requested session end");
                    self.end_session(&mut inner, reason)
                } else {
                    Vec::new()
                }
            }
            TabMessage::Resign { tab } => {
                inner.peers.remove(&tab);
                inner.rivals.retain(|c| c.tab != tab);
                let was_leader = inner.leader.as_ref().is_some_and(|l| l.tab == tab);
                if inner.role == Role::Follower && was_leader {
                    info!(%tab, "leader resigned, re-electing");
                    self.begin_election(&mut inner);
                }
                Vec::new()
            }
        };
        drop(inner);
        self.emit(signals);
    }

    fn on_leader(&self, inner: &mut Inner, claim: Claim, session: Option<Session>) -> Vec<SessionSignal> {
        if inner.role == Role::Leader {
            if inner.claim.outranks(&claim) {
                debug!(rival = %claim.tab, "reasserting against a weaker leader claim");
                self.assert_leadership(inner);
                return Vec::new();
            }
            info!(winner = %claim.tab, "conflicting leader outranks this tab, stepping down");
            self.storage.remove(keys::TAB_INFO);
        }

        inner.election_deadline = None;
        inner.rivals.clear();
        inner.leader = Some(claim);
        inner.leader_seen = Instant::now();
        self.set_role(inner, Role::Follower);
        self.adopt_session(inner, session);
        Vec::new()
    }

    // -- heartbeat ----------------------------------------------------------

    fn tick(&self) {
        let mut inner = self.lock();
        if inner.stopped {
            return;
        }
        let signals = match inner.role {
            Role::Leader => {
                let timeout = self.config.leader_timeout;
                inner.peers.retain(|_, seen| seen.elapsed() <= timeout);

                let idle = inner.last_activity.elapsed();
                let signals = if inner.session.is_some() && idle >= self.config.session_timeout {
                    info!(idle_ms = idle.as_millis() as u64, "session expired");
                    self.end_session(&mut inner, SessionEndReason::Inactivity)
                } else {
                    Vec::new()
                };
                self.assert_leadership(&inner);
                self.persist_heartbeat(&mut inner);
                signals
            }
            Role::Follower => {
                if inner.leader_seen.elapsed() > self.config.leader_timeout {
                    warn!(
                        leader = ?inner.leader.as_ref().map(|l| l.tab.clone()),
                        "leader silent, re-electing"
                    );
                    self.begin_election(&mut inner);
                } else {
                    self.outbox.post(TabMessage::Alive {
                        tab: self.tab_id.clone(),
                        active_at: inner.unreported_activity.take(),
                    });
                }
                Vec::new()
            }
            Role::Unelected | Role::Candidate => Vec::new(),
        };
        drop(inner);
        self.emit(signals);
    }

    fn persist_heartbeat(&self, inner: &mut Inner) {
        let info = TabInfo {
            leader: self.tab_id.clone(),
            heartbeat_at: now_ms(),
            session_id: inner.session.as_ref().map(|s| s.id),
        };
        self.storage.write(keys::TAB_INFO, &info);
        if inner.session_dirty
            && let Some(session) = &inner.session
        {
            self.storage.write(keys::SESSION, session);
            inner.session_dirty = false;
        }
    }

    // -- session ------------------------------------------------------------

    /// Resume the session this tab already knows or the persisted one, or
    /// start fresh. A known session that timed out while nobody was leading
    /// ended unexpectedly.
    fn establish_session(&self, inner: &mut Inner) -> Vec<SessionSignal> {
        let mut signals = Vec::new();
        let timeout_ms = self.config.session_timeout.as_millis() as i64;
        let known = inner
            .session
            .take()
            .or_else(|| self.storage.read::<Session>(keys::SESSION));

        let session = match known {
            Some(session) if !session.is_expired(now_ms(), timeout_ms) => {
                debug!(session = %session.id, "resuming session");
                session
            }
            Some(stale) => {
                info!(session = %stale.id, "previous session ended without teardown");
                signals.push(SessionSignal::Ended {
                    session_id: stale.id,
                    reason: SessionEndReason::Unexpected,
                });
                self.new_session(&mut signals)
            }
            None => self.new_session(&mut signals),
        };

        inner.last_activity = Instant::now();
        inner.session = Some(session);
        inner.session_dirty = true;
        self.publish_session(inner.session.as_ref());
        signals
    }

    fn new_session(&self, signals: &mut Vec<SessionSignal>) -> Session {
        let session = Session::start(rand::random::<f64>() < self.config.sampling_rate);
        info!(session = %session.id, sampled_in = session.is_sampled_in, "session started");
        signals.push(SessionSignal::Started(session.clone()));
        session
    }

    /// Extend the live session, or start a new one if it already ended.
    fn touch_session(&self, inner: &mut Inner, at: i64) -> Vec<SessionSignal> {
        match inner.session.as_mut() {
            Some(session) => {
                session.last_activity_at = session.last_activity_at.max(at);
                inner.session_dirty = true;
                Vec::new()
            }
            None => {
                let mut signals = Vec::new();
                let session = self.new_session(&mut signals);
                inner.session = Some(session);
                inner.session_dirty = true;
                self.publish_session(inner.session.as_ref());
                self.assert_leadership(inner);
                signals
            }
        }
    }

    fn end_session(&self, inner: &mut Inner, reason: SessionEndReason) -> Vec<SessionSignal> {
        let Some(session) = inner.session.take() else {
            return Vec::new();
        };
        inner.session_dirty = false;
        self.storage.remove(keys::SESSION);
        self.unpublish_session();
        self.outbox.post(TabMessage::SessionEnded {
            tab: self.tab_id.clone(),
            session_id: session.id,
            reason,
        });
        info!(session = %session.id, %reason, "session ended");
        vec![SessionSignal::Ended {
            session_id: session.id,
            reason,
        }]
    }

    fn adopt_session(&self, inner: &mut Inner, session: Option<Session>) {
        if inner.session == session {
            return;
        }
        let changed_id = inner.session.as_ref().map(|s| s.id) != session.as_ref().map(|s| s.id);
        inner.session = session;
        if changed_id {
            match &inner.session {
                Some(s) => debug!(session = %s.id, "adopted leader session"),
                None => debug!("leader has no session"),
            }
            self.publish_session(inner.session.as_ref());
        }
    }

    fn publish_session(&self, session: Option<&Session>) {
        let Some(session) = session else {
            self.unpublish_session();
            return;
        };
        let published = self
            .state
            .set_detached(StateKey::SessionId, session.id)
            .and_then(|()| self.state.set_detached(StateKey::SampledIn, session.is_sampled_in));
        if let Err(e) = published {
            debug!(error = %e, "session not published to state store");
        }
    }

    fn unpublish_session(&self) {
        if let Err(e) = self.state.remove_detached(StateKey::SessionId) {
            debug!(error = %e, "session not cleared from state store");
        }
    }
}
