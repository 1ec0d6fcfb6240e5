//! Inter-tab signaling.
//!
//! Tabs talk over a broadcast bus when one is available. Without it, each
//! message is written to the shared durable store and picked up by the
//! other tabs through storage-change notifications. A tab with neither is
//! isolated and simply elects itself.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::election::Claim;
use crate::model::{Session, SessionEndReason, SessionId};
use crate::storage::{StorageChange, StorageManager, keys};

const BUS_CAPACITY: usize = 256;

/// Messages exchanged between tabs of one origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TabMessage {
    /// A tab is looking for a leader.
    Announce { claim: Claim },
    /// A leader asserting itself: in reply to an announce, after winning an
    /// election, or on every heartbeat.
    Leader {
        claim: Claim,
        session: Option<Session>,
    },
    /// A follower is alive; `active_at` is set when it saw user activity.
    Alive {
        tab: String,
        active_at: Option<i64>,
    },
    /// The leader ended the shared session.
    SessionEnded {
        tab: String,
        session_id: SessionId,
        reason: SessionEndReason,
    },
    /// A follower asks the leader to end the session.
    EndRequest {
        tab: String,
        reason: SessionEndReason,
    },
    /// The leader is going away cleanly.
    Resign { tab: String },
}

impl TabMessage {
    pub fn sender(&self) -> &str {
        match self {
            TabMessage::Announce { claim } | TabMessage::Leader { claim, .. } => &claim.tab,
            TabMessage::Alive { tab, .. }
            | TabMessage::SessionEnded { tab, .. }
            | TabMessage::EndRequest { tab, .. }
            | TabMessage::Resign { tab } => tab,
        }
    }
}

/// In-process broadcast bus shared by the tabs of one origin.
pub struct TabBus {
    tx: broadcast::Sender<TabMessage>,
}

impl TabBus {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Arc::new(Self { tx })
    }

    fn post(&self, message: TabMessage) {
        let _ = self.tx.send(message);
    }
}

/// Connect a tab to its peers: the bus if there is one, otherwise storage
/// notifications. Subscribes immediately so nothing posted after this call
/// is missed.
pub(crate) fn connect(bus: Option<Arc<TabBus>>, storage: &Arc<StorageManager>) -> (Outbox, Inbox) {
    if let Some(bus) = bus {
        let rx = bus.tx.subscribe();
        return (Outbox::Bus(bus), Inbox::Bus(rx));
    }
    match storage.subscribe_changes() {
        Some(rx) => (
            Outbox::Storage(Arc::clone(storage)),
            Inbox::Storage {
                rx,
                key: storage.full_key(keys::TAB_SIGNAL),
            },
        ),
        None => {
            debug!("no broadcast bus and no shared storage, tab is isolated");
            (Outbox::Isolated, Inbox::Isolated)
        }
    }
}

/// Sending half of a tab's link.
#[derive(Clone)]
pub(crate) enum Outbox {
    Bus(Arc<TabBus>),
    Storage(Arc<StorageManager>),
    Isolated,
}

impl Outbox {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Outbox::Bus(_) => "bus",
            Outbox::Storage(_) => "storage",
            Outbox::Isolated => "isolated",
        }
    }

    pub(crate) fn post(&self, message: TabMessage) {
        match self {
            Outbox::Bus(bus) => bus.post(message),
            Outbox::Storage(storage) => {
                storage.write(keys::TAB_SIGNAL, &message);
            }
            Outbox::Isolated => {}
        }
    }
}

/// Receiving half of a tab's link.
pub(crate) enum Inbox {
    Bus(broadcast::Receiver<TabMessage>),
    Storage {
        rx: broadcast::Receiver<StorageChange>,
        key: String,
    },
    Isolated,
}

impl Inbox {
    /// Next message from another tab. Pends forever when isolated.
    pub(crate) async fn recv(&mut self, own_tab: &str) -> TabMessage {
        loop {
            let message = match self {
                Inbox::Bus(rx) => match rx.recv().await {
                    Ok(message) => Some(message),
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "tab bus lagged");
                        None
                    }
                    Err(RecvError::Closed) => std::future::pending().await,
                },
                Inbox::Storage { rx, key } => match rx.recv().await {
                    Ok(change) if change.key == *key && change.source != own_tab => change
                        .new_value
                        .and_then(|raw| serde_json::from_str::<TabMessage>(&raw).ok()),
                    Ok(_) => None,
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "storage notifications lagged");
                        None
                    }
                    Err(RecvError::Closed) => std::future::pending().await,
                },
                Inbox::Isolated => std::future::pending().await,
            };

            if let Some(message) = message
                && message.sender() != own_tab
            {
                return message;
            }
        }
    }
}
