//! Leader claims and their total order.
//!
//! The earliest announcement wins. Equal announce times fall back to the
//! higher random tiebreaker, then to the tab id, so two distinct claims are
//! never equal.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::model::now_ms;

/// Role of a tab in the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Unelected,
    Candidate,
    Leader,
    Follower,
}

impl Role {
    pub fn can_transition_to(self, to: Role) -> bool {
        use Role::*;
        matches!(
            (self, to),
            (Unelected, Candidate)
                | (Candidate, Leader)
                | (Candidate, Follower)
                | (Follower, Candidate)  // leader presumed dead
                | (Leader, Follower)     // lost a conflicting claim
                | (Leader, Unelected)
                | (Follower, Unelected)
                | (Candidate, Unelected)
        )
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Unelected => "unelected",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
            Role::Follower => "follower",
        };
        write!(f, "{s}")
    }
}

/// A tab's bid for leadership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub tab: String,
    /// Wall-clock millis of the announcement.
    pub announced_at: i64,
    pub tiebreaker: u64,
}

impl Claim {
    /// A fresh claim for `tab`, stamped now, with a random tiebreaker.
    pub fn new(tab: impl Into<String>) -> Self {
        Self {
            tab: tab.into(),
            announced_at: now_ms(),
            tiebreaker: rand::random(),
        }
    }

    /// True if `self` beats `other`.
    pub fn outranks(&self, other: &Claim) -> bool {
        self.cmp(other) == Ordering::Less
    }
}

impl Ord for Claim {
    /// `Less` means "ranks higher".
    fn cmp(&self, other: &Self) -> Ordering {
        self.announced_at
            .cmp(&other.announced_at)
            .then_with(|| other.tiebreaker.cmp(&self.tiebreaker))
            .then_with(|| self.tab.cmp(&other.tab))
    }
}

impl PartialOrd for Claim {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The winning claim among `claims`, if any.
pub fn winner<'a>(claims: impl IntoIterator<Item = &'a Claim>) -> Option<&'a Claim> {
    claims.into_iter().min()
}
