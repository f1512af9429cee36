use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Lifecycle state of a managed cluster.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ClusterState {
    /// The cluster is being created.
    Creation,

    /// The cluster is up and running.
    Ready,

    /// The cluster is scaling down to hibernation.
    Hibernating,

    /// The cluster is hibernated.
    Hibernated,

    /// The cluster is waking up from hibernation.
    Waking,

    /// The cluster is being deleted.
    Deletion,

    /// The cluster has been deleted.
    Deleted,

    /// The cluster is being restored.
    Restore,

    /// The cluster is being migrated.
    Migration,
}

impl ClusterState {
    /// All states, in declaration order.
    pub const ALL: [ClusterState; 9] = [
        ClusterState::Creation,
        ClusterState::Ready,
        ClusterState::Hibernating,
        ClusterState::Hibernated,
        ClusterState::Waking,
        ClusterState::Deletion,
        ClusterState::Deleted,
        ClusterState::Restore,
        ClusterState::Migration,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    /// Returns the name of the state.
    pub const fn as_str(self) -> &'static str {
        match self {
            ClusterState::Creation => "Creation",
            ClusterState::Ready => "Ready",
            ClusterState::Hibernating => "Hibernating",
            ClusterState::Hibernated => "Hibernated",
            ClusterState::Waking => "Waking",
            ClusterState::Deletion => "Deletion",
            ClusterState::Deleted => "Deleted",
            ClusterState::Restore => "Restore",
            ClusterState::Migration => "Migration",
        }
    }

    /// Returns `true` if moving from `self` to `next` follows the nominal lifecycle.
    ///
    /// Transitions are driven externally and are never rejected, but unexpected ones are worth surfacing.
    pub fn is_expected_transition(self, next: ClusterState) -> bool {
        use ClusterState::*;

        if self == next {
            return true;
        }

        match (self, next) {
            (Deleted, Creation) => true,
            (Deleted, _) => false,
            (_, Deletion | Restore | Migration) => true,
            (Creation, Ready) => true,
            (Ready, Hibernating) => true,
            (Hibernating, Hibernated | Ready) => true,
            (Hibernated, Waking) => true,
            (Waking, Ready) => true,
            (Deletion, Deleted) => true,
            (Restore | Migration, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown cluster state name.
#[derive(Debug, Snafu)]
#[snafu(display("Unknown cluster state '{}'.", name))]
pub struct UnknownClusterState {
    name: String,
}

impl FromStr for ClusterState {
    type Err = UnknownClusterState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClusterState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownClusterState { name: s.to_string() })
    }
}

/// Whether sending is allowed, for each cluster state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SendPermissionMatrix {
    allowed: [bool; 9],
}

impl SendPermissionMatrix {
    /// Creates a matrix where every state has the same permission.
    pub const fn uniform(allowed: bool) -> Self {
        Self { allowed: [allowed; 9] }
    }

    /// Default permissions for the main destination.
    ///
    /// Everything is sent except while the cluster hibernates.
    pub const fn main_defaults() -> Self {
        Self::uniform(true)
            .with(ClusterState::Hibernating, false)
            .with(ClusterState::Hibernated, false)
    }

    /// Default permissions for dynamically managed destinations.
    ///
    /// Only the states around creation, deletion, restore and migration are sent.
    pub const fn dynamic_defaults() -> Self {
        Self::uniform(true)
            .with(ClusterState::Ready, false)
            .with(ClusterState::Hibernating, false)
            .with(ClusterState::Hibernated, false)
            .with(ClusterState::Waking, false)
    }

    /// Returns a copy of this matrix with the permission for `state` replaced.
    pub const fn with(mut self, state: ClusterState, allowed: bool) -> Self {
        self.allowed[state.index()] = allowed;
        self
    }

    /// Overrides the permission for `state`.
    pub fn set(&mut self, state: ClusterState, allowed: bool) {
        self.allowed[state.index()] = allowed;
    }

    /// Returns whether sending is allowed while in `state`.
    pub const fn allows(&self, state: ClusterState) -> bool {
        self.allowed[state.index()]
    }
}

/// Identifies a destination managed by the controller.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DestinationKey {
    /// The statically configured destination that receives everything not routed elsewhere.
    Main,

    /// A dynamically resolved destination, such as a cluster namespace.
    Named(String),
}

impl DestinationKey {
    /// Creates a named destination key.
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// Returns `true` if this is the main destination.
    pub fn is_main(&self) -> bool {
        matches!(self, Self::Main)
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKey::Main => f.write_str("main"),
            DestinationKey::Named(name) => f.write_str(name),
        }
    }
}
