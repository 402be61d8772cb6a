//! Agent lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle states an agent moves through inside the runtime.
///
/// Only `Active` agents receive events. `Terminated` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentLifecycle {
    /// Registered but not receiving events.
    Inactive,
    /// Receiving and handling events.
    Active,
    /// Being serialized for transport to another host.
    Migrating,
    /// Being copied to another host.
    Cloning,
    /// Destroyed; no further transitions.
    Terminated,
}

impl AgentLifecycle {
    /// Whether a transition from `self` to `to` is legal.
    ///
    /// Any state may "transition" to itself. `Inactive` and `Active` may
    /// move to any state; `Migrating` and `Cloning` may only settle back to
    /// `Active`, `Inactive`, or `Terminated`; `Terminated` is terminal.
    pub fn can_transition(self, to: Self) -> bool {
        if self == to {
            return true;
        }
        match self {
            Self::Inactive | Self::Active => true,
            Self::Migrating | Self::Cloning => {
                matches!(to, Self::Active | Self::Inactive | Self::Terminated)
            }
            Self::Terminated => false,
        }
    }

    /// Validate and perform a transition.
    pub fn transition(self, to: Self) -> Result<Self, LifecycleError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(LifecycleError::IllegalTransition { from: self, to })
        }
    }

    /// Only `Active` agents receive events.
    pub fn can_receive_events(self) -> bool {
        self == Self::Active
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self == Self::Terminated
    }
}

/// Errors raised by lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// The requested transition is not in the legal-transition table.
    #[error("illegal lifecycle transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// State the agent was in.
        from: AgentLifecycle,
        /// State that was requested.
        to: AgentLifecycle,
    },
}
