//! Lifecycle state shared by Kyma, module status entries and manifests
//!
//! The state machine never inspects raw strings: every state the API server can
//! report maps onto [`State`], and the allowed moves between them are spelled out
//! in [`State::can_transition_to`]. [`Kyma::set_state`](crate::Kyma::set_state)
//! refuses every other move.

use crate::error::{Result, TypesError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a Kyma, a module or a manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
pub enum State {
    /// Never processed
    #[default]
    #[serde(rename = "")]
    Unset,

    /// Converging towards the declared modules
    Processing,

    /// Deletion timestamp observed, tearing down
    Deleting,

    /// Every module reports ready
    Ready,

    /// A pass or a module failed
    Error,

    /// A module degraded without failing
    Warning,

    /// Opted out of lifecycle management
    Unmanaged,
}

/// What the install path does with a Kyma in a given state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    /// First sight: move to `Processing` and requeue immediately
    Initialize,
    /// Run module reconciliation and derive the next state
    Converge,
    /// Nothing to do, do not requeue
    Halt,
}

impl State {
    /// All states, in declaration order
    pub const ALL: [State; 7] = [
        State::Unset,
        State::Processing,
        State::Deleting,
        State::Ready,
        State::Error,
        State::Warning,
        State::Unmanaged,
    ];

    /// Wire representation of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Unset => "",
            State::Processing => "Processing",
            State::Deleting => "Deleting",
            State::Ready => "Ready",
            State::Error => "Error",
            State::Warning => "Warning",
            State::Unmanaged => "Unmanaged",
        }
    }

    /// Transition table for the Kyma lifecycle.
    ///
    /// Staying in place is always allowed. `Error` and `Deleting` are reachable
    /// from everywhere. `Deleting` only ever leaves towards `Error`, and
    /// `Unmanaged` only towards `Deleting`/`Error`.
    pub fn can_transition_to(self, next: State) -> bool {
        use State::*;

        if self == next {
            return true;
        }

        match (self, next) {
            (_, Error) | (_, Deleting) => true,
            (Unset, Processing) => true,
            (Processing | Ready | Warning | Error, Processing | Ready | Warning) => true,
            (Unset | Processing | Ready | Warning | Error, Unmanaged) => true,
            (Unset, _) => false,
            (Processing | Ready | Warning | Error, Unset) => false,
            (Deleting, _) => false,
            (Unmanaged, _) => false,
        }
    }

    /// Validate a transition, returning the target state
    pub fn transition_to(self, next: State) -> Result<State> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TypesError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Install-path dispatch for the current state
    pub fn install_phase(self) -> InstallPhase {
        match self {
            State::Unset => InstallPhase::Initialize,
            State::Processing | State::Error | State::Ready | State::Warning => {
                InstallPhase::Converge
            }
            State::Unmanaged => InstallPhase::Halt,
            State::Deleting => InstallPhase::Halt,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Unset => write!(f, "<unset>"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}
