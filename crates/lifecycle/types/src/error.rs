//! Validation errors for lifecycle resources

use crate::State;
use thiserror::Error;

/// Errors raised by resource-level validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypesError {
    #[error("ModuleReleaseMeta for module {module} declares both channels and a mandatory version")]
    AmbiguousReleaseMeta { module: String },

    #[error("ModuleReleaseMeta for module {module} declares neither channels nor a mandatory version")]
    EmptyReleaseMeta { module: String },

    #[error("illegal state transition from {from} to {to}")]
    InvalidTransition { from: State, to: State },
}

/// Result type for resource validation
pub type Result<T> = std::result::Result<T, TypesError>;
