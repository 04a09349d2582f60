//! Error types for lifecycle-daemon

use lifecycle_engine::{LifecycleError, PolicyError};
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Maintenance policy could not be loaded
    #[error("Maintenance policy error: {0}")]
    Policy(#[from] PolicyError),

    /// A reconciliation pass failed
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] LifecycleError),

    /// Kyma object without a namespace
    #[error("Kyma {0} has no namespace")]
    MissingNamespace(String),
}

/// Result type for daemon operations
pub type DaemonResult<T> = std::result::Result<T, DaemonError>;

impl DaemonError {
    /// Deletion is blocked on manifests that are still being removed
    pub fn is_waiting_for_manifests(&self) -> bool {
        matches!(
            self,
            DaemonError::Reconcile(e) if matches!(e.root(), LifecycleError::ManifestsStillExist)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiting_for_manifests() {
        let err = DaemonError::from(LifecycleError::ManifestsStillExist);
        assert!(err.is_waiting_for_manifests());

        let err = DaemonError::MissingNamespace("k1".to_string());
        assert!(!err.is_waiting_for_manifests());
    }
}
