//! Engine error types
//!
//! Sentinel conditions are variants so callers branch on them with `matches!`
//! instead of comparing messages.

use crate::maintenance::PolicyError;
use lifecycle_types::TypesError;
use std::time::Duration;
use thiserror::Error;

/// Errors from the cluster collaborators
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("api error: {0}")]
    Api(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

/// Convergence engine errors
#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    #[error("invalid kyma spec: {0}")]
    InvalidKymaSpec(String),

    #[error("invalid module entry in Kyma status: {0}")]
    InvalidModuleEntry(String),

    #[error("module template not allowed: {0}")]
    TemplateNotAllowed(String),

    #[error("module template update not allowed: {0}")]
    TemplateUpdateNotAllowed(String),

    #[error("waiting for next maintenance window to update module version")]
    WaitingForNextMaintenanceWindow,

    #[error("failed to determine if maintenance window is active: {0}")]
    MaintenanceWindowUnknown(String),

    #[error("ModuleReleaseMeta not found for module: {0}")]
    ReleaseMetaNotFound(String),

    #[error("no templates were found: {0}")]
    NoTemplatesInListResult(String),

    #[error("invalid module template version: {0}")]
    InvalidTemplateVersion(String),

    #[error("failed to get descriptor: {0}")]
    Descriptor(String),

    #[error("componentNameMapping not supported: {0}")]
    ComponentNameMappingNotSupported(String),

    #[error("{}", apply_failure_message(.errors, .elapsed))]
    ServerSideApplyFailed {
        errors: Vec<String>,
        elapsed: Duration,
    },

    #[error("manifests still exist")]
    ManifestsStillExist,

    #[error("access secret not found for kyma {0}")]
    AccessSecretNotFound(String),

    #[error("certificate not ready: {0}")]
    CertificateNotReady(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<LifecycleError>,
    },

    #[error("invalid resource: {0}")]
    Validation(#[from] TypesError),

    #[error("maintenance policy: {0}")]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn apply_failure_message(errors: &[String], elapsed: &Duration) -> String {
    let mut lines: Vec<String> = errors.to_vec();
    lines.push(format!("ServerSideApply failed (after {elapsed:?})"));
    lines.join("\n")
}

impl LifecycleError {
    /// Wrap with a short description of what was being attempted
    pub fn context(self, context: impl Into<String>) -> Self {
        LifecycleError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers
    pub fn root(&self) -> &LifecycleError {
        match self {
            LifecycleError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_template_not_allowed(&self) -> bool {
        matches!(self.root(), LifecycleError::TemplateNotAllowed(_))
    }

    pub fn is_update_not_allowed(&self) -> bool {
        matches!(self.root(), LifecycleError::TemplateUpdateNotAllowed(_))
    }

    /// Expected condition: a newer version waits for its maintenance window
    pub fn is_waiting_for_window(&self) -> bool {
        matches!(self.root(), LifecycleError::WaitingForNextMaintenanceWindow)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), LifecycleError::Client(ClientError::NotFound(_)))
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Result type for collaborator I/O
pub type ClientResult<T> = std::result::Result<T, ClientError>;
