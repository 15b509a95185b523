//! Error types for the deployment engine.

use thiserror::Error;

use crate::services::ServiceError;

/// Errors surfaced by the deployment engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A referenced resource has not been deployed yet.
    ///
    /// This is an expected signal: the deployment loop catches it and
    /// re-queues the affected change for a later pass.
    #[error("dependency on resource \"{resource_id}\" not yet satisfied: {message}")]
    DependencyNotYetSatisfied {
        resource_id: String,
        message: String,
    },

    /// A stack update produced an empty change list, which is not allowed.
    #[error("no updates are to be performed")]
    NoStackUpdates,

    /// An intrinsic function could not be evaluated against the template.
    #[error("cannot evaluate template expression: {0}")]
    Evaluation(String),

    /// A backing service call failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Any other failure that aborts the stack deployment.
    #[error("{0}")]
    Deployment(String),
}

impl EngineError {
    pub fn dependency(resource_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DependencyNotYetSatisfied {
            resource_id: resource_id.into(),
            message: message.into(),
        }
    }

    /// Whether this is the recoverable dependency-deferral signal.
    pub fn is_dependency_not_satisfied(&self) -> bool {
        matches!(self, Self::DependencyNotYetSatisfied { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
