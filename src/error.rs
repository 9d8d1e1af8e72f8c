//! Error types for the vcluster operator

use thiserror::Error;

/// Main error type for virtual cluster reconciliation
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid resource configuration that will not fix itself on retry
    #[error("validation error: {0}")]
    Validation(String),

    /// Stored kubeconfig is malformed or ambiguous
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Helm invocation failed
    #[error("helm error: {0}")]
    Helm(String),

    /// A dependency is not ready yet (secret missing, API unreachable, no address)
    #[error("not ready: {0}")]
    NotReady(String),

    /// Orchestration layer object is missing or malformed
    #[error("orchestration error: {0}")]
    Orchestration(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error with operation context
    #[error("{context}: {message}")]
    Internal {
        /// Operation that failed
        context: String,
        /// Underlying failure
        message: String,
    },

    /// Several independent failures from one reconciliation pass
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    let parts: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a kubeconfig error with the given message
    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::Kubeconfig(msg.into())
    }

    /// Create a helm error with the given message
    pub fn helm(msg: impl Into<String>) -> Self {
        Self::Helm(msg.into())
    }

    /// Create a not-ready error with the given message
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    /// Create an orchestration error with the given message
    pub fn orchestration(msg: impl Into<String>) -> Self {
        Self::Orchestration(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error, recording which operation failed
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Combine errors from one pass. Returns `None` when there is nothing to report.
    pub fn aggregate(errors: impl IntoIterator<Item = Error>) -> Option<Self> {
        let mut errors: Vec<Error> = errors.into_iter().collect();
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Aggregate(errors)),
        }
    }

    /// Errors that need a spec correction by the user
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Kubeconfig(_))
    }

    /// Errors expected to resolve on their own after a short wait
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotReady(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
