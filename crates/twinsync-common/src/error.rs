//! Error types for twinsync
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context needed to decide whether the
//! controller should retry quietly, retry loudly, or give up.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// HTTP status returned by the API server when an object does not exist
const NOT_FOUND: u16 = 404;

/// HTTP status returned by the API server on an optimistic-concurrency conflict
const CONFLICT: u16 = 409;

/// Main error type for twinsync operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid configuration, detected when the syncer is constructed
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid configuration field (e.g., "nodeSelector")
        field: Option<String>,
    },

    /// A translator collaborator failed to produce an object
    #[error("translation error for {pod}: {message}")]
    Translation {
        /// namespace/name of the pod being translated
        pod: String,
        /// Description of what failed
        message: String,
    },

    /// A bounded wait did not converge before its deadline
    #[error("timed out [{context}]: {message}")]
    Timeout {
        /// Description of what was being waited for
        message: String,
        /// Operation that was waiting (e.g., "bind")
        context: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "controller")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error pointing at a configuration field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a translation error for the given pod key
    pub fn translation(pod: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Translation {
            pod: pod.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error with context
    pub fn timeout(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a serialization error for a resource kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// API status code, if this error came back from an API server
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }

    /// True when the target object does not exist
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(NOT_FOUND)
    }

    /// True when an optimistic write lost a race with another writer
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(CONFLICT)
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a configuration fix.
    /// Conflicts are always retryable; other 4xx API errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == CONFLICT => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Translation { .. } => true,
            Error::Timeout { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for errors a user should see as a warning event on their pod
    ///
    /// Conflicts and not-found responses are expected during normal
    /// operation and are only retried.
    pub fn is_user_visible(&self) -> bool {
        !(self.is_conflict() || self.is_not_found())
    }
}

/// Build an API error response, for tests that simulate API server failures
pub fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("simulated {} response", reason),
            reason: reason.to_string(),
            code,
        }),
    }
}
