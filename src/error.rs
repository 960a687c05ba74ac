//! Error types for the Bookstore controller
//!
//! Every failure a reconcile pass can hit funnels into [`Error`]. The worker
//! loop only cares whether an error is retryable; the variant and message are
//! there for operators reading logs and events.

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error that could not be classified more precisely
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The target object does not exist in the system of record
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (Deployment, Service, Bookstore)
        kind: String,
        /// `namespace/name` of the missing object
        name: String,
    },

    /// Optimistic concurrency failure (stale resourceVersion)
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// `namespace/name` of the object
        name: String,
        /// Server-provided reason
        message: String,
    },

    /// A managed resource exists under the desired name but another controller owns it
    #[error("Resource {name:?} already exists and is not managed by Bookstore")]
    OwnershipConflict {
        /// Resource kind
        kind: String,
        /// Name of the foreign resource
        name: String,
    },

    /// Bookstore spec is missing a required field or holds an invalid value
    #[error("validation error: {0}")]
    Validation(String),

    /// Malformed `namespace/name` reconcile key
    #[error("invalid resource key: {0}")]
    InvalidKey(String),

    /// Local cache read failed for a reason other than absence
    #[error("state store error: {0}")]
    Store(String),

    /// Transient transport failure talking to the system of record
    #[error("transient error: {0}")]
    Transient(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a state store error with the given message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a transient error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a not-found error for a resource
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an optimistic-concurrency conflict error
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create an ownership conflict error for a resource we refuse to touch
    pub fn ownership_conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::OwnershipConflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Check if a pass that failed with this error should be requeued
    ///
    /// Only spec problems and malformed keys are terminal: the next spec
    /// update re-triggers the key anyway. Ownership conflicts stay retryable
    /// so an out-of-band fix is eventually picked up.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Validation(_) | Error::InvalidKey(_))
    }

    /// True if the error reports a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// True if the error reports a resourceVersion conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: operators need the foreign resource's name in the message
    #[test]
    fn story_ownership_conflict_names_the_resource() {
        let err = Error::ownership_conflict("Deployment", "d1");
        assert_eq!(
            err.to_string(),
            "Resource \"d1\" already exists and is not managed by Bookstore"
        );
        assert!(err.is_retryable());
    }

    /// Story: spec and key problems are terminal, everything else backs off
    #[test]
    fn story_retry_classification() {
        assert!(!Error::validation("deployment name must be specified").is_retryable());
        assert!(!Error::InvalidKey("a/b/c".to_string()).is_retryable());

        assert!(Error::transient("connection reset").is_retryable());
        assert!(Error::store("cache poisoned").is_retryable());
        assert!(Error::not_found("Deployment", "ns/d1").is_retryable());
        assert!(Error::conflict("Bookstore", "ns/store1", "stale").is_retryable());
    }

    #[test]
    fn test_not_found_and_conflict_helpers() {
        assert!(Error::not_found("Service", "ns/s1").is_not_found());
        assert!(!Error::not_found("Service", "ns/s1").is_conflict());

        let err = Error::conflict("Bookstore", "ns/store1", "object has been modified");
        assert!(err.is_conflict());
        assert!(err.to_string().contains("object has been modified"));
    }

    #[test]
    fn test_kube_api_codes_are_classified() {
        let api = |code: u16| {
            Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "".to_string(),
                code,
            }))
        };
        assert!(api(404).is_not_found());
        assert!(api(409).is_conflict());
        assert!(!api(500).is_not_found());
        assert!(api(500).is_retryable());
    }
}
