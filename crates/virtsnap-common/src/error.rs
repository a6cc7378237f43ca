//! Error types for the snapshot controllers
//!
//! API errors are classified on the way in so reconcilers can branch on
//! `NotFound`, `AlreadyExists` and `Conflict` without inspecting status codes.

use thiserror::Error;

/// Main error type for the snapshot, restore and clone controllers
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error not covered by a more specific variant
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube error
        #[source]
        source: kube::Error,
    },

    /// Object does not exist
    #[error("not found: {message}")]
    NotFound {
        /// Error message
        message: String,
    },

    /// Object already exists
    #[error("already exists: {message}")]
    AlreadyExists {
        /// Error message
        message: String,
    },

    /// Optimistic concurrency check failed
    #[error("conflict: {message}")]
    Conflict {
        /// Error message
        message: String,
    },

    /// Request is invalid and will not succeed without a spec change
    #[error("validation error: {message}")]
    Validation {
        /// Error message
        message: String,
    },

    /// Encoding or decoding failed
    #[error("serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
    },

    /// Anything else
    #[error("{message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl From<kube::Error> for Error {
    fn from(source: kube::Error) -> Self {
        match &source {
            kube::Error::Api(ae) if ae.code == 404 => Error::NotFound {
                message: ae.message.clone(),
            },
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Error::AlreadyExists {
                    message: ae.message.clone(),
                }
            }
            kube::Error::Api(ae) if ae.code == 409 => Error::Conflict {
                message: ae.message.clone(),
            },
            // A failed JSON patch "test" operation is rejected as invalid
            kube::Error::Api(ae) if ae.code == 422 && ae.message.contains("test") => {
                Error::Conflict {
                    message: ae.message.clone(),
                }
            }
            _ => Error::Kube { source },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization {
            message: e.to_string(),
        }
    }
}

impl Error {
    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound {
            message: msg.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists {
            message: msg.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
        }
    }

    /// Object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Object already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Write lost an optimistic concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec change. Conflicts and
    /// missing objects resolve once the cache catches up.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::NotFound { .. } => true,
            Error::AlreadyExists { .. } => true,
            Error::Conflict { .. } => true,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

/// Result alias for the snapshot controllers
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: message.into(),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn api_errors_are_classified() {
        assert!(Error::from(api_error(404, "NotFound", "vm not found")).is_not_found());
        assert!(Error::from(api_error(409, "AlreadyExists", "exists")).is_already_exists());
        assert!(Error::from(api_error(409, "Conflict", "object was modified")).is_conflict());
        assert!(Error::from(api_error(
            422,
            "Invalid",
            "the server rejected our request: testing value /metadata/resourceVersion failed"
        ))
        .is_conflict());

        let forbidden = Error::from(api_error(403, "Forbidden", "nope"));
        assert!(matches!(forbidden, Error::Kube { .. }));
        assert!(!forbidden.is_retryable());
    }

    #[test]
    fn validation_is_permanent_conflicts_retry() {
        assert!(!Error::validation("bad patch").is_retryable());
        assert!(!Error::serialization("bad json").is_retryable());
        assert!(Error::conflict("stale").is_retryable());
        assert!(Error::internal("lock not ready").is_retryable());
        assert!(Error::validation("bad patch")
            .to_string()
            .contains("validation error"));
    }
}
