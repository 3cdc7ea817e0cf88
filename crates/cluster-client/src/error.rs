//! Cluster client errors

use thiserror::Error;

/// Errors returned by [`crate::ClusterClient`] operations
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Any API or transport failure not classified below
    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write was based on a stale resourceVersion
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Create of an object whose name is already taken
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Server overloaded, timing out or restarting (5xx, 429)
    #[error("Server unavailable: {0}")]
    Unavailable(String),

    /// Request the server refused as invalid or forbidden (400, 403, 422).
    /// Resending it unchanged fails the same way.
    #[error("Rejected by the API server: {0}")]
    Rejected(String),

    /// Request rejected before reaching the server (e.g. missing name)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists(_))
    }

    /// Whether the same request can succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ClusterError::Rejected(_) | ClusterError::InvalidRequest(_) | ClusterError::Serialization(_)
        )
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                ClusterError::AlreadyExists(ae.message.clone())
            }
            kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict(ae.message.clone()),
            kube::Error::Api(ae) if ae.code >= 500 || ae.code == 429 => {
                ClusterError::Unavailable(ae.message.clone())
            }
            kube::Error::Api(ae) if matches!(ae.code, 400 | 403 | 422) => {
                ClusterError::Rejected(format!("{} ({})", ae.message, ae.reason))
            }
            kube::Error::SerdeError(e) => ClusterError::Serialization(e),
            other => ClusterError::Kube(other),
        }
    }
}

/// Collapse `NotFound` into `Ok(None)`.
///
/// Cleanup paths treat an already-removed object as converged.
pub fn ignore_not_found<T>(result: Result<T, ClusterError>) -> Result<Option<T>, ClusterError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(ClusterError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> ClusterError {
        ClusterError::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("request failed with {}", code),
            reason: reason.to_string(),
            code,
        }))
    }

    #[test]
    fn test_ignore_not_found() {
        assert_eq!(ignore_not_found(Ok::<_, ClusterError>(1)).unwrap(), Some(1));
        assert_eq!(
            ignore_not_found::<()>(Err(ClusterError::NotFound("x".into()))).unwrap(),
            None
        );
        assert!(ignore_not_found::<()>(Err(ClusterError::Conflict("x".into()))).is_err());
    }

    #[test]
    fn test_predicates() {
        assert!(ClusterError::NotFound("a".into()).is_not_found());
        assert!(ClusterError::Conflict("a".into()).is_conflict());
        assert!(!ClusterError::AlreadyExists("a".into()).is_conflict());
        assert!(ClusterError::AlreadyExists("a".into()).is_already_exists());
    }

    #[test]
    fn test_api_status_codes_are_classified() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(api_error(409, "AlreadyExists").is_already_exists());
        assert!(api_error(409, "Conflict").is_conflict());
        assert!(matches!(api_error(503, "ServiceUnavailable"), ClusterError::Unavailable(_)));
        assert!(api_error(429, "TooManyRequests").is_transient());
    }

    #[test]
    fn test_invalid_and_forbidden_requests_are_not_retried() {
        for (code, reason) in [(400, "BadRequest"), (403, "Forbidden"), (422, "Invalid")] {
            let err = api_error(code, reason);
            assert!(matches!(err, ClusterError::Rejected(_)), "{} maps to {:?}", code, err);
            assert!(!err.is_transient(), "{} must not be retried forever", code);
        }
    }
}
