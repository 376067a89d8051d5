use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching stats from the data backend.
///
/// One failed fetch is observed by every caller that was attached to it, which is why this error
/// is cheap to clone and carries messages instead of the underlying error values.
/// Failures are never written to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The backend has no stats for the requested entity.
    #[error("not found")]
    NotFound,
    /// The backend refused the query.
    ///
    /// The attached string contains the backend's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The query did not complete in time.
    ///
    /// The cache itself imposes no timeouts, this is reported by fetch functions that do.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The query failed due to a connection problem or an error response from the backend.
    #[error("backend error: {0}")]
    Backend(String),
    /// The backend answered, but the answer does not have the expected shape.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error in the caller's fetch wiring.
    #[error("internal error")]
    InternalError,
}

impl FetchError {
    /// A short, stable name for this error, suitable as a metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::NotFound => "notfound",
            FetchError::PermissionDenied(_) => "permissiondenied",
            FetchError::Timeout(_) => "timeout",
            FetchError::Backend(_) => "backend",
            FetchError::Malformed(_) => "malformed",
            FetchError::InternalError => "internal",
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::Backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// The result a fetch function resolves to.
pub type FetchResult = Result<crate::FetchedStats, FetchError>;
