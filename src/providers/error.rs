use thiserror::Error;

/// Failure reported by a provider adapter.
///
/// Permanent errors are never retried. Transient errors are retried until the attempt
/// cap, after which they become the work item's terminal outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider does not support this request: {0}")]
    NotImplemented(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("transient failure: {0}")]
    Transient(String),
}

impl ProviderError {
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ProviderError::NotImplemented(_)
                | ProviderError::Unauthorized(_)
                | ProviderError::Forbidden(_)
                | ProviderError::InvalidRequest(_)
                | ProviderError::Cancelled(_)
        )
    }

    /// Stable error code carried on result messages.
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::NotImplemented(_) => "not_implemented",
            ProviderError::Unauthorized(_) => "unauthorized",
            ProviderError::Forbidden(_) => "forbidden",
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::Cancelled(_) => "cancelled",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Transient(_) => "transient",
        }
    }

    /// Classifies an upstream HTTP status code.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            400 | 422 => ProviderError::InvalidRequest(detail),
            401 => ProviderError::Unauthorized(detail),
            403 => ProviderError::Forbidden(detail),
            404 | 501 => ProviderError::NotImplemented(detail),
            408 | 504 => ProviderError::Timeout(detail),
            499 => ProviderError::Cancelled(detail),
            _ => ProviderError::Transient(detail),
        }
    }
}
