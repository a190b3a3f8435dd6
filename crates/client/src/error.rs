//! Transport error types.

use std::sync::Arc;

use reqcache_core::Error;

/// Errors from talking to the origin.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Request could not be built (bad method, header or URL).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Redirect chain longer than the configured limit.
    #[error("too many redirects: exceeded {0}")]
    TooManyRedirects(usize),

    /// Redirect with a `Location` that cannot be resolved.
    #[error("invalid redirect location: {0}")]
    InvalidRedirect(String),

    /// Request timeout.
    #[error("request timeout")]
    Timeout,

    /// Network error.
    #[error("network error: {0}")]
    Network(Arc<reqwest::Error>),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() { TransportError::Timeout } else { TransportError::Network(Arc::new(err)) }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidRequest(msg) => Error::InvalidUrl(msg),
            other => Error::HttpError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::TooManyRedirects(5);
        assert!(err.to_string().contains("too many redirects"));

        let err = TransportError::Timeout;
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_into_core_error() {
        let err: Error = TransportError::Timeout.into();
        assert!(err.to_string().starts_with("HTTP_ERROR"));

        let err: Error = TransportError::InvalidRequest("bad url".into()).into();
        assert!(err.to_string().starts_with("INVALID_URL"));
    }
}
