//! Error taxonomy for the scheduler façade.
//!
//! Every operation fails either *transiently* (worth one retry within the
//! same cycle) or *fatally* (abort the affected job, continue the cycle).

use thiserror::Error;

/// Result type for scheduler façade operations.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Errors returned by a [`crate::SchedulerApi`] implementation.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport failure before a response arrived (connect, DNS, TLS).
    #[error("network error: {0}")]
    Network(String),

    /// The request exceeded its deadline.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Non-success HTTP status from the façade.
    #[error("api returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body did not match the expected shape.
    #[error("failed to decode api response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether the operation is worth retrying within the same cycle.
    ///
    /// Server-side failures and transport errors are transient; validation
    /// failures and malformed responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_transient() {
        assert!(ApiError::Network("refused".into()).is_transient());
        assert!(ApiError::Timeout("deadline".into()).is_transient());
    }

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        assert!(
            ApiError::Status {
                status: 503,
                message: "unavailable".into()
            }
            .is_transient()
        );
        assert!(
            ApiError::Status {
                status: 429,
                message: "slow down".into()
            }
            .is_transient()
        );
        assert!(
            !ApiError::Status {
                status: 422,
                message: "bad payload".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn decode_errors_are_fatal() {
        assert!(!ApiError::Decode("not json".into()).is_transient());
    }
}
