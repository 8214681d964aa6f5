use std::time::Duration;

use thiserror::Error;

/// How callers should react to an [`ApiError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff
    Transient,
    /// Server asked us to slow down; honour `Retry-After`
    Throttled,
    /// Retrying cannot help
    Permanent,
    /// Watch resource version is gone; relist
    Expired,
    /// Credentials or connectivity are broken; abort
    Fatal,
}

/// Errors returned by the cluster API collaborator
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("transient API error ({code}): {message}")]
    Transient { code: u16, message: String },

    #[error("too many requests: {message}")]
    TooManyRequests {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("forbidden: {message}")]
    Forbidden { message: String },

    #[error("resource version expired: {message}")]
    Gone { message: String },

    #[error("cannot obtain credentials: {message}")]
    Unauthorized { message: String },

    #[error("API request rejected ({code}): {message}")]
    Permanent { code: u16, message: String },

    #[error("cannot reach API server: {message}")]
    Connect { message: String },
}

impl ApiError {
    /// Classify an HTTP status returned by the API server
    pub fn from_status(code: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match code {
            401 => Self::Unauthorized { message },
            403 => Self::Forbidden { message },
            404 => Self::NotFound { message },
            410 => Self::Gone { message },
            429 => Self::TooManyRequests {
                retry_after,
                message,
            },
            408 | 409 | 500..=599 => Self::Transient { code, message },
            _ => Self::Permanent { code, message },
        }
    }

    /// Classify an error surfaced by the kube client
    pub fn from_kube(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => Self::from_status(resp.code, resp.message, None),
            kube::Error::Auth(e) => Self::Unauthorized {
                message: e.to_string(),
            },
            // Connection resets, timeouts and body read failures
            kube::Error::HyperError(e) => Self::Transient {
                code: 0,
                message: e.to_string(),
            },
            kube::Error::Service(e) => Self::Transient {
                code: 0,
                message: e.to_string(),
            },
            kube::Error::ReadEvents(e) => Self::Transient {
                code: 0,
                message: e.to_string(),
            },
            other => Self::Permanent {
                code: 0,
                message: other.to_string(),
            },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient { .. } => ErrorClass::Transient,
            Self::TooManyRequests { .. } => ErrorClass::Throttled,
            Self::NotFound { .. } | Self::Forbidden { .. } | Self::Permanent { .. } => {
                ErrorClass::Permanent
            }
            Self::Gone { .. } => ErrorClass::Expired,
            Self::Unauthorized { .. } | Self::Connect { .. } => ErrorClass::Fatal,
        }
    }

    /// Server supplied delay before the request may be retried
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::TooManyRequests { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ApiError::from_status(404, "gone", None).class(), ErrorClass::Permanent);
        assert_eq!(ApiError::from_status(403, "no", None).class(), ErrorClass::Permanent);
        assert_eq!(ApiError::from_status(409, "conflict", None).class(), ErrorClass::Transient);
        assert_eq!(ApiError::from_status(503, "busy", None).class(), ErrorClass::Transient);
        assert_eq!(ApiError::from_status(504, "timeout", None).class(), ErrorClass::Transient);
        assert_eq!(ApiError::from_status(410, "expired", None).class(), ErrorClass::Expired);
        assert_eq!(ApiError::from_status(401, "who", None).class(), ErrorClass::Fatal);
        assert_eq!(ApiError::from_status(422, "invalid", None).class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_too_many_requests_keeps_retry_after() {
        let err = ApiError::from_status(429, "pdb", Some(Duration::from_secs(5)));
        assert_eq!(err.class(), ErrorClass::Throttled);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(ApiError::from_status(500, "x", None).retry_after(), None);
    }
}
