//! Error types for gatehouse
//!
//! One enum covers the whole taxonomy: per-request rejections (carry an HTTP
//! status), configuration errors, capacity timeouts, execution failures, and
//! fatal conditions that a supervising layer should translate into process
//! termination.

use std::time::Duration;

use hyper::StatusCode;

/// Main error type for gatehouse operations
#[derive(Debug, thiserror::Error)]
pub enum GatehouseError {
    /// The request path contains a NUL byte.
    #[error("invalid request path")]
    InvalidRequestPath,

    /// The Content-Length header is not a non-negative integer.
    /// Embeds the literal offending header value.
    #[error("invalid content-length header: {0:?}")]
    InvalidContentLength(String),

    /// A caller-classified rejection with an explicit status code.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    /// No worker pool matches the requested name or path.
    #[error("no worker pool named {0:?}")]
    UnknownWorker(String),

    /// No execution thread became free within the configured wait window.
    #[error("no free thread in worker pool {worker:?} after {waited:?}")]
    DispatchTimeout { worker: String, waited: Duration },

    #[error("configuration error: {0}")]
    Config(String),

    /// Unrecoverable condition. The process should be terminated by whoever
    /// observes this; gatehouse itself never aborts.
    #[error("fatal: {0}")]
    Fatal(String),

    /// A single script execution ended in an error.
    #[error("execution error: {0}")]
    Execution(String),

    /// A per-thread script handler could not be constructed.
    #[error("handler error: {0}")]
    Handler(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatehouseError {
    /// Status code written to the caller for rejection-class errors.
    /// `None` means the error does not classify as a rejection and must not
    /// be passed to `RequestContext::reject`.
    pub fn rejection_status(&self) -> Option<StatusCode> {
        match self {
            Self::InvalidRequestPath => Some(StatusCode::BAD_REQUEST),
            Self::InvalidContentLength(_) => Some(StatusCode::BAD_REQUEST),
            Self::Rejected { status, .. } => {
                Some(StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
            }
            Self::UnknownWorker(_) => Some(StatusCode::NOT_FOUND),
            Self::DispatchTimeout { .. } => Some(StatusCode::GATEWAY_TIMEOUT),
            _ => None,
        }
    }

    /// Whether this error terminates a single request early (validation
    /// rejection, caller-classified rejection, or capacity timeout).
    pub fn is_rejection(&self) -> bool {
        self.rejection_status().is_some()
    }

    /// Whether this is the capacity/overload class, distinct from bad input.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::DispatchTimeout { .. })
    }

    /// Whether this error should be escalated to process termination.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequestPath
            | Self::InvalidContentLength(_)
            | Self::Rejected { .. }
            | Self::UnknownWorker(_)
            | Self::DispatchTimeout { .. } => {
                self.rejection_status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::Execution(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Fatal(_) | Self::Handler(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<std::io::Error> for GatehouseError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Result type alias for gatehouse operations
pub type Result<T> = std::result::Result<T, GatehouseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        assert!(GatehouseError::InvalidRequestPath.is_rejection());
        assert!(GatehouseError::InvalidContentLength("abc".into()).is_rejection());
        assert!(!GatehouseError::Execution("boom".into()).is_rejection());
        assert!(!GatehouseError::Fatal("boom".into()).is_rejection());
    }

    #[test]
    fn test_timeout_is_distinct_from_validation() {
        let timeout = GatehouseError::DispatchTimeout {
            worker: "echo".into(),
            waited: Duration::from_millis(50),
        };
        assert!(timeout.is_rejection());
        assert!(timeout.is_timeout());
        assert!(!GatehouseError::InvalidRequestPath.is_timeout());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(GatehouseError::Fatal("out of threads".into()).is_fatal());
        assert!(!GatehouseError::Config("bad".into()).is_fatal());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatehouseError::InvalidRequestPath.status_code(),
            StatusCode::BAD_REQUEST
        );
        let rejected = GatehouseError::Rejected {
            status: 403,
            message: "nope".into(),
        };
        assert_eq!(rejected.status_code(), StatusCode::FORBIDDEN);
        let timeout = GatehouseError::DispatchTimeout {
            worker: "echo".into(),
            waited: Duration::from_secs(1),
        };
        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_content_length_error_embeds_raw_value() {
        let err = GatehouseError::InvalidContentLength("-42".into());
        assert!(err.to_string().contains("\"-42\""));
    }
}
