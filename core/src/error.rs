//! Controller-wide error taxonomy.
//!
//! Mirrors the error kinds in the design: setup, submission, host-bridge,
//! processing, and cache-refresh failures each get their own variant so
//! task boundaries can decide what to persist as `failureReason` without
//! string-matching.

use thiserror::Error;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Prerequisites to submission are missing: unknown user, invalid home
    /// directory, missing job-script template.
    #[error("setup error: {0}")]
    Setup(String),

    /// The scheduler refused a job, or zero permutations landed.
    #[error("submission error: {0}")]
    Submission(String),

    /// Host-bridge exit code -1 or missing result file.
    #[error("host bridge error: {0}")]
    HostBridge(String),

    /// Any failure inside a per-benchmark processing loop.
    #[error("processing error: {0}")]
    Processing(String),

    /// A scheduler or time-series cache refresh failed; the stale cache is
    /// still returned to the caller, this variant exists for logging.
    #[error("cache refresh failed: {0}")]
    CacheRefresh(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("document store error: {0}")]
    DocumentStore(#[from] mongodb::error::Error),

    #[error("time-series store error: {0}")]
    TimeSeries(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Maps a [`ControllerError`] onto the RPC status codes named in the
/// external-interfaces contract: scheduler/store failures become
/// `INTERNAL`, unknown entities become `NOT_FOUND`, malformed requests
/// become `INVALID_ARGUMENT`.
impl From<ControllerError> for tonic::Status {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::NotFound(msg) => tonic::Status::not_found(msg),
            ControllerError::InvalidArgument(msg) => tonic::Status::invalid_argument(msg),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_not_found_status() {
        let err = ControllerError::NotFound("user".into());
        assert!(err.is_not_found());
        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn setup_error_maps_to_internal_status() {
        let status: tonic::Status = ControllerError::Setup("missing home dir".into()).into();
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
