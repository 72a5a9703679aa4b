use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("Partition unavailable: {0}")]
    PartitionUnavailable(String),

    #[error("Partition recovery failed: {0}")]
    PartitionRecoveryFailed(String),

    #[error("Partition is busy: {0}")]
    Busy(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Workspace {0} is not initialized")]
    WorkspaceNotInitialized(u64),

    #[error("Workspace {0} is inactive")]
    WorkspaceInactive(u64),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Record ID conflict: {0}")]
    RecordIdConflict(String),

    #[error("Referential integrity violation: {0}")]
    ReferentialIntegrityViolation(String),

    #[error("Extension execution fault: {0}")]
    ExtensionExecutionFault(String),

    #[error("Invalid intents: {0}")]
    InvalidIntents(String),

    #[error("Projection failed: {0}")]
    ProjectionFailed(String),

    #[error("Fatal append failure: {0}")]
    FatalAppendFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ProcessorError>;

impl<T> From<std::sync::PoisonError<T>> for ProcessorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<std::io::Error> for ProcessorError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Client-visible classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Gone,
    TooManyRequests,
    ClientClosedRequest,
    InternalServerError,
    ServiceUnavailable,
}

impl StatusClass {
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Gone => StatusCode::GONE,
            Self::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            // nginx convention, not in the registry
            Self::ClientClosedRequest => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            }
            Self::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl ProcessorError {
    pub fn status_class(&self) -> StatusClass {
        match self {
            Self::PartitionUnavailable(_) | Self::PartitionRecoveryFailed(_) | Self::Busy(_) => {
                StatusClass::ServiceUnavailable
            }
            Self::Cancelled(_) => StatusClass::ClientClosedRequest,
            Self::WorkspaceNotInitialized(_) => StatusClass::Forbidden,
            Self::WorkspaceInactive(_) => StatusClass::Gone,
            Self::RateLimitExceeded(_) => StatusClass::TooManyRequests,
            Self::AuthenticationFailed(_) => StatusClass::Unauthorized,
            Self::AuthorizationDenied(_) => StatusClass::Forbidden,
            Self::MalformedRequest(_) | Self::ReferentialIntegrityViolation(_) => {
                StatusClass::BadRequest
            }
            Self::RecordNotFound(_) => StatusClass::NotFound,
            Self::RecordIdConflict(_) => StatusClass::Conflict,
            Self::ExtensionExecutionFault(_)
            | Self::InvalidIntents(_)
            | Self::ProjectionFailed(_)
            | Self::FatalAppendFailure(_)
            | Self::Config(_)
            | Self::Storage(_)
            | Self::Lock(_)
            | Self::Io(_)
            | Self::Internal(_) => StatusClass::InternalServerError,
        }
    }

    /// Whether the caller may resend the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PartitionUnavailable(_)
                | Self::PartitionRecoveryFailed(_)
                | Self::Busy(_)
                | Self::RateLimitExceeded(_)
        )
    }
}
