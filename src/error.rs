//! Error taxonomy (§7). Every fallible operation in the core returns a
//! `GatewayError`; the taxonomy (not the variant name) decides retry policy.

use thiserror::Error;

/// Broad retry-relevant classification, independent of the concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Auth,
    State,
    Conflict,
    Transient,
    Permanent,
    Cancelled,
    Internal,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    InvalidInput(String),

    #[error("team slug missing")]
    TeamSlugMissing,
    #[error("token missing")]
    TokenMissing,
    #[error("token invalid")]
    TokenInvalid,
    #[error("team not found")]
    TeamNotFound,
    #[error("token expired")]
    TokenExpired,
    #[error("authentication error")]
    AuthenticationError,

    #[error("illegal state transition from {from}")]
    InvalidState { from: String },
    #[error("partial amount not supported")]
    PartialNotSupported,

    #[error("failed to acquire payment lock within deadline")]
    LockTimeout,
    #[error("system overloaded, admission denied")]
    SystemOverload,
    #[error("per-tenant concurrency limit exceeded")]
    TeamLimitExceeded,

    #[error("payment not found")]
    NotFound,
    #[error("payment does not belong to requesting team")]
    AccessDenied,

    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        use GatewayError::*;
        match self {
            InvalidInput(_) => ErrorKind::Input,
            TeamSlugMissing | TokenMissing | TokenInvalid | TeamNotFound | TokenExpired
            | AuthenticationError => ErrorKind::Auth,
            InvalidState { .. } | PartialNotSupported => ErrorKind::State,
            LockTimeout | SystemOverload | TeamLimitExceeded => ErrorKind::Conflict,
            NotFound | AccessDenied => ErrorKind::Input,
            Transient(_) => ErrorKind::Transient,
            Permanent(_) => ErrorKind::Permanent,
            RateLimited { .. } => ErrorKind::Conflict,
            Cancelled => ErrorKind::Cancelled,
            Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable wire error code (§6). Never leaks internal detail.
    pub fn code(&self) -> &'static str {
        use GatewayError::*;
        match self {
            InvalidInput(_) => "INVALID_INPUT",
            TeamSlugMissing | TokenMissing | TokenInvalid | TeamNotFound | TokenExpired
            | AuthenticationError => "AUTHENTICATION_ERROR",
            InvalidState { .. } => "INVALID_STATE",
            PartialNotSupported => "PARTIAL_NOT_SUPPORTED",
            LockTimeout => "LOCK_TIMEOUT",
            SystemOverload => "SYSTEM_OVERLOAD",
            TeamLimitExceeded => "TEAM_LIMIT_EXCEEDED",
            NotFound => "NOT_FOUND",
            AccessDenied => "ACCESS_DENIED",
            Transient(_) => "INTERNAL_ERROR",
            Permanent(_) => "INTERNAL_ERROR",
            RateLimited { .. } => "RATE_LIMITED",
            Cancelled => "CANCELLED",
            Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_retryable_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_retryable_by_dispatcher(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Conflict)
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
