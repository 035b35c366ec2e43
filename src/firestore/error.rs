use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::platform::token::TokenError;

/// Error codes surfaced by the client. Mirrors the canonical gRPC status codes
/// plus client-side configuration failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirestoreErrorCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    MissingProjectId,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::Ok => "firestore/ok",
            FirestoreErrorCode::Cancelled => "firestore/cancelled",
            FirestoreErrorCode::Unknown => "firestore/unknown",
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::AlreadyExists => "firestore/already-exists",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::OutOfRange => "firestore/out-of-range",
            FirestoreErrorCode::Unimplemented => "firestore/unimplemented",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
            FirestoreErrorCode::MissingProjectId => "firestore/missing-project-id",
        }
    }

    /// Maps a numeric gRPC status code. Unrecognised values map to `Unknown`.
    pub fn from_grpc(code: i32) -> Self {
        match code {
            0 => FirestoreErrorCode::Ok,
            1 => FirestoreErrorCode::Cancelled,
            2 => FirestoreErrorCode::Unknown,
            3 => FirestoreErrorCode::InvalidArgument,
            4 => FirestoreErrorCode::DeadlineExceeded,
            5 => FirestoreErrorCode::NotFound,
            6 => FirestoreErrorCode::AlreadyExists,
            7 => FirestoreErrorCode::PermissionDenied,
            8 => FirestoreErrorCode::ResourceExhausted,
            9 => FirestoreErrorCode::FailedPrecondition,
            10 => FirestoreErrorCode::Aborted,
            11 => FirestoreErrorCode::OutOfRange,
            12 => FirestoreErrorCode::Unimplemented,
            13 => FirestoreErrorCode::Internal,
            14 => FirestoreErrorCode::Unavailable,
            15 => FirestoreErrorCode::DataLoss,
            16 => FirestoreErrorCode::Unauthenticated,
            _ => FirestoreErrorCode::Unknown,
        }
    }

    /// Maps the upper-case status names used by the REST API (`"NOT_FOUND"`).
    pub fn from_status_str(status: &str) -> Self {
        match status {
            "OK" => FirestoreErrorCode::Ok,
            "CANCELLED" => FirestoreErrorCode::Cancelled,
            "INVALID_ARGUMENT" => FirestoreErrorCode::InvalidArgument,
            "DEADLINE_EXCEEDED" => FirestoreErrorCode::DeadlineExceeded,
            "NOT_FOUND" => FirestoreErrorCode::NotFound,
            "ALREADY_EXISTS" => FirestoreErrorCode::AlreadyExists,
            "PERMISSION_DENIED" => FirestoreErrorCode::PermissionDenied,
            "UNAUTHENTICATED" => FirestoreErrorCode::Unauthenticated,
            "RESOURCE_EXHAUSTED" => FirestoreErrorCode::ResourceExhausted,
            "FAILED_PRECONDITION" => FirestoreErrorCode::FailedPrecondition,
            "ABORTED" => FirestoreErrorCode::Aborted,
            "OUT_OF_RANGE" => FirestoreErrorCode::OutOfRange,
            "UNIMPLEMENTED" => FirestoreErrorCode::Unimplemented,
            "INTERNAL" => FirestoreErrorCode::Internal,
            "UNAVAILABLE" => FirestoreErrorCode::Unavailable,
            "DATA_LOSS" => FirestoreErrorCode::DataLoss,
            _ => FirestoreErrorCode::Unknown,
        }
    }
}

/// Returns whether an error with `code` should not be retried.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    !matches!(
        code,
        FirestoreErrorCode::Ok
            | FirestoreErrorCode::Cancelled
            | FirestoreErrorCode::Unknown
            | FirestoreErrorCode::DeadlineExceeded
            | FirestoreErrorCode::ResourceExhausted
            | FirestoreErrorCode::Internal
            | FirestoreErrorCode::Unavailable
            | FirestoreErrorCode::Unauthenticated
    )
}

/// Like [`is_permanent_error`], but `Aborted` writes are retried.
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    is_permanent_error(code) && code != FirestoreErrorCode::Aborted
}

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
    local_storage: bool,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            local_storage: false,
        }
    }

    /// Error raised by a failed local persistence transaction. The sync engine
    /// logs and recovers from these instead of failing listeners.
    pub fn local_storage(message: impl Into<String>) -> Self {
        Self {
            code: FirestoreErrorCode::Internal,
            message: message.into(),
            local_storage: true,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_local_storage_failure(&self) -> bool {
        self.local_storage
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

impl From<TokenError> for FirestoreError {
    fn from(err: TokenError) -> Self {
        unauthenticated(format!("failed to fetch token: {err}"))
    }
}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn missing_project_id() -> FirestoreError {
    FirestoreError::new(
        FirestoreErrorCode::MissingProjectId,
        "Firebase options must include a project_id to use Firestore",
    )
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DeadlineExceeded, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}

pub fn aborted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Aborted, message)
}

pub fn already_exists(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::AlreadyExists, message)
}

pub fn unimplemented(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unimplemented, message)
}
