use reqwest::StatusCode;
use serde::Deserialize;

use crate::firestore::error::{FirestoreError, FirestoreErrorCode};

#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    error: Option<GoogleError>,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Maps a failed REST response to a `FirestoreError`. The canonical status
/// in the error payload wins over the HTTP status.
pub fn map_http_error(status: StatusCode, body: &str) -> FirestoreError {
    let payload = extract_error_payload(body);
    let message = payload
        .as_ref()
        .and_then(|payload| payload.message.clone())
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("HTTP error").to_string());

    if let Some(status_string) = payload.as_ref().and_then(|payload| payload.status.as_deref()) {
        let code = FirestoreErrorCode::from_status_str(status_string);
        if code != FirestoreErrorCode::Unknown || status_string == "UNKNOWN" {
            return FirestoreError::new(code, message);
        }
    }

    FirestoreError::new(code_for_http_status(status), message)
}

/// Maps a gRPC status carried inside a stream message.
pub fn map_grpc_status(code: i32, message: Option<String>) -> FirestoreError {
    FirestoreError::new(
        FirestoreErrorCode::from_grpc(code),
        message.unwrap_or_else(|| "stream error".to_string()),
    )
}

/// HTTP to canonical code mapping used by the REST gateway.
fn code_for_http_status(status: StatusCode) -> FirestoreErrorCode {
    match status.as_u16() {
        200 => FirestoreErrorCode::Ok,
        400 => FirestoreErrorCode::InvalidArgument,
        401 => FirestoreErrorCode::Unauthenticated,
        403 => FirestoreErrorCode::PermissionDenied,
        404 => FirestoreErrorCode::NotFound,
        408 | 504 => FirestoreErrorCode::DeadlineExceeded,
        409 => FirestoreErrorCode::Aborted,
        412 => FirestoreErrorCode::FailedPrecondition,
        416 => FirestoreErrorCode::OutOfRange,
        429 => FirestoreErrorCode::ResourceExhausted,
        499 => FirestoreErrorCode::Cancelled,
        501 => FirestoreErrorCode::Unimplemented,
        502 | 503 => FirestoreErrorCode::Unavailable,
        500 => FirestoreErrorCode::Internal,
        code if (400..500).contains(&code) => FirestoreErrorCode::FailedPrecondition,
        code if (500..600).contains(&code) => FirestoreErrorCode::Internal,
        _ => FirestoreErrorCode::Unknown,
    }
}

fn extract_error_payload(body: &str) -> Option<GoogleError> {
    serde_json::from_str::<GoogleErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error)
}
