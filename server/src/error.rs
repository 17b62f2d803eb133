//! Maps `EngineError` to the HTTP status/code/body table the CORE's error
//! design specifies. This is the only place in the binary that knows about
//! HTTP status codes for engine failures — handlers just propagate
//! `h5gate_core::Result` with `?`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use h5gate_core::error::EngineError;
use serde_json::json;

pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Forbidden(_) => StatusCode::BAD_REQUEST,
            EngineError::BadSelection(_) => StatusCode::BAD_REQUEST,
            EngineError::UnsupportedElementType(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::RangeTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            EngineError::OutOfRange(_) => StatusCode::BAD_REQUEST,
            EngineError::CorruptContainer(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Stale => StatusCode::CONFLICT,
            EngineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            // 499 is not a registered status; axum's StatusCode::from_u16
            // accepts any value in the valid range so the non-standard
            // nginx convention for client-disconnect still round-trips.
            EngineError::Cancelled => StatusCode::from_u16(499).unwrap(),
        };
        let body = Json(json!({
            "success": false,
            "error": self.0.to_string(),
            "code": self.0.code(),
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
