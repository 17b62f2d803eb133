//! Unified error type for the data-access engine.
//!
//! Every fallible operation in `h5gate-core` returns `Result<T, EngineError>`.
//! The HTTP layer maps each variant to the status/code table below — see
//! `h5gate-server`'s `error` module for the `IntoResponse` impl.

use thiserror::Error;

/// A single error kind covering every failure mode a request can hit.
///
/// Each variant corresponds to one row of the error table in the
/// error table: kind, HTTP status, and client-retryability are fixed per
/// variant and never mixed across layers.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad selection: {0}")]
    BadSelection(String),

    #[error("unsupported element type: {0}")]
    UnsupportedElementType(String),

    #[error("range too large: {0}")]
    RangeTooLarge(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("corrupt container: {0}")]
    CorruptContainer(String),

    #[error("stale: freshness token changed mid-read")]
    Stale,

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("busy: concurrency limit reached")]
    Busy,

    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Stable machine-readable code, matching the error table's Kind column.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Forbidden(_) => "FORBIDDEN",
            EngineError::BadSelection(_) => "BAD_SELECTION",
            EngineError::UnsupportedElementType(_) => "UNSUPPORTED_ELEMENT_TYPE",
            EngineError::RangeTooLarge(_) => "RANGE_TOO_LARGE",
            EngineError::OutOfRange(_) => "OUT_OF_RANGE",
            EngineError::CorruptContainer(_) => "CORRUPT_CONTAINER",
            EngineError::Stale => "STALE",
            EngineError::Unavailable(_) => "UNAVAILABLE",
            EngineError::Busy => "BUSY",
            EngineError::Cancelled => "CANCELLED",
        }
    }

    /// Whether a client may usefully retry this exact request.
    pub fn retryable(&self) -> bool {
        matches!(self, EngineError::Stale | EngineError::Unavailable(_) | EngineError::Busy)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
