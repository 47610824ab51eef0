//! The wire-facing error taxonomy (§6, §7).
//!
//! Every internal error type in every other crate converts into an
//! [`ErrorKind`] at its boundary with the Session Router; the Router is the
//! only place that builds an [`ErrorEnvelope`] and puts it on the wire, so
//! internals never leak past this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuthRequired,
    AuthInvalid,
    AuthForbidden,
    TooManyConnections,
    RaceNotFound,
    RaceFull,
    RaceStarted,
    RaceFinished,
    NotInRace,
    TestNotFound,
    TestExpired,
    TestCompleted,
    NoWordlistsAvailable,
    RateLimited,
    ValidationError,
    SlowConsumer,
    ServerError,
}

impl ErrorKind {
    /// Numeric code per §6's error code table. Kinds the distilled table
    /// didn't enumerate (e.g. `TooManyConnections`) are assigned the next
    /// free slot in their family so the taxonomy stays dense.
    pub const fn code(self) -> u32 {
        match self {
            ErrorKind::AuthRequired => 1001,
            ErrorKind::AuthInvalid => 1002,
            ErrorKind::AuthForbidden => 1003,
            ErrorKind::TooManyConnections => 1004,
            ErrorKind::RaceNotFound => 2001,
            ErrorKind::RaceFull => 2002,
            ErrorKind::RaceStarted => 2003,
            ErrorKind::RaceFinished => 2004,
            ErrorKind::NotInRace => 2005,
            ErrorKind::TestNotFound => 3001,
            ErrorKind::TestExpired => 3002,
            ErrorKind::TestCompleted => 3003,
            ErrorKind::NoWordlistsAvailable => 3004,
            ErrorKind::RateLimited => 4001,
            ErrorKind::ValidationError => 4002,
            ErrorKind::ServerError => 5001,
            ErrorKind::SlowConsumer => 5002,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AuthRequired => "AUTH_REQUIRED",
            ErrorKind::AuthInvalid => "AUTH_INVALID",
            ErrorKind::AuthForbidden => "AUTH_FORBIDDEN",
            ErrorKind::TooManyConnections => "TOO_MANY_CONNECTIONS",
            ErrorKind::RaceNotFound => "RACE_NOT_FOUND",
            ErrorKind::RaceFull => "RACE_FULL",
            ErrorKind::RaceStarted => "RACE_STARTED",
            ErrorKind::RaceFinished => "RACE_FINISHED",
            ErrorKind::NotInRace => "NOT_IN_RACE",
            ErrorKind::TestNotFound => "TEST_NOT_FOUND",
            ErrorKind::TestExpired => "TEST_EXPIRED",
            ErrorKind::TestCompleted => "TEST_COMPLETED",
            ErrorKind::NoWordlistsAvailable => "NO_WORDLISTS_AVAILABLE",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::SlowConsumer => "SLOW_CONSUMER",
            ErrorKind::ServerError => "SERVER_ERROR",
        }
    }
}

/// A user-safe error, ready to be wrapped in an [`ErrorEnvelope`] and sent
/// on the originating connection. Validation/quota errors and domain errors
/// never change engine state (§7); this type carries no state of its own.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self::new(ErrorKind::RateLimited, "rate limit exceeded")
            .with_details(serde_json::json!({ "retryAfterMs": retry_after_ms }))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u32,
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "type")]
    pub kind_tag: String,
    pub payload: ErrorPayload,
}

impl From<CoreError> for ErrorEnvelope {
    fn from(err: CoreError) -> Self {
        Self {
            kind_tag: "error".to_string(),
            payload: ErrorPayload {
                code: err.kind.code(),
                kind: err.kind.as_str().to_string(),
                message: err.message,
                details: err.details,
                timestamp: Utc::now(),
            },
        }
    }
}
