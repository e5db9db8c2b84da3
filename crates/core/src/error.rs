//! Shared error-code taxonomy.
//!
//! Every run-level or row-level failure carries one of these codes.
//! The codes are persisted as text (`last_error_code`, `primary_error_code`,
//! row error lists), so the string forms are part of the storage contract.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable error codes shared across run outcomes, row rejections, and
/// operator-facing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Transport-level fetch failure (connect, TLS, non-2xx, missing drop file).
    FetchError,
    /// Fetch exceeded its bounded timeout.
    TimeoutError,
    /// Row-level parse failure; never aborts a run on its own.
    ParseError,
    /// Feed owner is not eligible to run (billing/subscription); run is skipped.
    SubscriptionExpired,
    /// Per-feed advisory lock was held elsewhere; the attempt abandons.
    LockUnavailable,
    /// Quarantine action attempted against a record in the wrong state.
    StatusConflict,
    /// Malformed operator input (e.g. a dismiss note that is too short).
    ValidationError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchError => "FETCH_ERROR",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::ParseError => "PARSE_ERROR",
            Self::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            Self::LockUnavailable => "LOCK_UNAVAILABLE",
            Self::StatusConflict => "STATUS_CONFLICT",
            Self::ValidationError => "VALIDATION_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FETCH_ERROR" => Ok(Self::FetchError),
            "TIMEOUT_ERROR" => Ok(Self::TimeoutError),
            "PARSE_ERROR" => Ok(Self::ParseError),
            "SUBSCRIPTION_EXPIRED" => Ok(Self::SubscriptionExpired),
            "LOCK_UNAVAILABLE" => Ok(Self::LockUnavailable),
            "STATUS_CONFLICT" => Ok(Self::StatusConflict),
            "VALIDATION_ERROR" => Ok(Self::ValidationError),
            other => Err(format!("unknown error code: {other}")),
        }
    }
}
