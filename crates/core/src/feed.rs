//! Feed source rows and their state machines.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operator intent for a feed. Orthogonal to [`FeedHealth`]: a disabled
/// feed keeps its last observed health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Enabled,
    Disabled,
    Draft,
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Draft => "draft",
        }
    }
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            "draft" => Ok(Self::Draft),
            other => Err(format!("unknown feed state: {other}")),
        }
    }
}

/// Derived health of a feed, recomputed after every finalized run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedHealth {
    Healthy,
    Warning,
    Failed,
}

impl FeedHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for FeedHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedHealth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "warning" => Ok(Self::Warning),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown feed health: {other}")),
        }
    }
}

/// Operator notifications emitted by run finalization and the failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedNotice {
    RunFailed,
    AutoDisabled,
    Recovery,
    Warning,
}

impl FeedNotice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunFailed => "run_failed",
            Self::AutoDisabled => "auto_disabled",
            Self::Recovery => "recovery",
            Self::Warning => "warning",
        }
    }
}

/// Row from the `feed_sources` table.
///
/// State and health are stored as text; use [`FeedSource::feed_state`] and
/// [`FeedSource::feed_health`] for the typed view. Rows are never deleted —
/// disabling (manual or automatic) is a state change.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FeedSource {
    pub id: Uuid,
    pub name: String,
    /// Declared format kind ("json", "csv"); empty means sniff per run.
    pub format: String,
    /// Where the payload comes from: a URL for HTTP feeds, a file-name
    /// prefix for push-file (drop directory) feeds.
    pub locator: String,
    /// Transport kind: "http" or "drop_dir".
    pub transport: String,
    pub state: String,
    pub health: String,
    pub schedule_interval_minutes: i32,
    pub consecutive_failures: i32,
    /// Digest of the last successfully processed payload.
    pub content_hash: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FeedSource {
    pub fn feed_state(&self) -> FeedState {
        self.state.parse().unwrap_or(FeedState::Disabled)
    }

    pub fn feed_health(&self) -> FeedHealth {
        self.health.parse().unwrap_or(FeedHealth::Healthy)
    }

    /// Whether the scheduler should consider this feed at all.
    pub fn is_schedulable(&self) -> bool {
        self.feed_state() == FeedState::Enabled
    }

    pub fn schedule_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.schedule_interval_minutes.max(1) as i64)
    }
}
