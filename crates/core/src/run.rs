//! Feed run rows — one execution attempt per row, finalized exactly once.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound on the per-run error list; later errors are counted but
/// not stored.
pub const MAX_RUN_ERRORS: usize = 50;

/// What caused a run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown trigger kind: {other}")),
        }
    }
}

/// Run status. Monotonic: once a run leaves Pending/Running it is
/// terminal and must never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Warning,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Warning => "warning",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "warning" => Ok(Self::Warning),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One recorded row-level (or run-level) error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRowError {
    /// Row index within the parsed payload; `None` for run-level errors.
    pub row_index: Option<u32>,
    pub code: String,
    pub message: String,
}

/// Row from the `feed_runs` table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FeedRun {
    pub id: Uuid,
    pub feed_id: Uuid,
    pub trigger: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub row_count: i32,
    pub indexed_count: i32,
    pub quarantined_count: i32,
    pub rejected_count: i32,
    pub primary_error_code: Option<String>,
    /// JSONB array of [`RunRowError`], bounded by [`MAX_RUN_ERRORS`].
    pub errors: serde_json::Value,
}

impl FeedRun {
    pub fn run_status(&self) -> RunStatus {
        self.status.parse().unwrap_or(RunStatus::Failed)
    }

    pub fn error_list(&self) -> Vec<RunRowError> {
        serde_json::from_value(self.errors.clone()).unwrap_or_default()
    }
}

/// Truncate an error list to the stored bound.
pub fn bound_errors(mut errors: Vec<RunRowError>) -> Vec<RunRowError> {
    errors.truncate(MAX_RUN_ERRORS);
    errors
}
