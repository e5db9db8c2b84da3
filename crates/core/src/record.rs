//! Indexable and quarantined record rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A parsed row with strong product identity, keyed by content hash of
/// (title, identifier, sku, price). Upserted per run; `is_active` is
/// cleared for rows the latest successful run of the feed did not touch.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IndexableRecord {
    pub id: Uuid,
    pub feed_id: Uuid,
    pub record_key: String,
    pub title: String,
    pub identifier: Option<String>,
    pub sku: Option<String>,
    pub price_cents: i64,
    pub currency: Option<String>,
    /// Original row payload as received from the connector.
    pub raw: serde_json::Value,
    pub is_active: bool,
    pub created_by_run_id: Uuid,
    pub last_updated_by_run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Quarantine lifecycle. Quarantined is the only non-terminal state;
/// Resolved and Dismissed are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineStatus {
    Quarantined,
    Resolved,
    Dismissed,
}

impl QuarantineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quarantined => "quarantined",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Quarantined)
    }
}

impl fmt::Display for QuarantineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuarantineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quarantined" => Ok(Self::Quarantined),
            "resolved" => Ok(Self::Resolved),
            "dismissed" => Ok(Self::Dismissed),
            other => Err(format!("unknown quarantine status: {other}")),
        }
    }
}

/// A parsed row with weak identity, held for manual triage. Keyed by
/// (feed_id, match_key); re-ingestion refreshes the payload and errors
/// but never moves a terminal status.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct QuarantinedRecord {
    pub id: Uuid,
    pub feed_id: Uuid,
    pub match_key: String,
    pub status: String,
    pub title: Option<String>,
    pub sku: Option<String>,
    pub price_cents: Option<i64>,
    pub raw: serde_json::Value,
    /// JSONB array of blocking errors (same shape as run row errors).
    pub blocking_errors: serde_json::Value,
    pub last_seen_run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuarantinedRecord {
    pub fn quarantine_status(&self) -> QuarantineStatus {
        self.status.parse().unwrap_or(QuarantineStatus::Quarantined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_quarantined_is_non_terminal() {
        assert!(!QuarantineStatus::Quarantined.is_terminal());
        assert!(QuarantineStatus::Resolved.is_terminal());
        assert!(QuarantineStatus::Dismissed.is_terminal());
    }
}
