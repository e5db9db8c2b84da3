//! Alert target slots — one per (subscription, rule kind).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alert rule kinds. Cooldowns are tracked independently per kind on
/// the same subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    PriceDrop,
    BackInStock,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PriceDrop => "price_drop",
            Self::BackInStock => "back_in_stock",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "price_drop" => Ok(Self::PriceDrop),
            "back_in_stock" => Ok(Self::BackInStock),
            other => Err(format!("unknown rule kind: {other}")),
        }
    }
}

/// Row from the `alert_targets` table.
///
/// The claim fields are owned exclusively by whichever key currently
/// holds them; they are only ever mutated through the claim protocol's
/// conditional writes.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AlertTarget {
    pub subscription_id: Uuid,
    pub rule: String,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub claim_key: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl AlertTarget {
    pub fn rule_kind(&self) -> Option<RuleKind> {
        self.rule.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_kind_roundtrip() {
        for r in [RuleKind::PriceDrop, RuleKind::BackInStock] {
            assert_eq!(r.as_str().parse::<RuleKind>().unwrap(), r);
        }
    }
}
