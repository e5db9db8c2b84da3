//! The alert claim protocol.
//!
//! Sending a notification cannot happen inside a database transaction,
//! so exactly-once-per-cooldown is enforced with a two-phase claim: a
//! worker atomically claims the (subscription, rule) slot, sends with
//! no lock held, then commits the claim (advancing the cooldown clock)
//! or releases it on failure. A claim older than the stale threshold
//! belongs to a crashed holder and may be taken over.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use feedmill_core::{AlertTarget, RuleKind};

use crate::error::AlertError;

/// Outcome of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This key now holds the slot and must commit or release it.
    Claimed,
    /// The last committed notification is within the cooldown window.
    InCooldown,
    /// Another key holds a live (non-stale) claim on the slot.
    AlreadyClaimed,
}

/// Persistence for alert slots. Every method is a single conditional
/// write; the caller never holds a lock across `claim` and `commit`.
#[async_trait]
pub trait AlertSlotStore: Send + Sync {
    /// Attempt to claim the (subscription, rule) slot with `key`.
    ///
    /// Succeeds only when the slot is outside its cooldown window and
    /// carries no live claim. A slot that has never notified is always
    /// outside cooldown. Creates the slot row on first contact.
    async fn claim(
        &self,
        subscription_id: Uuid,
        rule: RuleKind,
        key: Uuid,
        now: DateTime<Utc>,
        cooldown: Duration,
        stale_threshold: Duration,
    ) -> Result<ClaimOutcome, AlertError>;

    /// Commit a held claim: advance `last_notified_at` and clear the
    /// claim. Conditioned on `key` still holding the slot; returns
    /// `false` (and changes nothing) when it does not.
    async fn commit(
        &self,
        subscription_id: Uuid,
        rule: RuleKind,
        key: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AlertError>;

    /// Release a held claim without advancing the cooldown clock.
    /// Conditioned on `key`; a mismatched key is a no-op.
    async fn release(
        &self,
        subscription_id: Uuid,
        rule: RuleKind,
        key: Uuid,
    ) -> Result<bool, AlertError>;

    async fn get_slot(
        &self,
        subscription_id: Uuid,
        rule: RuleKind,
    ) -> Result<Option<AlertTarget>, AlertError>;
}

// ── In-memory backend ─────────────────────────────────────────

/// Mutex-backed slot store with the same conditional semantics as the
/// Postgres store. Used by tests and local development.
#[derive(Default)]
pub struct MemorySlotStore {
    slots: Mutex<HashMap<(Uuid, String), AlertTarget>>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertSlotStore for MemorySlotStore {
    async fn claim(
        &self,
        subscription_id: Uuid,
        rule: RuleKind,
        key: Uuid,
        now: DateTime<Utc>,
        cooldown: Duration,
        stale_threshold: Duration,
    ) -> Result<ClaimOutcome, AlertError> {
        let mut slots = self.slots.lock().expect("slot mutex poisoned");
        let slot = slots
            .entry((subscription_id, rule.as_str().to_string()))
            .or_insert_with(|| AlertTarget {
                subscription_id,
                rule: rule.as_str().to_string(),
                last_notified_at: None,
                claim_key: None,
                claimed_at: None,
            });

        if let Some(notified) = slot.last_notified_at {
            if now - notified < cooldown {
                return Ok(ClaimOutcome::InCooldown);
            }
        }
        if slot.claim_key.is_some() {
            let live = slot
                .claimed_at
                .is_some_and(|at| now - at < stale_threshold);
            if live {
                return Ok(ClaimOutcome::AlreadyClaimed);
            }
            // Stale claim from a crashed holder; taken over below.
        }

        slot.claim_key = Some(key);
        slot.claimed_at = Some(now);
        Ok(ClaimOutcome::Claimed)
    }

    async fn commit(
        &self,
        subscription_id: Uuid,
        rule: RuleKind,
        key: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AlertError> {
        let mut slots = self.slots.lock().expect("slot mutex poisoned");
        let Some(slot) = slots.get_mut(&(subscription_id, rule.as_str().to_string())) else {
            return Ok(false);
        };
        if slot.claim_key != Some(key) {
            return Ok(false);
        }
        slot.last_notified_at = Some(now);
        slot.claim_key = None;
        slot.claimed_at = None;
        Ok(true)
    }

    async fn release(
        &self,
        subscription_id: Uuid,
        rule: RuleKind,
        key: Uuid,
    ) -> Result<bool, AlertError> {
        let mut slots = self.slots.lock().expect("slot mutex poisoned");
        let Some(slot) = slots.get_mut(&(subscription_id, rule.as_str().to_string())) else {
            return Ok(false);
        };
        if slot.claim_key != Some(key) {
            return Ok(false);
        }
        slot.claim_key = None;
        slot.claimed_at = None;
        Ok(true)
    }

    async fn get_slot(
        &self,
        subscription_id: Uuid,
        rule: RuleKind,
    ) -> Result<Option<AlertTarget>, AlertError> {
        let slots = self.slots.lock().expect("slot mutex poisoned");
        Ok(slots
            .get(&(subscription_id, rule.as_str().to_string()))
            .cloned())
    }
}

// ── Postgres backend ──────────────────────────────────────────

pub struct PgSlotStore {
    pool: PgPool,
}

impl PgSlotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertSlotStore for PgSlotStore {
    async fn claim(
        &self,
        subscription_id: Uuid,
        rule: RuleKind,
        key: Uuid,
        now: DateTime<Utc>,
        cooldown: Duration,
        stale_threshold: Duration,
    ) -> Result<ClaimOutcome, AlertError> {
        let cooldown_cutoff = now - cooldown;
        let stale_cutoff = now - stale_threshold;

        // One conditional write: insert the slot on first contact, or
        // take the claim when the slot is outside cooldown and carries
        // no live claim.
        let result = sqlx::query(
            r#"
            INSERT INTO alert_targets (subscription_id, rule, claim_key, claimed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (subscription_id, rule) DO UPDATE
            SET claim_key = $3, claimed_at = $4
            WHERE (alert_targets.last_notified_at IS NULL
                   OR alert_targets.last_notified_at <= $5)
              AND (alert_targets.claim_key IS NULL
                   OR alert_targets.claimed_at <= $6)
            "#,
        )
        .bind(subscription_id)
        .bind(rule.as_str())
        .bind(key)
        .bind(now)
        .bind(cooldown_cutoff)
        .bind(stale_cutoff)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(ClaimOutcome::Claimed);
        }

        // The write was refused; read the slot to say why. The answer
        // is advisory either way — only the claim itself is load-bearing.
        let slot = self.get_slot(subscription_id, rule).await?;
        match slot {
            Some(s)
                if s.last_notified_at
                    .is_some_and(|at| now - at < cooldown) =>
            {
                Ok(ClaimOutcome::InCooldown)
            }
            _ => Ok(ClaimOutcome::AlreadyClaimed),
        }
    }

    async fn commit(
        &self,
        subscription_id: Uuid,
        rule: RuleKind,
        key: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AlertError> {
        let result = sqlx::query(
            r#"
            UPDATE alert_targets
            SET last_notified_at = $4, claim_key = NULL, claimed_at = NULL
            WHERE subscription_id = $1 AND rule = $2 AND claim_key = $3
            "#,
        )
        .bind(subscription_id)
        .bind(rule.as_str())
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(
        &self,
        subscription_id: Uuid,
        rule: RuleKind,
        key: Uuid,
    ) -> Result<bool, AlertError> {
        let result = sqlx::query(
            r#"
            UPDATE alert_targets
            SET claim_key = NULL, claimed_at = NULL
            WHERE subscription_id = $1 AND rule = $2 AND claim_key = $3
            "#,
        )
        .bind(subscription_id)
        .bind(rule.as_str())
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_slot(
        &self,
        subscription_id: Uuid,
        rule: RuleKind,
    ) -> Result<Option<AlertTarget>, AlertError> {
        let slot = sqlx::query_as::<_, AlertTarget>(
            r#"
            SELECT subscription_id, rule, last_notified_at, claim_key, claimed_at
            FROM alert_targets
            WHERE subscription_id = $1 AND rule = $2
            "#,
        )
        .bind(subscription_id)
        .bind(rule.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const COOLDOWN: Duration = Duration::days(7);
    const STALE: Duration = Duration::minutes(5);

    async fn claim(
        store: &MemorySlotStore,
        sub: Uuid,
        key: Uuid,
        now: DateTime<Utc>,
    ) -> ClaimOutcome {
        store
            .claim(sub, RuleKind::PriceDrop, key, now, COOLDOWN, STALE)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_claim_on_a_fresh_slot_succeeds() {
        let store = MemorySlotStore::new();
        let sub = Uuid::new_v4();
        let outcome = claim(&store, sub, Uuid::new_v4(), Utc::now()).await;
        assert_eq!(outcome, ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn concurrent_claims_yield_exactly_one_winner() {
        let store = Arc::new(MemorySlotStore::new());
        let sub = Uuid::new_v4();
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim(sub, RuleKind::PriceDrop, Uuid::new_v4(), now, COOLDOWN, STALE)
                    .await
                    .unwrap()
            }));
        }

        let mut claimed = 0;
        let mut already = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ClaimOutcome::Claimed => claimed += 1,
                ClaimOutcome::AlreadyClaimed => already += 1,
                ClaimOutcome::InCooldown => panic!("no notification has been committed"),
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(already, 7);
    }

    #[tokio::test]
    async fn committed_claim_starts_the_cooldown() {
        let store = MemorySlotStore::new();
        let sub = Uuid::new_v4();
        let key = Uuid::new_v4();
        let t0 = Utc::now();

        assert_eq!(claim(&store, sub, key, t0).await, ClaimOutcome::Claimed);
        assert!(store.commit(sub, RuleKind::PriceDrop, key, t0).await.unwrap());

        // Inside the window, even right at the edge.
        let inside = t0 + COOLDOWN - Duration::seconds(1);
        assert_eq!(
            claim(&store, sub, Uuid::new_v4(), inside).await,
            ClaimOutcome::InCooldown
        );

        // One past the window, claims flow again.
        let outside = t0 + COOLDOWN + Duration::seconds(1);
        assert_eq!(
            claim(&store, sub, Uuid::new_v4(), outside).await,
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test]
    async fn stale_claim_is_taken_over() {
        let store = MemorySlotStore::new();
        let sub = Uuid::new_v4();
        let crashed = Uuid::new_v4();
        let t0 = Utc::now();

        assert_eq!(claim(&store, sub, crashed, t0).await, ClaimOutcome::Claimed);

        // A live claim blocks.
        let soon = t0 + Duration::seconds(30);
        assert_eq!(
            claim(&store, sub, Uuid::new_v4(), soon).await,
            ClaimOutcome::AlreadyClaimed
        );

        // Past the stale threshold the claim counts as abandoned.
        let later = t0 + STALE + Duration::seconds(1);
        let taker = Uuid::new_v4();
        assert_eq!(claim(&store, sub, taker, later).await, ClaimOutcome::Claimed);

        // The crashed holder's key can no longer commit.
        assert!(!store.commit(sub, RuleKind::PriceDrop, crashed, later).await.unwrap());
    }

    #[tokio::test]
    async fn commit_requires_the_exact_key() {
        let store = MemorySlotStore::new();
        let sub = Uuid::new_v4();
        let key = Uuid::new_v4();
        let now = Utc::now();

        assert_eq!(claim(&store, sub, key, now).await, ClaimOutcome::Claimed);

        // A mismatched key must not advance the cooldown clock.
        assert!(!store.commit(sub, RuleKind::PriceDrop, Uuid::new_v4(), now).await.unwrap());
        let slot = store.get_slot(sub, RuleKind::PriceDrop).await.unwrap().unwrap();
        assert_eq!(slot.last_notified_at, None);
        assert_eq!(slot.claim_key, Some(key));

        assert!(store.commit(sub, RuleKind::PriceDrop, key, now).await.unwrap());
        let slot = store.get_slot(sub, RuleKind::PriceDrop).await.unwrap().unwrap();
        assert_eq!(slot.last_notified_at, Some(now));
        assert_eq!(slot.claim_key, None);
    }

    #[tokio::test]
    async fn release_clears_the_claim_without_cooldown() {
        let store = MemorySlotStore::new();
        let sub = Uuid::new_v4();
        let key = Uuid::new_v4();
        let now = Utc::now();

        assert_eq!(claim(&store, sub, key, now).await, ClaimOutcome::Claimed);
        assert!(store.release(sub, RuleKind::PriceDrop, key).await.unwrap());

        // The slot is immediately claimable again; no cooldown started.
        assert_eq!(
            claim(&store, sub, Uuid::new_v4(), now).await,
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test]
    async fn rule_kinds_cool_down_independently() {
        let store = MemorySlotStore::new();
        let sub = Uuid::new_v4();
        let key = Uuid::new_v4();
        let now = Utc::now();

        assert_eq!(claim(&store, sub, key, now).await, ClaimOutcome::Claimed);
        assert!(store.commit(sub, RuleKind::PriceDrop, key, now).await.unwrap());

        // Price-drop is cooling down; back-in-stock is untouched.
        let other = store
            .claim(sub, RuleKind::BackInStock, Uuid::new_v4(), now, COOLDOWN, STALE)
            .await
            .unwrap();
        assert_eq!(other, ClaimOutcome::Claimed);
    }
}
