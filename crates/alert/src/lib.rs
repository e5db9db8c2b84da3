//! Alerting: claim-protocol delivery with per-rule cooldowns, plus
//! condition evaluation over record changes.
//!
//! The invariant the crate exists for: one subscriber sees at most one
//! notification per rule kind per cooldown window, no matter how many
//! workers, retries, or duplicate jobs are in flight.

pub mod claim;
pub mod delivery;
pub mod error;
pub mod evaluator;
pub mod worker;

pub use claim::{AlertSlotStore, ClaimOutcome, MemorySlotStore, PgSlotStore};
pub use delivery::{AlertDelivery, DeliveryOutcome};
pub use error::AlertError;
pub use evaluator::{qualifying_rules, Evaluator, RecordChange, SubscriptionLookup};
pub use worker::AlertWorker;
