//! Ingestion pipeline: scheduling, run orchestration, failure policy,
//! record classification, and the quarantine lifecycle.
//!
//! One run attempt is: fetch → change-detect → parse → classify →
//! persist → finalize → enqueue downstream match batches. Runs for one
//! feed are serialized by a per-feed advisory lock; jobs arrive from an
//! at-least-once queue, so every durable transition is a single
//! conditional write.

pub mod error;
pub mod fetch;
pub mod memory;
pub mod orchestrator;
pub mod pg;
pub mod policy;
pub mod quarantine;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use error::IngestError;
pub use orchestrator::{Orchestrator, RunReport};
pub use policy::{apply_outcome, health_for, health_transition_notice, PolicyDecision, RunOutcome};
pub use quarantine::{DismissOutcome, QuarantineService};
pub use scheduler::{Scheduler, TickReport};
pub use worker::{HandleOutcome, IngestWorker};
