pub mod alert;
pub mod config;
pub mod error;
pub mod feed;
pub mod identity;
pub mod record;
pub mod run;

pub use alert::{AlertTarget, RuleKind};
pub use config::{
    load_dotenv, AlertConfig, Config, FetchConfig, IngestConfig, PostgresConfig, QueueConfig,
};
pub use error::ErrorCode;
pub use feed::{FeedHealth, FeedNotice, FeedSource, FeedState};
pub use identity::{content_digest, match_key, record_key, sha256_hex};
pub use record::{IndexableRecord, QuarantineStatus, QuarantinedRecord};
pub use run::{bound_errors, FeedRun, RunRowError, RunStatus, TriggerKind, MAX_RUN_ERRORS};
