pub mod batcher;
pub mod consumer;
pub mod error;
pub mod identity;
pub mod job;
pub mod memory;
pub mod producer;
pub mod sqs;

pub use batcher::MicroBatcher;
pub use consumer::{JobConsumer, JobMessage, QueueHealth};
pub use error::QueueError;
pub use identity::{batch_key, subject_key, window_start, windowed_key};
pub use job::{JobEnvelope, JobKind};
pub use memory::MemoryJobQueue;
pub use producer::{EnqueueOutcome, JobProducer};
pub use sqs::SqsJobQueue;
