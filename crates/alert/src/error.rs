//! Alert-side error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue error: {0}")]
    Queue(#[from] feedmill_queue::QueueError),

    #[error("invalid payload: {0}")]
    Payload(String),
}
