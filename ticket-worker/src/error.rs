use ticket_common::pgqueue;
use ticket_common::ticket::PayloadError;
use thiserror::Error;

/// Enumeration of per-message errors raised while ingesting one ticket submission.
///
/// The two variants split the retry contract: a payload error can never
/// succeed on a later attempt, a database error might.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to read a ticket out of the message payload: {0}")]
    PayloadError(#[from] PayloadError),
    #[error("failed to persist ticket: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

/// Enumeration of errors related to initialization and consumption of ticket messages.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred in the underlying queue")]
    QueueError(#[from] pgqueue::PgQueueError),
    #[error("an error occurred in the underlying message")]
    MessageError(String),
}
