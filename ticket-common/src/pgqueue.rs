use std::str::FromStr;
use std::time;

use chrono::prelude::*;
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::PgPool;
use thiserror::Error;

/// Enumeration of errors for operations with PgQueue.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum PgQueueError {
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid MessageStatus")]
    ParseMessageStatusError(String),
}

/// Enumeration of errors for operations with a dequeued message.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("retry is not a valid transition for a message which has exhausted its attempts")]
    RetryInvalidError { message: PgMessage },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

/// Enumeration of possible statuses for a queued message.
/// Available: waiting in the queue to be picked up by a worker, or scheduled for a retry.
/// Completed: successfully processed by a worker.
/// Failed: exhausted its attempts or carried a payload that can never be processed.
///   Failed messages remain in the table as the dead-letter surface.
/// Running: claimed by a worker and currently being processed.
#[derive(Debug, PartialEq, sqlx::Type)]
#[sqlx(type_name = "message_status")]
#[sqlx(rename_all = "lowercase")]
pub enum MessageStatus {
    Available,
    Completed,
    Failed,
    Running,
}

/// Allow casting MessageStatus from strings.
impl FromStr for MessageStatus {
    type Err = PgQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(MessageStatus::Available),
            "completed" => Ok(MessageStatus::Completed),
            "failed" => Ok(MessageStatus::Failed),
            "running" => Ok(MessageStatus::Running),
            invalid => Err(PgQueueError::ParseMessageStatusError(invalid.to_owned())),
        }
    }
}

/// A message dequeued from a PgQueue, to be processed by a worker.
///
/// The payload is opaque to the queue: producers may deliver plain UTF-8 JSON
/// or Base64 text, and interpretation belongs entirely to the consumer.
#[derive(Debug, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub queue: String,
    pub status: MessageStatus,
    pub attempt: i32,
    pub max_attempts: i32,
    pub attempted_by: Vec<String>,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub payload: String,
}

impl Message {
    /// Whether this message has any attempts remaining after the current one.
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// A NewMessage to be enqueued into a PgQueue.
pub struct NewMessage {
    pub max_attempts: i32,
    pub payload: String,
}

impl NewMessage {
    pub fn new(max_attempts: i32, payload: &str) -> Self {
        Self {
            max_attempts,
            payload: payload.to_owned(),
        }
    }
}

/// A dequeued message bound to the queue's connection pool, exposing the
/// transitions that terminate an attempt: complete, retry, and fail.
#[derive(Debug)]
pub struct PgMessage {
    pub message: Message,
    pool: PgPool,
}

impl PgMessage {
    /// Mark this message as successfully processed.
    pub async fn complete(self) -> Result<(), MessageError> {
        let base_query = r#"
UPDATE ticket_messages
SET
    finished_at = NOW(),
    status = 'completed'::message_status
WHERE
    id = $1
        "#;

        sqlx::query(base_query)
            .bind(self.message.id)
            .execute(&self.pool)
            .await
            .map_err(|error| MessageError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Record a failed attempt and schedule this message to be picked up again
    /// after `retry_interval`. Only valid while attempts remain: once the
    /// attempt budget is exhausted we return the message back to the caller so
    /// it can be failed instead.
    pub async fn retry(
        self,
        error: String,
        retry_interval: time::Duration,
    ) -> Result<(), MessageError> {
        if !self.message.has_attempts_remaining() {
            return Err(MessageError::RetryInvalidError { message: self });
        }

        let base_query = r#"
UPDATE ticket_messages
SET
    started_at = NULL,
    status = 'available'::message_status,
    scheduled_at = NOW() + $2,
    errors = array_append(errors, $3)
WHERE
    id = $1
        "#;

        sqlx::query(base_query)
            .bind(self.message.id)
            .bind(pg_interval(retry_interval))
            .bind(&error)
            .execute(&self.pool)
            .await
            .map_err(|error| MessageError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Mark this message as failed. Failed messages are never picked up again
    /// and remain queryable as the dead-letter surface.
    pub async fn fail(self, error: String) -> Result<(), MessageError> {
        let base_query = r#"
UPDATE ticket_messages
SET
    finished_at = NOW(),
    status = 'failed'::message_status,
    errors = array_append(errors, $2)
WHERE
    id = $1
        "#;

        sqlx::query(base_query)
            .bind(self.message.id)
            .bind(&error)
            .execute(&self.pool)
            .await
            .map_err(|error| MessageError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }
}

/// A queue of ticket submissions implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgQueue {
    name: String,
    pool: PgPool,
}

pub type PgQueueResult<T> = std::result::Result<T, PgQueueError>;

impl PgQueue {
    /// Initialize a new PgQueue backed by an existing connection pool.
    /// The pool is shared with whatever else the process does against the
    /// same database; pooling policy belongs to sqlx.
    pub fn new_from_pool(queue_name: &str, pool: PgPool) -> Self {
        Self {
            name: queue_name.to_owned(),
            pool,
        }
    }

    /// Enqueue a message into this PgQueue.
    /// We take ownership of NewMessage to enforce a specific NewMessage is only enqueued once.
    pub async fn enqueue(&self, message: NewMessage) -> PgQueueResult<()> {
        let base_query = r#"
INSERT INTO ticket_messages
    (queue, status, max_attempts, payload)
VALUES
    ($1, 'available'::message_status, $2, $3)
        "#;

        sqlx::query(base_query)
            .bind(&self.name)
            .bind(message.max_attempts)
            .bind(&message.payload)
            .execute(&self.pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Dequeue the oldest available message from this PgQueue, if any.
    ///
    /// The row is claimed with FOR UPDATE SKIP LOCKED so that concurrent
    /// workers never pick up the same message.
    pub async fn dequeue(&self, attempted_by: &str) -> PgQueueResult<Option<PgMessage>> {
        let base_query = r#"
WITH available_message AS (
    SELECT
        id
    FROM
        ticket_messages
    WHERE
        queue = $1
        AND status = 'available'
        AND scheduled_at <= NOW()
    ORDER BY
        id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    ticket_messages
SET
    started_at = NOW(),
    status = 'running'::message_status,
    attempt = ticket_messages.attempt + 1,
    attempted_by = array_append(ticket_messages.attempted_by, $2)
FROM
    available_message
WHERE
    ticket_messages.id = available_message.id
RETURNING
    ticket_messages.*
        "#;

        let message: Option<Message> = sqlx::query_as(base_query)
            .bind(&self.name)
            .bind(attempted_by)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(message.map(|message| PgMessage {
            message,
            pool: self.pool.clone(),
        }))
    }
}

fn pg_interval(duration: time::Duration) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: i64::try_from(duration.as_micros()).unwrap_or(i64::MAX),
    }
}
