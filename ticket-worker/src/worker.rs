use std::sync::Arc;
use std::time;

use ticket_common::pgqueue::{MessageError, PgMessage, PgQueue};
use ticket_common::retry::RetryPolicy;
use ticket_common::ticket::Ticket;
use tokio::sync;
use tracing::error;

use crate::error::{IngestError, WorkerError};
use crate::store::TicketStore;

/// A worker to poll `PgQueue` and spawn tasks to ingest tickets when a message becomes available.
pub struct TicketWorker {
    /// An identifier for this worker. Used to mark messages we have claimed.
    name: String,
    /// The queue we will be dequeuing messages from.
    queue: PgQueue,
    /// The store receiving one row per ingested ticket.
    store: TicketStore,
    /// The interval for polling the queue.
    poll_interval: time::Duration,
    /// Maximum number of concurrent messages being processed.
    max_concurrent_messages: usize,
    /// The retry policy used to calculate retry intervals when a message fails with a retryable error.
    retry_policy: RetryPolicy,
}

impl TicketWorker {
    pub fn new(
        name: &str,
        queue: PgQueue,
        store: TicketStore,
        poll_interval: time::Duration,
        max_concurrent_messages: usize,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            store,
            poll_interval,
            max_concurrent_messages,
            retry_policy,
        }
    }

    /// Wait until a message becomes available in our queue.
    async fn wait_for_message(&self) -> Result<PgMessage, WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;

            if let Some(message) = self.queue.dequeue(&self.name).await? {
                return Ok(message);
            }
        }
    }

    /// Run this worker to continuously ingest any messages that become available.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_messages));

        loop {
            let message = self.wait_for_message().await?;

            spawn_ticket_ingestion_task(
                self.store.clone(),
                semaphore.clone(),
                self.retry_policy,
                message,
            )
            .await;
        }
    }
}

/// Spawn a Tokio task to ingest a ticket message once we successfully acquire a permit.
///
/// # Arguments
///
/// * `store`: The ticket store the parsed ticket is inserted into.
/// * `semaphore`: A semaphore used for rate limiting purposes. This function will panic if this semaphore is closed.
/// * `retry_policy`: The retry policy used to set retry parameters if a message fails and has remaining attempts.
/// * `message`: The ticket message to ingest as dequeued from `ticket_common::pgqueue::PgQueue`.
async fn spawn_ticket_ingestion_task(
    store: TicketStore,
    semaphore: Arc<sync::Semaphore>,
    retry_policy: RetryPolicy,
    message: PgMessage,
) -> tokio::task::JoinHandle<Result<(), WorkerError>> {
    let permit = semaphore
        .acquire_owned()
        .await
        .expect("semaphore has been closed");

    let labels = [("queue", message.message.queue.clone())];

    metrics::counter!("ticket_messages_total", &labels).increment(1);

    tokio::spawn(async move {
        let result = process_ticket_message(store, message, &retry_policy).await;
        drop(permit);
        match result {
            Ok(_) => Ok(()),
            Err(error) => {
                error!("failed to process ticket message: {}", error);
                Err(error)
            }
        }
    })
}

/// Ingest one ticket message and transition it to its appropriate state.
///
/// The pipeline is decode, parse, insert; afterwards the message takes exactly
/// one transition:
/// * completed, when the insert went through;
/// * failed, when the payload did not decode or parse. A poison payload can
///   never succeed on a later attempt, so it goes straight to the dead-letter
///   surface instead of being retried or silently acknowledged;
/// * retried with backoff, when the insert hit a database error and attempts
///   remain. Once the attempt budget is exhausted the message is failed.
///
/// # Arguments
///
/// * `store`: The ticket store the parsed ticket is inserted into.
/// * `message`: The ticket message to ingest as dequeued from `ticket_common::pgqueue::PgQueue`.
/// * `retry_policy`: The retry policy used to set retry parameters if a message fails and has remaining attempts.
async fn process_ticket_message(
    store: TicketStore,
    message: PgMessage,
    retry_policy: &RetryPolicy,
) -> Result<(), WorkerError> {
    let labels = [("queue", message.message.queue.clone())];

    let now = tokio::time::Instant::now();

    let result = ingest_ticket(&store, message.message.payload.as_bytes()).await;

    let elapsed = now.elapsed().as_secs_f64();

    match result {
        Ok(ticket) => {
            message
                .complete()
                .await
                .map_err(|error| WorkerError::MessageError(error.to_string()))?;

            tracing::info!(
                concert_id = ticket.concert_id,
                name = %ticket.name,
                quantity = ticket.quantity,
                "ticket ingested"
            );
            metrics::counter!("ticket_messages_completed", &labels).increment(1);
            metrics::histogram!("ticket_messages_processing_duration_seconds", &labels)
                .record(elapsed);

            Ok(())
        }
        Err(IngestError::PayloadError(payload_error)) => {
            error!(
                "failed to read a ticket out of the message payload: {}",
                payload_error
            );
            message
                .fail(payload_error.to_string())
                .await
                .map_err(|message_error| WorkerError::MessageError(message_error.to_string()))?;

            metrics::counter!("ticket_messages_failed", &labels).increment(1);

            Ok(())
        }
        Err(IngestError::DatabaseError(database_error)) => {
            let retry_interval = retry_policy.retry_interval(message.message.attempt as u32);

            error!("failed to persist ticket: {}", database_error);
            match message
                .retry(database_error.to_string(), retry_interval)
                .await
            {
                Ok(_) => {
                    metrics::counter!("ticket_messages_retried", &labels).increment(1);

                    Ok(())
                }
                Err(MessageError::RetryInvalidError { message }) => {
                    message.fail(database_error.to_string()).await.map_err(
                        |message_error| WorkerError::MessageError(message_error.to_string()),
                    )?;

                    metrics::counter!("ticket_messages_failed", &labels).increment(1);

                    Ok(())
                }
                Err(message_error) => Err(WorkerError::MessageError(message_error.to_string())),
            }
        }
    }
}

/// Run the ingestion pipeline for one payload: decode, parse, insert.
async fn ingest_ticket(store: &TicketStore, payload: &[u8]) -> Result<Ticket, IngestError> {
    let ticket = Ticket::from_bytes(payload)?;

    store.insert_ticket(&ticket).await?;

    Ok(ticket)
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use sqlx::PgPool;
    use ticket_common::pgqueue::{Message, MessageStatus, NewMessage};

    use super::*;

    const FULL_SUBMISSION: &str = r#"{"ConcertId":42,"Email":"a@b.com","Name":"Jane Doe","Phone":"555-1212","Quantity":2,"CreditCard":"4111111111111111","Expiration":"12/26","SecurityCode":"123","Address":"1 Main St","City":"Springfield","Province":"IL","PostalCode":"62701","Country":"US"}"#;

    /// Use process id as a worker id for tests.
    fn worker_id() -> String {
        std::process::id().to_string()
    }

    async fn enqueue_payload(queue: &PgQueue, max_attempts: i32, payload: &str) {
        queue
            .enqueue(NewMessage::new(max_attempts, payload))
            .await
            .expect("failed to enqueue message");
    }

    async fn fetch_message(pool: &PgPool, id: i64) -> Message {
        sqlx::query_as("SELECT * FROM ticket_messages WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .expect("failed to fetch message")
    }

    async fn fetch_tickets(pool: &PgPool) -> Vec<Ticket> {
        sqlx::query_as(
            r#"
SELECT concert_id, email, name, phone, quantity, credit_card, expiration, security_code, address, city, province, postal_code, country
FROM tickets
ORDER BY id
            "#,
        )
        .fetch_all(pool)
        .await
        .expect("failed to fetch tickets")
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_wait_for_message(db: PgPool) {
        let worker_id = worker_id();
        let queue = PgQueue::new_from_pool("test_wait_for_message", db.clone());
        let store = TicketStore::new(db);

        enqueue_payload(&queue, 1, FULL_SUBMISSION).await;

        let worker = TicketWorker::new(
            &worker_id,
            queue,
            store,
            time::Duration::from_millis(100),
            10,
            RetryPolicy::default(),
        );

        let message = worker
            .wait_for_message()
            .await
            .expect("failed to wait and read message");

        assert_eq!(message.message.attempt, 1);
        assert!(message.message.attempted_by.contains(&worker_id));
        assert_eq!(message.message.max_attempts, 1);
        assert_eq!(message.message.status, MessageStatus::Running);
        assert_eq!(message.message.payload, FULL_SUBMISSION);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_valid_submission_is_ingested(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_valid_submission", db.clone());
        let store = TicketStore::new(db.clone());

        enqueue_payload(&queue, 1, FULL_SUBMISSION).await;

        let message = queue
            .dequeue(&worker_id())
            .await
            .expect("failed to dequeue")
            .expect("no message in queue");
        let id = message.message.id;

        process_ticket_message(store, message, &RetryPolicy::default())
            .await
            .expect("failed to process message");

        let tickets = fetch_tickets(&db).await;
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].concert_id, 42);
        assert_eq!(tickets[0].email, "a@b.com");
        assert_eq!(tickets[0].name, "Jane Doe");
        assert_eq!(tickets[0].phone, "555-1212");
        assert_eq!(tickets[0].quantity, 2);
        assert_eq!(tickets[0].credit_card, "4111111111111111");
        assert_eq!(tickets[0].expiration, "12/26");
        assert_eq!(tickets[0].security_code, "123");
        assert_eq!(tickets[0].address, "1 Main St");
        assert_eq!(tickets[0].city, "Springfield");
        assert_eq!(tickets[0].province, "IL");
        assert_eq!(tickets[0].postal_code, "62701");
        assert_eq!(tickets[0].country, "US");

        assert_eq!(
            fetch_message(&db, id).await.status,
            MessageStatus::Completed
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_base64_submission_is_ingested_identically(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_base64_submission", db.clone());
        let store = TicketStore::new(db.clone());

        let encoded = base64::engine::general_purpose::STANDARD.encode(FULL_SUBMISSION);
        enqueue_payload(&queue, 1, &encoded).await;

        let message = queue
            .dequeue(&worker_id())
            .await
            .expect("failed to dequeue")
            .expect("no message in queue");

        process_ticket_message(store, message, &RetryPolicy::default())
            .await
            .expect("failed to process message");

        let tickets = fetch_tickets(&db).await;
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0], Ticket::from_json(FULL_SUBMISSION).unwrap());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_malformed_payload_is_dead_lettered(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_malformed_payload", db.clone());
        let store = TicketStore::new(db.clone());

        enqueue_payload(&queue, 3, "not json").await;

        let message = queue
            .dequeue(&worker_id())
            .await
            .expect("failed to dequeue")
            .expect("no message in queue");
        let id = message.message.id;

        process_ticket_message(store, message, &RetryPolicy::default())
            .await
            .expect("failed to process message");

        // Poison payloads are failed immediately, not retried: the attempt
        // budget of 3 is irrelevant.
        let row = fetch_message(&db, id).await;
        assert_eq!(row.status, MessageStatus::Failed);
        assert_eq!(row.attempt, 1);
        assert!(fetch_tickets(&db).await.is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_null_payload_is_dead_lettered(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_null_payload", db.clone());
        let store = TicketStore::new(db.clone());

        enqueue_payload(&queue, 1, "null").await;

        let message = queue
            .dequeue(&worker_id())
            .await
            .expect("failed to dequeue")
            .expect("no message in queue");
        let id = message.message.id;

        process_ticket_message(store, message, &RetryPolicy::default())
            .await
            .expect("failed to process message");

        let row = fetch_message(&db, id).await;
        assert_eq!(row.status, MessageStatus::Failed);
        assert!(fetch_tickets(&db).await.is_empty());
    }
}
