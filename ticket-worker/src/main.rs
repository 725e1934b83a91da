//! Consume `PgQueue` messages to ingest ticket purchase submissions.
use envconfig::Envconfig;
use sqlx::postgres::PgPoolOptions;

use ticket_common::{
    metrics::serve, metrics::setup_metrics_router, pgqueue::PgQueue, retry::RetryPolicy,
};
use ticket_worker::config::Config;
use ticket_worker::error::WorkerError;
use ticket_worker::store::TicketStore;
use ticket_worker::worker::TicketWorker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let retry_policy = RetryPolicy::new(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
        Some(config.retry_policy.maximum_interval.0),
    );
    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to the database");

    let queue = PgQueue::new_from_pool(config.queue_name.as_str(), pool.clone());
    let store = TicketStore::new(pool);

    let worker = TicketWorker::new(
        &config.worker_name,
        queue,
        store,
        config.poll_interval.0,
        config.max_concurrent_messages,
        retry_policy,
    );

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_metrics_router();
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    worker.run().await?;

    Ok(())
}
