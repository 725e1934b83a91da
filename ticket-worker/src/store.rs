use sqlx::postgres::PgPool;
use ticket_common::ticket::Ticket;
use tracing::debug;

/// Persistence for parsed tickets: one row per successfully ingested message.
#[derive(Clone)]
pub struct TicketStore {
    pool: PgPool,
}

impl TicketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert one ticket with a single parameterized statement.
    ///
    /// All thirteen fields are bound as parameters, never interpolated into
    /// the statement text, so values containing SQL metacharacters are stored
    /// verbatim as data.
    pub async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), sqlx::Error> {
        let base_query = r#"
INSERT INTO tickets
    (concert_id, email, name, phone, quantity, credit_card, expiration, security_code, address, city, province, postal_code, country)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#;

        sqlx::query(base_query)
            .bind(ticket.concert_id)
            .bind(&ticket.email)
            .bind(&ticket.name)
            .bind(&ticket.phone)
            .bind(ticket.quantity)
            .bind(&ticket.credit_card)
            .bind(&ticket.expiration)
            .bind(&ticket.security_code)
            .bind(&ticket.address)
            .bind(&ticket.city)
            .bind(&ticket.province)
            .bind(&ticket.postal_code)
            .bind(&ticket.country)
            .execute(&self.pool)
            .await?;

        debug!(
            concert_id = ticket.concert_id,
            quantity = ticket.quantity,
            "inserted ticket"
        );

        Ok(())
    }
}
