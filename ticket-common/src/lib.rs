pub mod metrics;
pub mod pgqueue;
pub mod retry;
pub mod ticket;
