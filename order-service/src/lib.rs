//! Order acceptance: the retrying order service, the outbox relay that backs
//! its event publishing, and the HTTP surface in front of both.

pub mod api;
pub mod outbox;
pub mod service;

pub use service::{OrderError, OrderLineRequest, OrderService, RetryPolicy};
