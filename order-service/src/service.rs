use bigdecimal::BigDecimal;
use chrono::Utc;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use shared::messaging::{publish_json, EventPublisher, PublishError};
use shared::*;
use std::sync::Arc;
use std::time::Duration;
use store::{Entity, NewOutboxMessage, Outbox, Store, StoreError, UnitOfWork};
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineRequest {
    pub product_id: ProductId,
    pub quantity: i32,
    pub price: BigDecimal,
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("invalid order request: {0}")]
    InvalidRequest(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: Entity, id: i64 },

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: i32,
        available: i32,
    },

    #[error("gave up after {attempts} attempts on concurrent stock updates")]
    ConcurrencyExhausted { attempts: u32 },

    /// The order is committed; only its event is still pending in the outbox.
    #[error("order accepted but its event was not published: {source}")]
    PublishFailure {
        order: Box<Order>,
        #[source]
        source: PublishError,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for OrderError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => OrderError::NotFound { entity, id },
            StoreError::InsufficientStock {
                product_id,
                requested,
                available,
            } => OrderError::InsufficientStock {
                product_id,
                requested,
                available,
            },
            other => OrderError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

pub fn validate(lines: &[OrderLineRequest]) -> Result<(), OrderError> {
    if lines.is_empty() {
        return Err(OrderError::InvalidRequest(
            "order must contain at least one item".to_string(),
        ));
    }
    for line in lines {
        if line.quantity < 1 {
            return Err(OrderError::InvalidRequest(format!(
                "quantity for product {} must be at least 1",
                line.product_id
            )));
        }
        if line.price <= BigDecimal::zero() {
            return Err(OrderError::InvalidRequest(format!(
                "price for product {} must be greater than zero",
                line.product_id
            )));
        }
    }
    Ok(())
}

/// Accepts orders against the stock ledger.
///
/// Each attempt runs in one unit of work: resolve the customer, reserve every
/// line in caller order, insert the order and stage its `OrderAccepted` event
/// in the outbox, then commit. A `VersionConflict` anywhere discards the
/// attempt and the whole thing is retried from a fresh read, up to
/// `RetryPolicy::max_attempts`.
pub struct OrderService {
    store: Arc<dyn Store>,
    outbox: Arc<dyn Outbox>,
    publisher: Arc<dyn EventPublisher>,
    retry: RetryPolicy,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn Store>,
        outbox: Arc<dyn Outbox>,
        publisher: Arc<dyn EventPublisher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            outbox,
            publisher,
            retry,
        }
    }

    pub async fn create_order(
        &self,
        customer_id: CustomerId,
        lines: Vec<OrderLineRequest>,
    ) -> Result<Order, OrderError> {
        validate(&lines)?;

        let mut attempt = 1;
        loop {
            debug!("Order attempt {} for customer {}", attempt, customer_id);
            match self.attempt(customer_id, &lines).await {
                Ok((order, outbox_id)) => return self.announce(order, outbox_id).await,
                Err(StoreError::VersionConflict { product_id, expected }) => {
                    if attempt >= self.retry.max_attempts {
                        warn!(
                            "Giving up on order for customer {} after {} attempts (product {} still contended)",
                            customer_id, attempt, product_id
                        );
                        return Err(OrderError::ConcurrencyExhausted { attempts: attempt });
                    }
                    warn!(
                        "Version conflict on product {} at version {}, retrying order for customer {} ({}/{})",
                        product_id, expected, customer_id, attempt, self.retry.max_attempts
                    );
                    time::sleep(self.retry.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn attempt(
        &self,
        customer_id: CustomerId,
        lines: &[OrderLineRequest],
    ) -> Result<(Order, Uuid), StoreError> {
        let mut uow = self.store.begin().await?;

        match Self::accept(uow.as_mut(), customer_id, lines).await {
            Ok(accepted) => {
                uow.commit().await?;
                Ok(accepted)
            }
            Err(e) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!("Rollback failed after {}: {}", e, rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn accept<'u>(
        uow: &mut (dyn UnitOfWork + 'u),
        customer_id: CustomerId,
        lines: &[OrderLineRequest],
    ) -> Result<(Order, Uuid), StoreError> {
        uow.find_customer(customer_id)
            .await?
            .ok_or_else(|| StoreError::not_found(Entity::Customer, customer_id))?;

        for line in lines {
            let reservation = uow.reserve(line.product_id, line.quantity).await?;
            debug!(
                "Reserved {} of product {} ({} on hand, now version {})",
                line.quantity, line.product_id, reservation.prior_quantity, reservation.new_version
            );
        }

        let order = uow
            .insert_order(NewOrder {
                customer_id,
                order_date: Utc::now(),
                lines: lines
                    .iter()
                    .map(|line| NewOrderLine {
                        product_id: line.product_id,
                        quantity: line.quantity,
                        price: line.price.clone(),
                    })
                    .collect(),
            })
            .await?;

        let event = OrderAcceptedEvent::from(&order);
        let message = NewOutboxMessage::order_accepted(&event)
            .map_err(|e| StoreError::Corrupt(format!("unencodable event for order {}: {}", order.id, e)))?;
        let outbox_id = uow.enqueue(message).await?;

        Ok((order, outbox_id))
    }

    async fn announce(&self, order: Order, outbox_id: Uuid) -> Result<Order, OrderError> {
        let event = OrderAcceptedEvent::from(&order);

        match publish_json(self.publisher.as_ref(), ORDER_CREATED_TOPIC, &event.partition_key(), &event).await {
            Ok(()) => {
                if let Err(e) = self.outbox.mark_processed(outbox_id).await {
                    warn!("Could not mark outbox event {} processed, relay will resend: {}", outbox_id, e);
                }
                info!("Successfully created order and published event for order ID: {}", order.id);
                Ok(order)
            }
            Err(source) => {
                warn!(
                    "Order {} accepted but publish failed, left for the outbox relay: {}",
                    order.id, source
                );
                Err(OrderError::PublishFailure {
                    order: Box::new(order),
                    source,
                })
            }
        }
    }
}
