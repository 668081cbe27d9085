use async_trait::async_trait;
use chrono::Utc;
use shared::messaging::{decode, Disposition, MessageHandler};
use shared::*;
use std::sync::Arc;
use store::{Entity, OrderStore, ShipmentStore, StoreError};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ShipmentOutcome {
    Created(Shipment),
    /// A redelivered event for an order that already has its shipment.
    AlreadyShipped(Shipment),
}

impl ShipmentOutcome {
    pub fn shipment(&self) -> &Shipment {
        match self {
            ShipmentOutcome::Created(s) | ShipmentOutcome::AlreadyShipped(s) => s,
        }
    }
}

pub struct ShipmentCreator {
    orders: Arc<dyn OrderStore>,
    shipments: Arc<dyn ShipmentStore>,
}

impl ShipmentCreator {
    pub fn new(orders: Arc<dyn OrderStore>, shipments: Arc<dyn ShipmentStore>) -> Self {
        Self { orders, shipments }
    }

    /// Creates the one shipment for an accepted order. Safe to call any number
    /// of times for the same order.
    pub async fn create_shipment_for_order(&self, event: &OrderAcceptedEvent) -> Result<ShipmentOutcome, StoreError> {
        let order_id = event.order_id;

        if let Some(existing) = self.shipments.shipment_for_order(order_id).await? {
            return Ok(ShipmentOutcome::AlreadyShipped(existing));
        }

        self.orders
            .order(order_id)
            .await?
            .ok_or_else(|| StoreError::not_found(Entity::Order, order_id))?;

        match self.shipments.create_shipment(order_id, Utc::now()).await {
            Ok(shipment) => Ok(ShipmentOutcome::Created(shipment)),
            // Lost the race to another worker holding the same event.
            Err(StoreError::Duplicate { .. }) => self
                .shipments
                .shipment_for_order(order_id)
                .await?
                .map(ShipmentOutcome::AlreadyShipped)
                .ok_or_else(|| StoreError::not_found(Entity::Shipment, order_id)),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl MessageHandler for ShipmentCreator {
    async fn handle(&self, payload: &str) -> Disposition {
        let Some(event) = decode::<OrderAcceptedEvent>(payload) else {
            return Disposition::Ack;
        };

        match self.create_shipment_for_order(&event).await {
            Ok(ShipmentOutcome::Created(shipment)) => {
                info!(
                    "Created shipment {} for order {} ({} items)",
                    shipment.id,
                    event.order_id,
                    event.items.len()
                );
                Disposition::Ack
            }
            Ok(ShipmentOutcome::AlreadyShipped(shipment)) => {
                info!(
                    "Order {} already has shipment {}, skipping duplicate event",
                    event.order_id, shipment.id
                );
                Disposition::Ack
            }
            Err(StoreError::NotFound { entity, id }) => {
                warn!("{} {} not visible yet, leaving order event for redelivery", entity, id);
                Disposition::Retry
            }
            Err(e) => {
                error!("Failed to create shipment for order {}: {}", event.order_id, e);
                Disposition::Retry
            }
        }
    }
}
