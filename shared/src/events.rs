use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CustomerId, Order, OrderId, ProductId};

pub const ORDER_CREATED_TOPIC: &str = "order-created";
pub const INVENTORY_UPDATE_TOPIC: &str = "inventory-update";

pub const SHIPMENT_GROUP: &str = "shipment-group";
pub const INVENTORY_GROUP: &str = "inventory-group";

pub const ORDER_ACCEPTED: &str = "OrderAccepted";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemPayload {
    pub product_id: ProductId,
    pub quantity: i32,
}

/// Published once per accepted order on `order-created`, keyed by order id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAcceptedEvent {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub order_date: DateTime<Utc>,
    pub items: Vec<OrderItemPayload>,
}

impl OrderAcceptedEvent {
    pub fn partition_key(&self) -> String {
        self.order_id.to_string()
    }
}

impl From<&Order> for OrderAcceptedEvent {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            customer_id: order.customer_id,
            order_date: order.order_date,
            items: order
                .lines
                .iter()
                .map(|line| OrderItemPayload {
                    product_id: line.product_id,
                    quantity: line.quantity,
                })
                .collect(),
        }
    }
}

/// External stock correction. `version` is the product version the sender
/// last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryChangedEvent {
    pub product_id: ProductId,
    pub new_stock: i32,
    pub version: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OrderLine, OrderStatus};
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    #[test]
    fn order_accepted_event_uses_the_wire_field_names() {
        let order_date = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let order = Order {
            id: 7,
            customer_id: 3,
            order_date,
            status: OrderStatus::Pending,
            lines: vec![OrderLine {
                order_id: 7,
                product_id: 11,
                quantity: 2,
                price: BigDecimal::from_str("99.99").unwrap(),
            }],
        };

        let event = OrderAcceptedEvent::from(&order);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["orderId"], 7);
        assert_eq!(json["customerId"], 3);
        assert_eq!(json["orderDate"], "2024-03-01T10:00:00Z");
        assert_eq!(json["items"][0]["productId"], 11);
        assert_eq!(json["items"][0]["quantity"], 2);
        assert_eq!(event.partition_key(), "7");
    }

    #[test]
    fn inventory_changed_event_reads_external_payload() {
        let event: InventoryChangedEvent =
            serde_json::from_str(r#"{"productId":4,"newStock":120,"version":9}"#).unwrap();
        assert_eq!(
            event,
            InventoryChangedEvent {
                product_id: 4,
                new_stock: 120,
                version: 9,
            }
        );
    }
}
