use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::*;
use uuid::Uuid;

use crate::{OutboxMessage, StoreError};

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::customers)]
pub struct DbCustomer {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub address: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::customers)]
pub struct NewDbCustomer<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub address: &'a str,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::products)]
pub struct DbProduct {
    pub id: i64,
    pub name: String,
    pub sku: String,
    pub price: BigDecimal,
    pub stock: i32,
    pub version: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::products)]
pub struct NewDbProduct<'a> {
    pub name: &'a str,
    pub sku: &'a str,
    pub price: BigDecimal,
    pub stock: i32,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::orders)]
pub struct DbOrder {
    pub id: i64,
    pub customer_id: i64,
    pub order_date: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewDbOrder<'a> {
    pub customer_id: i64,
    pub order_date: DateTime<Utc>,
    pub status: &'a str,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::order_lines)]
pub struct DbOrderLine {
    pub id: i64,
    pub order_id: i64,
    pub position: i32,
    pub product_id: i64,
    pub quantity: i32,
    pub price: BigDecimal,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_lines)]
pub struct NewDbOrderLine {
    pub order_id: i64,
    pub position: i32,
    pub product_id: i64,
    pub quantity: i32,
    pub price: BigDecimal,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::shipments)]
pub struct DbShipment {
    pub id: i64,
    pub order_id: i64,
    pub dispatched_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub status: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::shipments)]
pub struct NewDbShipment<'a> {
    pub order_id: i64,
    pub dispatched_at: DateTime<Utc>,
    pub status: &'a str,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: i64,
    pub topic: String,
    pub partition_key: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewDbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: i64,
    pub topic: String,
    pub partition_key: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
}

impl From<DbCustomer> for Customer {
    fn from(row: DbCustomer) -> Self {
        Self {
            id: row.id,
            name: row.name,
            email: row.email,
            address: row.address,
        }
    }
}

impl From<DbProduct> for Product {
    fn from(row: DbProduct) -> Self {
        Self {
            id: row.id,
            name: row.name,
            sku: row.sku,
            price: row.price,
            stock: row.stock,
            version: row.version,
        }
    }
}

impl TryFrom<DbShipment> for Shipment {
    type Error = StoreError;

    fn try_from(row: DbShipment) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<ShipmentStatus>()
            .map_err(|e| StoreError::Corrupt(format!("shipment {}: {}", row.id, e)))?;

        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            dispatched_at: row.dispatched_at,
            delivered_at: row.delivered_at,
            status,
        })
    }
}

impl From<DbOutboxEvent> for OutboxMessage {
    fn from(row: DbOutboxEvent) -> Self {
        Self {
            id: row.id,
            aggregate_id: row.aggregate_id,
            topic: row.topic,
            partition_key: row.partition_key,
            event_type: row.event_type,
            payload: row.event_data,
            created_at: row.created_at,
        }
    }
}

/// Builds an order from its header row and line rows, keeping caller line order.
pub fn assemble_order(order: DbOrder, mut lines: Vec<DbOrderLine>) -> Result<Order, StoreError> {
    let status = order
        .status
        .parse::<OrderStatus>()
        .map_err(|e| StoreError::Corrupt(format!("order {}: {}", order.id, e)))?;
    lines.sort_by_key(|line| line.position);

    Ok(Order {
        id: order.id,
        customer_id: order.customer_id,
        order_date: order.order_date,
        status,
        lines: lines
            .into_iter()
            .map(|line| OrderLine {
                order_id: line.order_id,
                product_id: line.product_id,
                quantity: line.quantity,
                price: line.price,
            })
            .collect(),
    })
}
