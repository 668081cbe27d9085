//! Keyed stores behind the order flow: the stock ledger, orders, shipments and
//! the event outbox, with a Postgres backend and an in-memory one.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::Connection;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use shared::*;
use std::fmt;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::{DbPool, PgStore};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Customer,
    Product,
    Order,
    Shipment,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Customer => "customer",
            Entity::Product => "product",
            Entity::Order => "order",
            Entity::Shipment => "shipment",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: Entity, id: i64 },

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: i32,
        available: i32,
    },

    #[error("version conflict on product {product_id}: read version {expected}")]
    VersionConflict { product_id: ProductId, expected: i64 },

    #[error("stale write on product {product_id}: observed version {observed}, current version {current}")]
    StaleWrite {
        product_id: ProductId,
        observed: i64,
        current: i64,
    },

    #[error("invalid stock quantity {quantity} for product {product_id}")]
    InvalidQuantity { product_id: ProductId, quantity: i32 },

    #[error("{entity} for {key} already exists")]
    Duplicate { entity: Entity, key: i64 },

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn not_found(entity: Entity, id: i64) -> Self {
        StoreError::NotFound { entity, id }
    }
}

impl From<bb8::RunError<diesel_async::pooled_connection::PoolError>> for StoreError {
    fn from(e: bb8::RunError<diesel_async::pooled_connection::PoolError>) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// A pending event row written in the same transaction as the order it
/// describes.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxMessage {
    pub aggregate_id: i64,
    pub topic: String,
    pub partition_key: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewOutboxMessage {
    pub fn order_accepted(event: &OrderAcceptedEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            aggregate_id: event.order_id,
            topic: ORDER_CREATED_TOPIC.to_string(),
            partition_key: event.partition_key(),
            event_type: ORDER_ACCEPTED.to_string(),
            payload: serde_json::to_value(event)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub aggregate_id: i64,
    pub topic: String,
    pub partition_key: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One order-acceptance attempt. Reservations and the order become durable
/// together on `commit`; `rollback`, or dropping the unit of work, discards
/// them.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn find_customer(&mut self, id: CustomerId) -> Result<Option<Customer>, StoreError>;

    /// Decrements stock and bumps the version, only if the version read is
    /// still current. Fails with `NotFound`, `InsufficientStock` or
    /// `VersionConflict`, leaving the product untouched.
    async fn reserve(&mut self, product_id: ProductId, quantity: i32) -> Result<Reservation, StoreError>;

    async fn insert_order(&mut self, order: NewOrder) -> Result<Order, StoreError>;

    async fn enqueue(&mut self, message: NewOutboxMessage) -> Result<Uuid, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError>;
}

#[async_trait]
pub trait StockLedger: Send + Sync {
    async fn product(&self, id: ProductId) -> Result<Option<Product>, StoreError>;

    /// Every product, by id.
    async fn products(&self) -> Result<Vec<Product>, StoreError>;

    /// Overwrites the stock with an externally computed quantity. Fails with
    /// `StaleWrite` when `observed_version` is no longer current. Waits for an
    /// in-flight reservation on the same product to finish first.
    async fn apply_correction(
        &self,
        product_id: ProductId,
        new_quantity: i32,
        observed_version: i64,
    ) -> Result<Product, StoreError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError>;

    async fn orders_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Order>, StoreError>;
}

#[async_trait]
pub trait ShipmentStore: Send + Sync {
    /// Fails with `Duplicate` when the order already has a shipment.
    async fn create_shipment(
        &self,
        order_id: OrderId,
        dispatched_at: DateTime<Utc>,
    ) -> Result<Shipment, StoreError>;

    async fn shipment_for_order(&self, order_id: OrderId) -> Result<Option<Shipment>, StoreError>;
}

#[async_trait]
pub trait Outbox: Send + Sync {
    /// Unprocessed messages, oldest first.
    async fn pending(&self, limit: i64) -> Result<Vec<OutboxMessage>, StoreError>;

    async fn mark_processed(&self, id: Uuid) -> Result<(), StoreError>;
}

pub fn run_migrations(database_url: &str) -> anyhow::Result<()> {
    info!("Running database migrations...");
    let mut conn = PgConnection::establish(database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");
    Ok(())
}
