use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use shared::*;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

use crate::models::*;
use crate::schema::*;
use crate::{
    Entity, NewOutboxMessage, OrderStore, Outbox, OutboxMessage, ShipmentStore, StockLedger, Store, StoreError,
    UnitOfWork,
};

pub type DbPool = Pool<AsyncPgConnection>;

type PooledConnection<'a> = bb8::PooledConnection<'a, AsyncDieselConnectionManager<AsyncPgConnection>>;

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_size: u32) -> anyhow::Result<Self> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder().max_size(max_size).build(config).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn add_customer(&self, name: &str, email: &str, address: &str) -> Result<Customer, StoreError> {
        let mut conn = self.pool.get().await?;
        let row: DbCustomer = diesel::insert_into(customers::table)
            .values(&NewDbCustomer { name, email, address })
            .get_result(&mut conn)
            .await?;
        Ok(row.into())
    }

    pub async fn add_product(
        &self,
        name: &str,
        sku: &str,
        price: BigDecimal,
        stock: i32,
    ) -> Result<Product, StoreError> {
        let mut conn = self.pool.get().await?;
        let row: DbProduct = diesel::insert_into(products::table)
            .values(&NewDbProduct {
                name,
                sku,
                price,
                stock,
            })
            .get_result(&mut conn)
            .await?;
        Ok(row.into())
    }
}

async fn load_product(conn: &mut AsyncPgConnection, id: ProductId) -> Result<Option<DbProduct>, StoreError> {
    let product = products::table
        .find(id)
        .first::<DbProduct>(conn)
        .await
        .optional()?;
    Ok(product)
}

/// Locks the product row for this transaction without waiting. A row held by
/// another transaction is reported as `VersionConflict`, so two orders taking
/// the same products in opposite order never wait on each other.
async fn lock_product(conn: &mut AsyncPgConnection, id: ProductId) -> Result<DbProduct, StoreError> {
    let locked = products::table
        .filter(products::id.eq(id))
        .for_update()
        .skip_locked()
        .get_result::<DbProduct>(conn)
        .await
        .optional()?;

    match locked {
        Some(product) => Ok(product),
        None => {
            let current = load_product(conn, id)
                .await?
                .ok_or_else(|| StoreError::not_found(Entity::Product, id))?;
            Err(StoreError::VersionConflict {
                product_id: id,
                expected: current.version,
            })
        }
    }
}

async fn reserve_stock(
    conn: &mut AsyncPgConnection,
    product_id: ProductId,
    quantity: i32,
) -> Result<Reservation, StoreError> {
    let product = lock_product(conn, product_id).await?;

    if product.stock < quantity {
        return Err(StoreError::InsufficientStock {
            product_id,
            requested: quantity,
            available: product.stock,
        });
    }

    let updated = diesel::update(
        products::table
            .filter(products::id.eq(product_id))
            .filter(products::version.eq(product.version)),
    )
    .set((
        products::stock.eq(products::stock - quantity),
        products::version.eq(products::version + 1),
    ))
    .execute(conn)
    .await?;

    if updated == 0 {
        return Err(StoreError::VersionConflict {
            product_id,
            expected: product.version,
        });
    }

    Ok(Reservation {
        product_id,
        new_version: product.version + 1,
        prior_quantity: product.stock,
    })
}

async fn load_lines(conn: &mut AsyncPgConnection, order_ids: &[OrderId]) -> Result<Vec<DbOrderLine>, StoreError> {
    let lines = order_lines::table
        .filter(order_lines::order_id.eq_any(order_ids))
        .order((order_lines::order_id.asc(), order_lines::position.asc()))
        .load::<DbOrderLine>(conn)
        .await?;
    Ok(lines)
}

/// Holds a pooled connection with an open transaction. A connection dropped
/// mid-transaction is reported broken to the pool and discarded, so an
/// abandoned attempt never leaks its reservations.
pub struct PgUnitOfWork<'a> {
    conn: PooledConnection<'a>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork<'_> {
    async fn find_customer(&mut self, id: CustomerId) -> Result<Option<Customer>, StoreError> {
        let customer = customers::table
            .find(id)
            .first::<DbCustomer>(&mut *self.conn)
            .await
            .optional()?;
        Ok(customer.map(Customer::from))
    }

    async fn reserve(&mut self, product_id: ProductId, quantity: i32) -> Result<Reservation, StoreError> {
        let reservation = reserve_stock(&mut self.conn, product_id, quantity).await?;
        debug!(
            "Reserved {} of product {} (version {})",
            quantity, product_id, reservation.new_version
        );
        Ok(reservation)
    }

    async fn insert_order(&mut self, order: NewOrder) -> Result<Order, StoreError> {
        let header: DbOrder = diesel::insert_into(orders::table)
            .values(&NewDbOrder {
                customer_id: order.customer_id,
                order_date: order.order_date,
                status: OrderStatus::Pending.as_str(),
            })
            .get_result(&mut *self.conn)
            .await?;

        let rows: Vec<NewDbOrderLine> = order
            .lines
            .into_iter()
            .enumerate()
            .map(|(position, line)| NewDbOrderLine {
                order_id: header.id,
                position: position as i32,
                product_id: line.product_id,
                quantity: line.quantity,
                price: line.price,
            })
            .collect();

        let lines: Vec<DbOrderLine> = diesel::insert_into(order_lines::table)
            .values(&rows)
            .get_results(&mut *self.conn)
            .await?;

        assemble_order(header, lines)
    }

    async fn enqueue(&mut self, message: NewOutboxMessage) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        diesel::insert_into(outbox_events::table)
            .values(&NewDbOutboxEvent {
                id,
                aggregate_id: message.aggregate_id,
                topic: message.topic,
                partition_key: message.partition_key,
                event_type: message.event_type,
                event_data: message.payload,
            })
            .execute(&mut *self.conn)
            .await?;
        Ok(id)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        AnsiTransactionManager::commit_transaction(&mut *this.conn).await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        AnsiTransactionManager::rollback_transaction(&mut *this.conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError> {
        let mut conn = self.pool.get().await?;
        AnsiTransactionManager::begin_transaction(&mut *conn).await?;
        Ok(Box::new(PgUnitOfWork { conn }))
    }
}

#[async_trait]
impl StockLedger for PgStore {
    async fn product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let mut conn = self.pool.get().await?;
        Ok(load_product(&mut conn, id).await?.map(Product::from))
    }

    async fn products(&self) -> Result<Vec<Product>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = products::table
            .order(products::id.asc())
            .load::<DbProduct>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(Product::from).collect())
    }

    async fn apply_correction(
        &self,
        product_id: ProductId,
        new_quantity: i32,
        observed_version: i64,
    ) -> Result<Product, StoreError> {
        if new_quantity < 0 {
            return Err(StoreError::InvalidQuantity {
                product_id,
                quantity: new_quantity,
            });
        }

        let mut conn = self.pool.get().await?;
        let updated = diesel::update(
            products::table
                .filter(products::id.eq(product_id))
                .filter(products::version.eq(observed_version)),
        )
        .set((
            products::stock.eq(new_quantity),
            products::version.eq(products::version + 1),
        ))
        .get_result::<DbProduct>(&mut conn)
        .await
        .optional()?;

        match updated {
            Some(product) => Ok(product.into()),
            None => {
                let current = load_product(&mut conn, product_id)
                    .await?
                    .ok_or_else(|| StoreError::not_found(Entity::Product, product_id))?;
                Err(StoreError::StaleWrite {
                    product_id,
                    observed: observed_version,
                    current: current.version,
                })
            }
        }
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let mut conn = self.pool.get().await?;
        let header = orders::table
            .find(id)
            .first::<DbOrder>(&mut conn)
            .await
            .optional()?;

        match header {
            Some(header) => {
                let lines = load_lines(&mut conn, &[id]).await?;
                Ok(Some(assemble_order(header, lines)?))
            }
            None => Ok(None),
        }
    }

    async fn orders_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Order>, StoreError> {
        let mut conn = self.pool.get().await?;
        let headers = orders::table
            .filter(orders::customer_id.eq(customer_id))
            .order(orders::id.asc())
            .load::<DbOrder>(&mut conn)
            .await?;

        let ids: Vec<OrderId> = headers.iter().map(|order| order.id).collect();
        let mut lines_by_order: BTreeMap<OrderId, Vec<DbOrderLine>> = BTreeMap::new();
        for line in load_lines(&mut conn, &ids).await? {
            lines_by_order.entry(line.order_id).or_default().push(line);
        }

        headers
            .into_iter()
            .map(|header| {
                let lines = lines_by_order.remove(&header.id).unwrap_or_default();
                assemble_order(header, lines)
            })
            .collect()
    }
}

#[async_trait]
impl ShipmentStore for PgStore {
    async fn create_shipment(
        &self,
        order_id: OrderId,
        dispatched_at: DateTime<Utc>,
    ) -> Result<Shipment, StoreError> {
        let mut conn = self.pool.get().await?;
        let inserted = diesel::insert_into(shipments::table)
            .values(&NewDbShipment {
                order_id,
                dispatched_at,
                status: ShipmentStatus::Dispatched.as_str(),
            })
            .get_result::<DbShipment>(&mut conn)
            .await;

        match inserted {
            Ok(row) => Shipment::try_from(row),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => Err(StoreError::Duplicate {
                entity: Entity::Shipment,
                key: order_id,
            }),
            Err(DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _)) => {
                Err(StoreError::not_found(Entity::Order, order_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn shipment_for_order(&self, order_id: OrderId) -> Result<Option<Shipment>, StoreError> {
        let mut conn = self.pool.get().await?;
        let row = shipments::table
            .filter(shipments::order_id.eq(order_id))
            .first::<DbShipment>(&mut conn)
            .await
            .optional()?;
        row.map(Shipment::try_from).transpose()
    }
}

#[async_trait]
impl Outbox for PgStore {
    async fn pending(&self, limit: i64) -> Result<Vec<OutboxMessage>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(limit)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(OutboxMessage::from).collect())
    }

    async fn mark_processed(&self, id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        diesel::update(outbox_events::table.filter(outbox_events::id.eq(id)))
            .set(outbox_events::processed.eq(true))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
