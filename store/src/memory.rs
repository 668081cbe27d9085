//! In-memory store for tests and local wiring.
//!
//! Mirrors the Postgres semantics that matter to the order flow: a reservation
//! claims its product row until the unit of work finishes, so a second writer
//! sees `VersionConflict`; staged writes become visible only on commit, and
//! commit re-checks every version it staged against. A correction on a claimed
//! product waits for the claim to be released, like an `UPDATE` waiting on a
//! row lock.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use shared::*;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    Entity, NewOutboxMessage, OrderStore, Outbox, OutboxMessage, ShipmentStore, StockLedger, Store, StoreError,
    UnitOfWork,
};

type TxId = u64;

#[derive(Debug)]
struct ProductRow {
    product: Product,
    claimed_by: Option<TxId>,
}

#[derive(Debug)]
struct OutboxRow {
    message: OutboxMessage,
    processed: bool,
}

#[derive(Debug, Default)]
struct State {
    customers: BTreeMap<CustomerId, Customer>,
    products: BTreeMap<ProductId, ProductRow>,
    orders: BTreeMap<OrderId, Order>,
    shipments: BTreeMap<ShipmentId, Shipment>,
    outbox: Vec<OutboxRow>,
    next_id: i64,
    next_tx: TxId,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    released: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    pub fn add_customer(&self, name: &str, email: &str, address: &str) -> Result<Customer, StoreError> {
        let mut state = self.lock()?;
        let customer = Customer {
            id: state.next_id(),
            name: name.to_string(),
            email: email.to_string(),
            address: address.to_string(),
        };
        state.customers.insert(customer.id, customer.clone());
        Ok(customer)
    }

    pub fn add_product(&self, name: &str, sku: &str, price: BigDecimal, stock: i32) -> Result<Product, StoreError> {
        if stock < 0 {
            return Err(StoreError::InvalidQuantity {
                product_id: 0,
                quantity: stock,
            });
        }
        let mut state = self.lock()?;
        if state.products.values().any(|row| row.product.sku == sku) {
            return Err(StoreError::Corrupt(format!("duplicate sku {}", sku)));
        }
        let product = Product {
            id: state.next_id(),
            name: name.to_string(),
            sku: sku.to_string(),
            price,
            stock,
            version: 0,
        };
        state.products.insert(
            product.id,
            ProductRow {
                product: product.clone(),
                claimed_by: None,
            },
        );
        Ok(product)
    }

    fn release(&self, tx: TxId) {
        if let Ok(mut state) = self.state.lock() {
            for row in state.products.values_mut() {
                if row.claimed_by == Some(tx) {
                    row.claimed_by = None;
                }
            }
        }
        self.released.notify_waiters();
    }
}

#[derive(Debug)]
struct StagedStock {
    product_id: ProductId,
    base_version: i64,
    stock: i32,
    version: i64,
}

pub struct MemoryUnitOfWork<'a> {
    store: &'a MemoryStore,
    tx: TxId,
    staged: Vec<StagedStock>,
    orders: Vec<Order>,
    outbox: Vec<OutboxMessage>,
    finished: bool,
}

impl Drop for MemoryUnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.store.release(self.tx);
        }
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork<'_> {
    async fn find_customer(&mut self, id: CustomerId) -> Result<Option<Customer>, StoreError> {
        Ok(self.store.lock()?.customers.get(&id).cloned())
    }

    async fn reserve(&mut self, product_id: ProductId, quantity: i32) -> Result<Reservation, StoreError> {
        let mut state = self.store.lock()?;
        let row = state
            .products
            .get_mut(&product_id)
            .ok_or_else(|| StoreError::not_found(Entity::Product, product_id))?;

        let staged = self.staged.iter_mut().find(|s| s.product_id == product_id);
        let (stock, version) = match &staged {
            Some(s) => (s.stock, s.version),
            None => (row.product.stock, row.product.version),
        };

        if stock < quantity {
            return Err(StoreError::InsufficientStock {
                product_id,
                requested: quantity,
                available: stock,
            });
        }

        match row.claimed_by {
            Some(owner) if owner != self.tx => {
                return Err(StoreError::VersionConflict {
                    product_id,
                    expected: version,
                });
            }
            _ => row.claimed_by = Some(self.tx),
        }

        match staged {
            Some(s) => {
                s.stock -= quantity;
                s.version += 1;
            }
            None => self.staged.push(StagedStock {
                product_id,
                base_version: version,
                stock: stock - quantity,
                version: version + 1,
            }),
        }

        Ok(Reservation {
            product_id,
            new_version: version + 1,
            prior_quantity: stock,
        })
    }

    async fn insert_order(&mut self, order: NewOrder) -> Result<Order, StoreError> {
        let id = self.store.lock()?.next_id();
        let order = Order {
            id,
            customer_id: order.customer_id,
            order_date: order.order_date,
            status: OrderStatus::Pending,
            lines: order
                .lines
                .into_iter()
                .map(|line| OrderLine {
                    order_id: id,
                    product_id: line.product_id,
                    quantity: line.quantity,
                    price: line.price,
                })
                .collect(),
        };
        self.orders.push(order.clone());
        Ok(order)
    }

    async fn enqueue(&mut self, message: NewOutboxMessage) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.outbox.push(OutboxMessage {
            id,
            aggregate_id: message.aggregate_id,
            topic: message.topic,
            partition_key: message.partition_key,
            event_type: message.event_type,
            payload: message.payload,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        let mut state = this.store.lock()?;

        for staged in &this.staged {
            let current = state
                .products
                .get(&staged.product_id)
                .map(|row| row.product.version)
                .ok_or_else(|| StoreError::not_found(Entity::Product, staged.product_id))?;
            if current != staged.base_version {
                return Err(StoreError::VersionConflict {
                    product_id: staged.product_id,
                    expected: staged.base_version,
                });
            }
        }

        for staged in this.staged.drain(..) {
            if let Some(row) = state.products.get_mut(&staged.product_id) {
                row.product.stock = staged.stock;
                row.product.version = staged.version;
                row.claimed_by = None;
            }
        }
        for order in this.orders.drain(..) {
            state.orders.insert(order.id, order);
        }
        for message in this.outbox.drain(..) {
            state.outbox.push(OutboxRow {
                message,
                processed: false,
            });
        }

        drop(state);
        this.finished = true;
        this.store.released.notify_waiters();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        this.store.release(this.tx);
        this.finished = true;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError> {
        let tx = {
            let mut state = self.lock()?;
            state.next_tx += 1;
            state.next_tx
        };
        Ok(Box::new(MemoryUnitOfWork {
            store: self,
            tx,
            staged: Vec::new(),
            orders: Vec::new(),
            outbox: Vec::new(),
            finished: false,
        }))
    }
}

#[async_trait]
impl StockLedger for MemoryStore {
    async fn product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.lock()?.products.get(&id).map(|row| row.product.clone()))
    }

    async fn products(&self) -> Result<Vec<Product>, StoreError> {
        Ok(self.lock()?.products.values().map(|row| row.product.clone()).collect())
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

        loop {
            // Registered before checking so a release in between is not missed.
            let released = self.released.notified();
            {
                let mut state = self.lock()?;
                let row = state
                    .products
                    .get_mut(&product_id)
                    .ok_or_else(|| StoreError::not_found(Entity::Product, product_id))?;

                if row.claimed_by.is_none() {
                    if row.product.version != observed_version {
                        return Err(StoreError::StaleWrite {
                            product_id,
                            observed: observed_version,
                            current: row.product.version,
                        });
                    }

                    row.product.stock = new_quantity;
                    row.product.version += 1;
                    return Ok(row.product.clone());
                }
            }
            released.await;
        }
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.lock()?.orders.get(&id).cloned())
    }

    async fn orders_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Order>, StoreError> {
        Ok(self
            .lock()?
            .orders
            .values()
            .filter(|order| order.customer_id == customer_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ShipmentStore for MemoryStore {
    async fn create_shipment(
        &self,
        order_id: OrderId,
        dispatched_at: DateTime<Utc>,
    ) -> Result<Shipment, StoreError> {
        let mut state = self.lock()?;
        if !state.orders.contains_key(&order_id) {
            return Err(StoreError::not_found(Entity::Order, order_id));
        }
        if state.shipments.values().any(|s| s.order_id == order_id) {
            return Err(StoreError::Duplicate {
                entity: Entity::Shipment,
                key: order_id,
            });
        }

        let shipment = Shipment {
            id: state.next_id(),
            order_id,
            dispatched_at,
            delivered_at: None,
            status: ShipmentStatus::Dispatched,
        };
        state.shipments.insert(shipment.id, shipment.clone());
        Ok(shipment)
    }

    async fn shipment_for_order(&self, order_id: OrderId) -> Result<Option<Shipment>, StoreError> {
        Ok(self
            .lock()?
            .shipments
            .values()
            .find(|s| s.order_id == order_id)
            .cloned())
    }
}

#[async_trait]
impl Outbox for MemoryStore {
    async fn pending(&self, limit: i64) -> Result<Vec<OutboxMessage>, StoreError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .lock()?
            .outbox
            .iter()
            .filter(|row| !row.processed)
            .take(limit)
            .map(|row| row.message.clone())
            .collect())
    }

    async fn mark_processed(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if let Some(row) = state.outbox.iter_mut().find(|row| row.message.id == id) {
            row.processed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;

    fn price(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).unwrap()
    }

    fn seeded(stock: i32) -> (MemoryStore, Product) {
        let store = MemoryStore::new();
        let product = store.add_product("Widget", "WID-1", price("99.99"), stock).unwrap();
        (store, product)
    }

    async fn stock_and_version(store: &MemoryStore, id: ProductId) -> (i32, i64) {
        let product = store.product(id).await.unwrap().unwrap();
        (product.stock, product.version)
    }

    #[tokio::test]
    async fn committed_reservation_decrements_stock_and_bumps_version() {
        let (store, product) = seeded(50);

        let mut uow = store.begin().await.unwrap();
        let reservation = uow.reserve(product.id, 2).await.unwrap();
        assert_eq!(reservation.new_version, 1);
        assert_eq!(reservation.prior_quantity, 50);

        // Not visible before commit.
        assert_eq!(stock_and_version(&store, product.id).await, (50, 0));

        uow.commit().await.unwrap();
        assert_eq!(stock_and_version(&store, product.id).await, (48, 1));
    }

    #[tokio::test]
    async fn repeated_reservations_in_one_unit_stack_up() {
        let (store, product) = seeded(5);

        let mut uow = store.begin().await.unwrap();
        uow.reserve(product.id, 2).await.unwrap();
        let second = uow.reserve(product.id, 3).await.unwrap();
        assert_eq!(second.prior_quantity, 3);
        assert_eq!(second.new_version, 2);

        let err = uow.reserve(product.id, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::InsufficientStock { available: 0, .. }));

        uow.commit().await.unwrap();
        assert_eq!(stock_and_version(&store, product.id).await, (0, 2));
    }

    #[tokio::test]
    async fn insufficient_and_missing_products_leave_state_untouched() {
        let (store, product) = seeded(1);

        let mut uow = store.begin().await.unwrap();
        let err = uow.reserve(product.id, 2).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientStock {
                requested: 2,
                available: 1,
                ..
            }
        ));
        let err = uow.reserve(9999, 1).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::NotFound {
                entity: Entity::Product,
                id: 9999
            }
        ));
        uow.rollback().await.unwrap();

        assert_eq!(stock_and_version(&store, product.id).await, (1, 0));
    }

    #[tokio::test]
    async fn claimed_product_conflicts_until_released() {
        let (store, product) = seeded(10);

        let mut first = store.begin().await.unwrap();
        first.reserve(product.id, 1).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let err = second.reserve(product.id, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 0, .. }));
        second.rollback().await.unwrap();

        first.rollback().await.unwrap();

        let mut third = store.begin().await.unwrap();
        third.reserve(product.id, 1).await.unwrap();
        third.commit().await.unwrap();
        assert_eq!(stock_and_version(&store, product.id).await, (9, 1));
    }

    #[tokio::test]
    async fn dropping_an_unfinished_unit_releases_its_claims() {
        let (store, product) = seeded(10);

        {
            let mut abandoned = store.begin().await.unwrap();
            abandoned.reserve(product.id, 4).await.unwrap();
        }

        let mut next = store.begin().await.unwrap();
        next.reserve(product.id, 1).await.unwrap();
        next.commit().await.unwrap();
        assert_eq!(stock_and_version(&store, product.id).await, (9, 1));
    }

    #[tokio::test]
    async fn correction_waits_for_a_claim_and_loses_to_its_commit() {
        let store = Arc::new(MemoryStore::new());
        let product = store.add_product("Widget", "WID-1", price("99.99"), 10).unwrap();

        let mut uow = store.begin().await.unwrap();
        uow.reserve(product.id, 3).await.unwrap();

        let correction = {
            let store = store.clone();
            let id = product.id;
            tokio::spawn(async move { store.apply_correction(id, 100, 0).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!correction.is_finished());

        uow.commit().await.unwrap();

        let err = correction.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            StoreError::StaleWrite {
                observed: 0,
                current: 1,
                ..
            }
        ));
        assert_eq!(stock_and_version(&store, product.id).await, (7, 1));
    }

    #[tokio::test]
    async fn correction_applies_once_a_claim_is_rolled_back() {
        let store = Arc::new(MemoryStore::new());
        let product = store.add_product("Widget", "WID-1", price("99.99"), 10).unwrap();

        let mut uow = store.begin().await.unwrap();
        uow.reserve(product.id, 3).await.unwrap();

        let correction = {
            let store = store.clone();
            let id = product.id;
            tokio::spawn(async move { store.apply_correction(id, 100, 0).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        uow.rollback().await.unwrap();

        let corrected = correction.await.unwrap().unwrap();
        assert_eq!((corrected.stock, corrected.version), (100, 1));
    }

    #[tokio::test]
    async fn opposite_order_reservations_conflict_instead_of_waiting() {
        let store = MemoryStore::new();
        let first = store.add_product("Bolt", "BLT-1", price("1.50"), 10).unwrap();
        let second = store.add_product("Gear", "GR-1", price("12.00"), 10).unwrap();

        let mut a = store.begin().await.unwrap();
        let mut b = store.begin().await.unwrap();
        a.reserve(first.id, 1).await.unwrap();
        b.reserve(second.id, 1).await.unwrap();

        assert!(matches!(
            a.reserve(second.id, 1).await.unwrap_err(),
            StoreError::VersionConflict { .. }
        ));
        assert!(matches!(
            b.reserve(first.id, 1).await.unwrap_err(),
            StoreError::VersionConflict { .. }
        ));
        a.rollback().await.unwrap();
        b.rollback().await.unwrap();

        let mut retry = store.begin().await.unwrap();
        retry.reserve(second.id, 1).await.unwrap();
        retry.reserve(first.id, 1).await.unwrap();
        retry.commit().await.unwrap();
        assert_eq!(stock_and_version(&store, first.id).await, (9, 1));
        assert_eq!(stock_and_version(&store, second.id).await, (9, 1));
    }

    #[tokio::test]
    async fn products_are_listed_by_id() {
        let store = MemoryStore::new();
        let bolt = store.add_product("Bolt", "BLT-1", price("1.50"), 10).unwrap();
        let gear = store.add_product("Gear", "GR-1", price("12.00"), 0).unwrap();

        assert_eq!(store.products().await.unwrap(), vec![bolt, gear]);
    }

    #[tokio::test]
    async fn correction_requires_the_current_version() {
        let (store, product) = seeded(10);

        let corrected = store.apply_correction(product.id, 25, 0).await.unwrap();
        assert_eq!((corrected.stock, corrected.version), (25, 1));

        let err = store.apply_correction(product.id, 30, 0).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::StaleWrite {
                observed: 0,
                current: 1,
                ..
            }
        ));

        let err = store.apply_correction(777, 30, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        let err = store.apply_correction(product.id, -1, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuantity { quantity: -1, .. }));

        assert_eq!(stock_and_version(&store, product.id).await, (25, 1));
    }

    #[tokio::test]
    async fn orders_and_outbox_appear_only_after_commit() {
        let (store, product) = seeded(10);
        let customer = store.add_customer("Ada", "ada@example.com", "1 Loop Rd").unwrap();

        let mut uow = store.begin().await.unwrap();
        let order = uow
            .insert_order(NewOrder {
                customer_id: customer.id,
                order_date: Utc::now(),
                lines: vec![NewOrderLine {
                    product_id: product.id,
                    quantity: 1,
                    price: price("99.99"),
                }],
            })
            .await
            .unwrap();
        let event = OrderAcceptedEvent::from(&order);
        let message_id = uow
            .enqueue(NewOutboxMessage::order_accepted(&event).unwrap())
            .await
            .unwrap();

        assert!(store.order(order.id).await.unwrap().is_none());
        assert!(store.pending(10).await.unwrap().is_empty());

        uow.commit().await.unwrap();

        assert_eq!(store.order(order.id).await.unwrap(), Some(order.clone()));
        assert_eq!(store.orders_for_customer(customer.id).await.unwrap(), vec![order]);

        let pending = store.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, message_id);
        assert_eq!(pending[0].topic, ORDER_CREATED_TOPIC);

        store.mark_processed(message_id).await.unwrap();
        assert!(store.pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_shipment_per_order() {
        let store = MemoryStore::new();
        let customer = store.add_customer("Ada", "ada@example.com", "1 Loop Rd").unwrap();
        let mut uow = store.begin().await.unwrap();
        let order = uow
            .insert_order(NewOrder {
                customer_id: customer.id,
                order_date: Utc::now(),
                lines: vec![],
            })
            .await
            .unwrap();
        uow.commit().await.unwrap();

        let shipment = store.create_shipment(order.id, Utc::now()).await.unwrap();
        assert_eq!(shipment.status, ShipmentStatus::Dispatched);

        let err = store.create_shipment(order.id, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Duplicate {
                entity: Entity::Shipment,
                ..
            }
        ));
        assert_eq!(store.shipment_for_order(order.id).await.unwrap(), Some(shipment));

        let err = store.create_shipment(order.id + 100, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: Entity::Order, .. }));
    }
}
