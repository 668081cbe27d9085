use bigdecimal::BigDecimal;
use order_service::{OrderLineRequest, OrderService, RetryPolicy};
use shared::messaging::{Disposition, MemoryChannel, MessageHandler};
use shared::*;
use shipment_service::ShipmentCreator;
use std::str::FromStr;
use std::sync::Arc;
use store::{MemoryStore, ShipmentStore, StockLedger};

#[tokio::test]
async fn accepted_order_ends_up_with_one_dispatched_shipment() {
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(MemoryChannel::new());
    let customer = store.add_customer("Ada", "ada@example.com", "1 Loop Rd").unwrap();
    let product = store
        .add_product("Widget", "WID-1", BigDecimal::from_str("99.99").unwrap(), 50)
        .unwrap();

    let orders = OrderService::new(store.clone(), store.clone(), channel.clone(), RetryPolicy::default());
    let creator = ShipmentCreator::new(store.clone(), store.clone());

    let order = orders
        .create_order(
            customer.id,
            vec![OrderLineRequest {
                product_id: product.id,
                quantity: 2,
                price: BigDecimal::from_str("99.99").unwrap(),
            }],
        )
        .await
        .unwrap();

    let after = store.product(product.id).await.unwrap().unwrap();
    assert_eq!((after.stock, after.version), (48, 1));

    let published = channel.messages(ORDER_CREATED_TOPIC);
    assert_eq!(published.len(), 1);
    let event: OrderAcceptedEvent = serde_json::from_str(&published[0].payload).unwrap();
    assert_eq!(
        event.items,
        vec![OrderItemPayload {
            product_id: product.id,
            quantity: 2,
        }]
    );

    // At-least-once delivery: the same record arrives twice.
    for _ in 0..2 {
        assert_eq!(creator.handle(&published[0].payload).await, Disposition::Ack);
    }

    let shipment = store.shipment_for_order(order.id).await.unwrap().unwrap();
    assert_eq!(shipment.status, ShipmentStatus::Dispatched);
    assert_eq!(shipment.order_id, order.id);
}

#[tokio::test]
async fn rejected_order_publishes_nothing_to_ship() {
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(MemoryChannel::new());
    let customer = store.add_customer("Ada", "ada@example.com", "1 Loop Rd").unwrap();
    let product = store
        .add_product("Widget", "WID-1", BigDecimal::from_str("99.99").unwrap(), 1)
        .unwrap();

    let orders = OrderService::new(store.clone(), store.clone(), channel.clone(), RetryPolicy::default());
    let result = orders
        .create_order(
            customer.id,
            vec![OrderLineRequest {
                product_id: product.id,
                quantity: 2,
                price: BigDecimal::from_str("99.99").unwrap(),
            }],
        )
        .await;

    assert!(result.is_err());
    assert!(channel.messages(ORDER_CREATED_TOPIC).is_empty());
    let untouched = store.product(product.id).await.unwrap().unwrap();
    assert_eq!((untouched.stock, untouched.version), (1, 0));
}
