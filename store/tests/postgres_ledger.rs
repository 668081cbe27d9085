//! Ledger behavior against a real Postgres.
//!
//! Requires `TEST_DATABASE_URL`. Skips with a diagnostic message if absent.

use bigdecimal::BigDecimal;
use shared::Product;
use std::str::FromStr;
use store::{PgStore, StockLedger, Store, StoreError};
use uuid::Uuid;

async fn connect() -> Option<PgStore> {
    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("SKIP: TEST_DATABASE_URL not set");
            return None;
        }
    };
    store::run_migrations(&url).unwrap();
    Some(PgStore::connect(&url, 4).await.unwrap())
}

async fn product(store: &PgStore, stock: i32) -> Product {
    // Unique per run so repeated runs share one database.
    let sku = format!("SKU-{}", Uuid::new_v4());
    store
        .add_product("Widget", &sku, BigDecimal::from_str("9.99").unwrap(), stock)
        .await
        .unwrap()
}

#[tokio::test]
async fn opposite_order_reservations_conflict_instead_of_deadlocking() {
    let Some(store) = connect().await else { return };
    let first = product(&store, 10).await;
    let second = product(&store, 10).await;

    let mut a = store.begin().await.unwrap();
    let mut b = store.begin().await.unwrap();
    a.reserve(first.id, 1).await.unwrap();
    b.reserve(second.id, 1).await.unwrap();

    let err = a.reserve(second.id, 1).await.unwrap_err();
    assert!(matches!(err, StoreError::VersionConflict { expected: 0, .. }));
    let err = b.reserve(first.id, 1).await.unwrap_err();
    assert!(matches!(err, StoreError::VersionConflict { expected: 0, .. }));

    a.rollback().await.unwrap();
    b.rollback().await.unwrap();

    let mut retry = store.begin().await.unwrap();
    retry.reserve(second.id, 1).await.unwrap();
    retry.reserve(first.id, 1).await.unwrap();
    retry.commit().await.unwrap();

    for id in [first.id, second.id] {
        let current = store.product(id).await.unwrap().unwrap();
        assert_eq!((current.stock, current.version), (9, 1));
    }
}

#[tokio::test]
async fn reservation_in_one_unit_can_touch_a_product_twice() {
    let Some(store) = connect().await else { return };
    let widget = product(&store, 5).await;

    let mut uow = store.begin().await.unwrap();
    uow.reserve(widget.id, 2).await.unwrap();
    let second = uow.reserve(widget.id, 3).await.unwrap();
    assert_eq!((second.prior_quantity, second.new_version), (3, 2));
    uow.commit().await.unwrap();

    let current = store.product(widget.id).await.unwrap().unwrap();
    assert_eq!((current.stock, current.version), (0, 2));
}

#[tokio::test]
async fn stale_correction_is_refused() {
    let Some(store) = connect().await else { return };
    let widget = product(&store, 10).await;

    let corrected = store.apply_correction(widget.id, 25, 0).await.unwrap();
    assert_eq!((corrected.stock, corrected.version), (25, 1));

    let err = store.apply_correction(widget.id, 30, 0).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::StaleWrite {
            observed: 0,
            current: 1,
            ..
        }
    ));
}
