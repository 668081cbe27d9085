use async_trait::async_trait;
use shared::messaging::{decode, Disposition, MessageHandler};
use shared::*;
use std::sync::Arc;
use store::{StockLedger, StoreError};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Applied(Product),
    /// The sender's observed version is behind; the correction is dropped.
    Stale { observed: i64, current: i64 },
    UnknownProduct,
    Rejected { quantity: i32 },
}

pub struct InventoryReconciler {
    ledger: Arc<dyn StockLedger>,
}

impl InventoryReconciler {
    pub fn new(ledger: Arc<dyn StockLedger>) -> Self {
        Self { ledger }
    }

    /// Every terminal outcome is an `Ok`; only storage failures are errors.
    pub async fn reconcile(&self, event: &InventoryChangedEvent) -> Result<Reconciliation, StoreError> {
        match self
            .ledger
            .apply_correction(event.product_id, event.new_stock, event.version)
            .await
        {
            Ok(product) => Ok(Reconciliation::Applied(product)),
            Err(StoreError::StaleWrite { observed, current, .. }) => Ok(Reconciliation::Stale { observed, current }),
            Err(StoreError::NotFound { .. }) => Ok(Reconciliation::UnknownProduct),
            Err(StoreError::InvalidQuantity { quantity, .. }) => Ok(Reconciliation::Rejected { quantity }),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl MessageHandler for InventoryReconciler {
    async fn handle(&self, payload: &str) -> Disposition {
        let Some(event) = decode::<InventoryChangedEvent>(payload) else {
            return Disposition::Ack;
        };

        match self.reconcile(&event).await {
            Ok(Reconciliation::Applied(product)) => {
                info!(
                    "Stock for product {} set to {} (version {})",
                    product.id, product.stock, product.version
                );
                Disposition::Ack
            }
            Ok(Reconciliation::Stale { observed, current }) => {
                warn!(
                    "Discarding stale correction for product {}: observed version {}, current {}",
                    event.product_id, observed, current
                );
                Disposition::Ack
            }
            Ok(Reconciliation::UnknownProduct) => {
                error!("Correction for unknown product {}", event.product_id);
                Disposition::Ack
            }
            Ok(Reconciliation::Rejected { quantity }) => {
                error!(
                    "Rejected negative stock {} for product {}",
                    quantity, event.product_id
                );
                Disposition::Ack
            }
            Err(e) => {
                error!("Failed to apply correction for product {}: {}", event.product_id, e);
                Disposition::Retry
            }
        }
    }
}
