use shared::messaging::EventPublisher;
use std::sync::Arc;
use std::time::Duration;
use store::{Outbox, StoreError};
use tokio::time;
use tracing::{error, info, warn};

/// Resends outbox rows whose direct publish never succeeded.
pub struct OutboxRelay {
    outbox: Arc<dyn Outbox>,
    publisher: Arc<dyn EventPublisher>,
    interval: Duration,
    batch_size: i64,
}

impl OutboxRelay {
    pub fn new(outbox: Arc<dyn Outbox>, publisher: Arc<dyn EventPublisher>, interval: Duration) -> Self {
        Self {
            outbox,
            publisher,
            interval,
            batch_size: 100,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            if let Err(e) = self.relay_pending().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    /// Publishes one batch of pending rows in creation order. A row that fails
    /// stays pending for the next tick.
    pub async fn relay_pending(&self) -> Result<usize, StoreError> {
        let pending = self.outbox.pending(self.batch_size).await?;
        let mut relayed = 0;

        for message in pending {
            let payload = message.payload.to_string();
            if let Err(e) = self
                .publisher
                .publish(&message.topic, &message.partition_key, &payload)
                .await
            {
                warn!("Failed to publish outbox event {}: {}", message.id, e);
                continue;
            }

            self.outbox.mark_processed(message.id).await?;
            info!(
                "Published outbox event {} ({} for {})",
                message.id, message.event_type, message.aggregate_id
            );
            relayed += 1;
        }

        Ok(relayed)
    }
}
