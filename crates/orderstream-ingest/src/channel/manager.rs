//! Per-worker pair of channels (orders and order items)

use std::sync::Arc;

use orderstream_common::types::{Order, OrderItem};
use tracing::{debug, info, warn};

use super::{Channel, ChannelClient, ChannelError, OffsetToken, RowBatch, Target};
use crate::config::TargetConfig;

/// Last committed offsets found when a worker's channels were opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumePoint {
    pub last_order: Option<OffsetToken>,
    pub last_item: Option<OffsetToken>,
}

impl ResumePoint {
    pub fn is_fresh(&self) -> bool {
        self.last_order.is_none() && self.last_item.is_none()
    }
}

pub struct ChannelManager {
    client: Arc<dyn ChannelClient>,
    worker_id: u32,
    orders: Option<Channel>,
    items: Option<Channel>,
}

impl ChannelManager {
    pub fn new(client: Arc<dyn ChannelClient>, worker_id: u32) -> Self {
        Self {
            client,
            worker_id,
            orders: None,
            items: None,
        }
    }

    /// Channel name a worker uses for `base`; stable across runs so reopening resumes
    pub fn channel_name(base: &str, worker_id: u32) -> String {
        format!("{}_instance_{}", base, worker_id)
    }

    /// Open both channels and report where each left off
    pub async fn open(&mut self, targets: &TargetConfig) -> Result<ResumePoint, ChannelError> {
        let orders_name = Self::channel_name(&targets.orders_channel, self.worker_id);
        let items_name = Self::channel_name(&targets.order_items_channel, self.worker_id);

        let (orders, last_order) = self.client.open(Target::Orders, &orders_name).await?;
        self.orders = Some(orders);

        let (items, last_item) = self.client.open(Target::OrderItems, &items_name).await?;
        self.items = Some(items);

        let resume = ResumePoint {
            last_order,
            last_item,
        };

        if resume.is_fresh() {
            info!(
                worker_id = self.worker_id,
                orders_channel = %orders_name,
                items_channel = %items_name,
                "Opened channels"
            );
        } else {
            info!(
                worker_id = self.worker_id,
                orders_channel = %orders_name,
                items_channel = %items_name,
                last_order = ?last_order.map(|t| t.to_string()),
                last_item = ?last_item.map(|t| t.to_string()),
                "Reopened channels, resuming after last committed offsets"
            );
        }

        Ok(resume)
    }

    pub async fn insert_orders(&self, orders: &[Order]) -> Result<(), ChannelError> {
        self.insert(Target::Orders, RowBatch::Orders(orders)).await
    }

    pub async fn insert_items(&self, items: &[OrderItem]) -> Result<(), ChannelError> {
        self.insert(Target::OrderItems, RowBatch::Items(items)).await
    }

    async fn insert(&self, target: Target, rows: RowBatch<'_>) -> Result<(), ChannelError> {
        let channel = self.channel(target)?;
        let Some((start, end)) = rows.offset_range() else {
            return Ok(());
        };

        self.client.insert(channel, rows, &start, &end).await?;

        debug!(
            worker_id = self.worker_id,
            channel = channel.name(),
            rows = rows.len(),
            start = %start,
            end = %end,
            "Batch committed"
        );
        Ok(())
    }

    pub async fn latest_committed(&self, target: Target) -> Result<Option<OffsetToken>, ChannelError> {
        let channel = self.channel(target)?;
        self.client.latest_committed_offset(channel).await
    }

    fn channel(&self, target: Target) -> Result<&Channel, ChannelError> {
        let slot = match target {
            Target::Orders => &self.orders,
            Target::OrderItems => &self.items,
        };
        slot.as_ref().ok_or_else(|| {
            ChannelError::Closed(format!("{} channel of worker {} is not open", target, self.worker_id))
        })
    }

    /// Close whatever is open; failures are logged, never returned
    pub async fn close(&mut self) {
        for channel in [self.orders.as_mut(), self.items.as_mut()].into_iter().flatten() {
            if channel.is_closed() {
                continue;
            }
            match self.client.close(channel).await {
                Ok(()) => debug!(worker_id = self.worker_id, channel = channel.name(), "Channel closed"),
                Err(e) => warn!(
                    worker_id = self.worker_id,
                    channel = channel.name(),
                    error = %e,
                    "Failed to close channel cleanly"
                ),
            }
            channel.mark_closed();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::generator::{EntityGenerator, SegmentTable};
    use crate::store::memory::MemoryStore;
    use chrono::Utc;
    use orderstream_common::types::CustomerRange;

    fn generator(worker_id: u32) -> EntityGenerator {
        let range = CustomerRange::new(1, 100).unwrap();
        EntityGenerator::new(
            worker_id,
            7,
            SegmentTable::new(range, Vec::new()),
            Utc::now().naive_utc(),
        )
    }

    #[test]
    fn test_channel_name_per_worker() {
        assert_eq!(
            ChannelManager::channel_name("ORDERS_CHANNEL", 3),
            "ORDERS_CHANNEL_instance_3"
        );
    }

    #[tokio::test]
    async fn test_fresh_open_then_resume_offsets() {
        let store = Arc::new(MemoryStore::new());
        let targets = TargetConfig::default();
        let batch = generator(2).generate_batch(10);

        let mut manager = ChannelManager::new(store.clone(), 2);
        let resume = manager.open(&targets).await.unwrap();
        assert!(resume.is_fresh());

        manager.insert_orders(&batch.orders).await.unwrap();
        manager.insert_items(&batch.items).await.unwrap();
        assert_eq!(
            manager.latest_committed(Target::Orders).await.unwrap(),
            Some(OffsetToken::for_order(batch.orders.last().unwrap()))
        );
        manager.close().await;

        let mut reopened = ChannelManager::new(store, 2);
        let resume = reopened.open(&targets).await.unwrap();
        assert_eq!(resume.last_order, Some(OffsetToken::for_order(batch.orders.last().unwrap())));
        assert_eq!(resume.last_item, Some(OffsetToken::for_item(batch.items.last().unwrap())));
    }

    #[tokio::test]
    async fn test_insert_after_close_fails_and_close_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let batch = generator(0).generate_batch(2);

        let mut manager = ChannelManager::new(store, 0);
        manager.open(&TargetConfig::default()).await.unwrap();
        manager.close().await;
        manager.close().await;

        assert!(matches!(
            manager.insert_orders(&batch.orders).await,
            Err(ChannelError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_before_open_fails() {
        let store = Arc::new(MemoryStore::new());
        let batch = generator(0).generate_batch(1);
        let manager = ChannelManager::new(store, 0);
        assert!(manager.insert_orders(&batch.orders).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let mut manager = ChannelManager::new(store.clone(), 0);
        manager.open(&TargetConfig::default()).await.unwrap();
        manager.insert_orders(&[]).await.unwrap();
        assert_eq!(store.insert_attempts(Target::Orders).await, 0);
    }
}
