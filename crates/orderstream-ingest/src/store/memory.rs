//! In-process store for dry runs and tests
//!
//! Behaves like the Postgres store (append-only rows with a surrogate
//! `row_id`, per-channel committed offsets, the same reconciliation
//! semantics) and can be told to misbehave through [`Fault`]s.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use orderstream_common::types::{Customer, CustomerRange, Order, OrderItem, Segment};
use tokio::sync::Mutex;

use super::{CustomerDirectory, ReconciliationStore, StoreError};
use crate::channel::{Channel, ChannelClient, ChannelError, OffsetToken, RowBatch, Target};
use crate::generator::generate_customers;

/// Row as stored, with its insertion-ordered surrogate key
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow<T> {
    pub row_id: u64,
    pub row: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Answer with backpressure, commit nothing
    Backpressure,
    /// Answer with a non-retryable rejection, commit nothing
    Reject,
    /// Commit the rows, then answer with backpressure (the caller will resend)
    CommitThenBackpressure,
    /// Panic inside the insert call
    Panic,
}

/// Injected misbehavior for insert calls on one target
#[derive(Debug, Clone)]
pub struct Fault {
    target: Target,
    kind: FaultKind,
    channel: Option<String>,
    skip: u64,
    remaining: u64,
}

impl Fault {
    /// Fires once on the next matching insert
    pub fn new(target: Target, kind: FaultKind) -> Self {
        Self {
            target,
            kind,
            channel: None,
            skip: 0,
            remaining: 1,
        }
    }

    pub fn backpressure(target: Target) -> Self {
        Self::new(target, FaultKind::Backpressure)
    }

    pub fn reject(target: Target) -> Self {
        Self::new(target, FaultKind::Reject)
    }

    pub fn commit_then_backpressure(target: Target) -> Self {
        Self::new(target, FaultKind::CommitThenBackpressure)
    }

    pub fn panic(target: Target) -> Self {
        Self::new(target, FaultKind::Panic)
    }

    /// Fire `n` times
    pub fn times(mut self, n: u64) -> Self {
        self.remaining = n;
        self
    }

    /// Fire on every matching insert
    pub fn always(self) -> Self {
        self.times(u64::MAX)
    }

    /// Let `n` matching inserts through first
    pub fn after(mut self, n: u64) -> Self {
        self.skip = n;
        self
    }

    /// Only match inserts on the channel named `name`
    pub fn on_channel(mut self, name: impl Into<String>) -> Self {
        self.channel = Some(name.into());
        self
    }

    fn matches(&self, channel: &Channel) -> bool {
        self.target == channel.target()
            && self.channel.as_deref().map_or(true, |name| name == channel.name())
    }
}

#[derive(Debug, Clone)]
struct ChannelRecord {
    target: Target,
    last_committed: Option<OffsetToken>,
    open: bool,
    opens: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    customers: BTreeMap<i64, Segment>,
    orders: Vec<StoredRow<Order>>,
    items: Vec<StoredRow<OrderItem>>,
    channels: HashMap<String, ChannelRecord>,
    faults: Vec<Fault>,
    insert_attempts: HashMap<Target, u64>,
    next_row_id: u64,
}

impl MemoryState {
    fn next_row_id(&mut self) -> u64 {
        self.next_row_id += 1;
        self.next_row_id
    }

    fn append(&mut self, rows: &RowBatch<'_>) {
        match rows {
            RowBatch::Orders(orders) => {
                for order in orders.iter() {
                    let row_id = self.next_row_id();
                    self.orders.push(StoredRow {
                        row_id,
                        row: order.clone(),
                    });
                }
            },
            RowBatch::Items(items) => {
                for item in items.iter() {
                    let row_id = self.next_row_id();
                    self.items.push(StoredRow {
                        row_id,
                        row: item.clone(),
                    });
                }
            },
        }
    }

    /// First armed fault for `channel`, consuming one firing
    fn take_fault(&mut self, channel: &Channel) -> Option<FaultKind> {
        for fault in self.faults.iter_mut().filter(|f| f.matches(channel)) {
            if fault.skip > 0 {
                fault.skip -= 1;
                continue;
            }
            if fault.remaining > 0 {
                if fault.remaining != u64::MAX {
                    fault.remaining -= 1;
                }
                return Some(fault.kind);
            }
        }
        None
    }

    fn order_ids(&self) -> HashSet<i64> {
        self.orders.iter().map(|r| r.row.order_id).collect()
    }

    fn item_order_ids(&self) -> HashSet<i64> {
        self.items.iter().map(|r| r.row.order_id).collect()
    }
}

/// Take at most `limit` distinct values from `ids` in first-seen order
fn first_distinct(ids: impl Iterator<Item = i64>, limit: u64) -> HashSet<i64> {
    let mut picked = HashSet::new();
    for id in ids {
        if picked.len() as u64 >= limit {
            break;
        }
        picked.insert(id);
    }
    picked
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with `count` customers (ids `1..=count`)
    pub fn with_customers(count: u64, seed: u64) -> Self {
        let mut store = Self::new();
        let customers = generate_customers(count, seed)
            .into_iter()
            .map(|c| (c.customer_id, c.segment))
            .collect();
        store.state.get_mut().customers = customers;
        store
    }

    pub async fn inject(&self, fault: Fault) {
        self.state.lock().await.faults.push(fault);
    }

    /// Write rows directly, bypassing channels and their offsets
    pub async fn insert_raw_orders(&self, orders: &[Order]) {
        self.state.lock().await.append(&RowBatch::Orders(orders));
    }

    /// Write rows directly, bypassing channels and their offsets
    pub async fn insert_raw_items(&self, items: &[OrderItem]) {
        self.state.lock().await.append(&RowBatch::Items(items));
    }

    pub async fn orders(&self) -> Vec<StoredRow<Order>> {
        self.state.lock().await.orders.clone()
    }

    pub async fn items(&self) -> Vec<StoredRow<OrderItem>> {
        self.state.lock().await.items.clone()
    }

    /// Insert calls seen for `target`, including rejected ones
    pub async fn insert_attempts(&self, target: Target) -> u64 {
        self.state
            .lock()
            .await
            .insert_attempts
            .get(&target)
            .copied()
            .unwrap_or(0)
    }

    pub async fn committed_offset(&self, channel: &str) -> Option<OffsetToken> {
        self.state
            .lock()
            .await
            .channels
            .get(channel)
            .and_then(|c| c.last_committed)
    }

    pub async fn is_channel_open(&self, channel: &str) -> bool {
        self.state
            .lock()
            .await
            .channels
            .get(channel)
            .is_some_and(|c| c.open)
    }

    /// Times `channel` has been opened
    pub async fn channel_opens(&self, channel: &str) -> u32 {
        self.state
            .lock()
            .await
            .channels
            .get(channel)
            .map_or(0, |c| c.opens)
    }
}

#[async_trait]
impl ChannelClient for MemoryStore {
    async fn open(
        &self,
        target: Target,
        name: &str,
    ) -> Result<(Channel, Option<OffsetToken>), ChannelError> {
        let mut state = self.state.lock().await;
        let record = state
            .channels
            .entry(name.to_string())
            .or_insert_with(|| ChannelRecord {
                target,
                last_committed: None,
                open: false,
                opens: 0,
            });

        if record.target != target {
            return Err(ChannelError::TargetMismatch {
                channel: name.to_string(),
                expected: record.target,
                actual: target,
            });
        }

        record.open = true;
        record.opens += 1;
        let last = record.last_committed;
        Ok((Channel::new(target, name, last), last))
    }

    async fn insert(
        &self,
        channel: &Channel,
        rows: RowBatch<'_>,
        start: &OffsetToken,
        end: &OffsetToken,
    ) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        *state.insert_attempts.entry(channel.target()).or_default() += 1;

        channel.check_insert(&rows, start, end)?;
        if !state.channels.get(channel.name()).is_some_and(|c| c.open) {
            return Err(ChannelError::Closed(channel.name().to_string()));
        }

        let fault = state.take_fault(channel);
        match fault {
            Some(FaultKind::Backpressure) => {
                return Err(ChannelError::Backpressure {
                    channel: channel.name().to_string(),
                    message: "injected backpressure".to_string(),
                })
            },
            Some(FaultKind::Reject) => {
                return Err(ChannelError::Rejected {
                    channel: channel.name().to_string(),
                    message: "injected rejection".to_string(),
                })
            },
            Some(FaultKind::Panic) => {
                drop(state);
                panic!("injected panic on channel {}", channel.name());
            },
            Some(FaultKind::CommitThenBackpressure) | None => {},
        }

        state.append(&rows);
        if let Some(record) = state.channels.get_mut(channel.name()) {
            record.last_committed = Some(*end);
        }

        if fault == Some(FaultKind::CommitThenBackpressure) {
            return Err(ChannelError::Backpressure {
                channel: channel.name().to_string(),
                message: "injected backpressure after commit".to_string(),
            });
        }
        Ok(())
    }

    async fn latest_committed_offset(
        &self,
        channel: &Channel,
    ) -> Result<Option<OffsetToken>, ChannelError> {
        Ok(self
            .state
            .lock()
            .await
            .channels
            .get(channel.name())
            .and_then(|c| c.last_committed))
    }

    async fn close(&self, channel: &mut Channel) -> Result<(), ChannelError> {
        if channel.is_closed() {
            return Ok(());
        }
        channel.mark_closed();
        if let Some(record) = self.state.lock().await.channels.get_mut(channel.name()) {
            record.open = false;
        }
        Ok(())
    }
}

#[async_trait]
impl CustomerDirectory for MemoryStore {
    async fn max_customer_id(&self) -> Result<i64, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .customers
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    async fn segments_in_range(&self, range: CustomerRange) -> Result<Vec<Customer>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .customers
            .range(range.start()..=range.end())
            .map(|(&customer_id, &segment)| Customer {
                customer_id,
                segment,
            })
            .collect())
    }
}

#[async_trait]
impl ReconciliationStore for MemoryStore {
    async fn delete_orphaned_orders(&self, limit: u64) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let parents_with_children = state.item_order_ids();
        let doomed = first_distinct(
            state
                .orders
                .iter()
                .map(|r| r.row.order_id)
                .filter(|id| !parents_with_children.contains(id)),
            limit,
        );
        let before = state.orders.len();
        state.orders.retain(|r| !doomed.contains(&r.row.order_id));
        Ok((before - state.orders.len()) as u64)
    }

    async fn delete_orphaned_items(&self, limit: u64) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let parents = state.order_ids();
        let doomed = first_distinct(
            state
                .items
                .iter()
                .map(|r| r.row.order_id)
                .filter(|id| !parents.contains(id)),
            limit,
        );
        let before = state.items.len();
        state.items.retain(|r| !doomed.contains(&r.row.order_id));
        Ok((before - state.items.len()) as u64)
    }

    async fn count_duplicate_orders(&self) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok((state.orders.len() - state.order_ids().len()) as u64)
    }

    async fn delete_duplicate_orders(&self, limit: u64) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;

        // Earliest (order_date, row_id) per order_id survives
        let mut keepers: HashMap<i64, (chrono::NaiveDateTime, u64)> = HashMap::new();
        for stored in &state.orders {
            let key = (stored.row.order_date, stored.row_id);
            keepers
                .entry(stored.row.order_id)
                .and_modify(|best| {
                    if key < *best {
                        *best = key;
                    }
                })
                .or_insert(key);
        }

        let doomed: HashSet<u64> = state
            .orders
            .iter()
            .filter(|r| keepers.get(&r.row.order_id).is_some_and(|best| best.1 != r.row_id))
            .map(|r| r.row_id)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect();

        state.orders.retain(|r| !doomed.contains(&r.row_id));
        Ok(doomed.len() as u64)
    }

    async fn count_orders(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.orders.len() as u64)
    }

    async fn count_items(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.items.len() as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::generator::{EntityGenerator, GeneratedBatch, SegmentTable};
    use chrono::Utc;

    fn batch(worker_id: u32, count: usize) -> GeneratedBatch {
        let range = CustomerRange::new(1, 50).unwrap();
        EntityGenerator::new(worker_id, 1, SegmentTable::new(range, Vec::new()), Utc::now().naive_utc())
            .generate_batch(count)
    }

    async fn open(store: &MemoryStore, target: Target, name: &str) -> Channel {
        store.open(target, name).await.unwrap().0
    }

    fn range_of(rows: RowBatch<'_>) -> (OffsetToken, OffsetToken) {
        rows.offset_range().unwrap()
    }

    #[tokio::test]
    async fn test_customers_by_range() {
        let store = MemoryStore::with_customers(100, 1);
        assert_eq!(store.max_customer_id().await.unwrap(), 100);

        let range = CustomerRange::new(21, 40).unwrap();
        let customers = store.segments_in_range(range).await.unwrap();
        assert_eq!(customers.len(), 20);
        assert_eq!(customers[0].customer_id, 21);

        assert_eq!(MemoryStore::new().max_customer_id().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_channel_rebinding_to_other_target_fails() {
        let store = MemoryStore::new();
        open(&store, Target::Orders, "c").await;
        assert!(matches!(
            store.open(Target::OrderItems, "c").await,
            Err(ChannelError::TargetMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_backpressure_fault_commits_nothing() {
        let store = MemoryStore::new();
        let channel = open(&store, Target::Orders, "orders").await;
        let rows = batch(0, 5);
        let (start, end) = range_of(RowBatch::Orders(&rows.orders));

        store.inject(Fault::backpressure(Target::Orders).times(2)).await;
        for _ in 0..2 {
            let err = store
                .insert(&channel, RowBatch::Orders(&rows.orders), &start, &end)
                .await
                .unwrap_err();
            assert!(err.is_backpressure());
        }
        assert_eq!(store.count_orders().await.unwrap(), 0);
        assert_eq!(store.committed_offset("orders").await, None);

        store
            .insert(&channel, RowBatch::Orders(&rows.orders), &start, &end)
            .await
            .unwrap();
        assert_eq!(store.count_orders().await.unwrap(), 5);
        assert_eq!(store.committed_offset("orders").await, Some(end));
        assert_eq!(store.insert_attempts(Target::Orders).await, 3);
    }

    #[tokio::test]
    async fn test_fault_after_skips_inserts() {
        let store = MemoryStore::new();
        let channel = open(&store, Target::OrderItems, "items").await;
        store.inject(Fault::reject(Target::OrderItems).after(1)).await;

        let rows = batch(0, 2);
        let (start, end) = range_of(RowBatch::Items(&rows.items));
        assert!(store
            .insert(&channel, RowBatch::Items(&rows.items), &start, &end)
            .await
            .is_ok());

        let err = store
            .insert(&channel, RowBatch::Items(&rows.items), &start, &end)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_insert_on_closed_channel_fails() {
        let store = MemoryStore::new();
        let mut channel = open(&store, Target::Orders, "orders").await;
        store.close(&mut channel).await.unwrap();
        store.close(&mut channel).await.unwrap();
        assert!(!store.is_channel_open("orders").await);

        let rows = batch(0, 1);
        let (start, end) = range_of(RowBatch::Orders(&rows.orders));
        assert!(store
            .insert(&channel, RowBatch::Orders(&rows.orders), &start, &end)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_reconciliation_deletes_respect_limit() {
        let store = MemoryStore::new();
        let rows = batch(0, 10);
        store.insert_raw_orders(&rows.orders).await;

        assert_eq!(store.delete_orphaned_orders(4).await.unwrap(), 4);
        assert_eq!(store.delete_orphaned_orders(4).await.unwrap(), 4);
        assert_eq!(store.delete_orphaned_orders(4).await.unwrap(), 2);
        assert_eq!(store.delete_orphaned_orders(4).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_tie_break_keeps_earliest_row() {
        let store = MemoryStore::new();
        let rows = batch(0, 3);
        store.insert_raw_orders(&rows.orders).await;
        store.insert_raw_orders(&rows.orders[..2]).await;

        assert_eq!(store.count_duplicate_orders().await.unwrap(), 2);
        assert_eq!(store.delete_duplicate_orders(100).await.unwrap(), 2);
        assert_eq!(store.count_duplicate_orders().await.unwrap(), 0);

        let kept: Vec<u64> = store.orders().await.iter().map(|r| r.row_id).collect();
        assert_eq!(kept, vec![1, 2, 3]);
    }
}
