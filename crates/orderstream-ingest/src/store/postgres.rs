//! Postgres-backed store
//!
//! Channels are rows of `{schema}.ingest_channels`. An append writes the batch
//! and advances the channel's `last_committed_offset` in one transaction, so a
//! committed offset always implies committed rows. Saturation of the pool or
//! the server surfaces as [`ChannelError::Backpressure`].

use std::time::Duration;

use async_trait::async_trait;
use orderstream_common::types::{Customer, CustomerRange, Order, OrderItem, Segment};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info, warn};

use super::{CustomerDirectory, ReconciliationStore, StoreError};
use crate::channel::{Channel, ChannelClient, ChannelError, OffsetToken, RowBatch, Target};
use crate::config::TargetConfig;

/// Rows per multi-row INSERT; keeps bind parameters under the 65535 limit
const INSERT_CHUNK_ROWS: usize = 5_000;

pub struct PgStore {
    pool: PgPool,
    targets: TargetConfig,
    flush_latency: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, targets: TargetConfig, flush_latency: Duration) -> Self {
        Self {
            pool,
            targets,
            flush_latency,
        }
    }

    fn orders_table(&self) -> String {
        format!("{}.{}", self.targets.schema, self.targets.orders_table)
    }

    fn items_table(&self) -> String {
        format!("{}.{}", self.targets.schema, self.targets.order_items_table)
    }

    fn customers_table(&self) -> String {
        format!("{}.{}", self.targets.schema, self.targets.customers_table)
    }

    fn channels_table(&self) -> String {
        format!("{}.ingest_channels", self.targets.schema)
    }

    /// Create the channel bookkeeping table if missing
    ///
    /// Target and customer tables are provisioned outside this crate. Both
    /// target tables need a monotonic `row_id` column for duplicate removal.
    pub async fn ensure_channel_table(&self) -> Result<(), StoreError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                channel_name TEXT PRIMARY KEY,
                target TEXT NOT NULL,
                last_committed_offset TEXT,
                opened_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                closed_at TIMESTAMPTZ
            )",
            self.channels_table()
        );
        sqlx::query(&sql).execute(&self.pool).await?;

        info!(table = %self.channels_table(), "Channel table ready");
        Ok(())
    }

    fn push_orders<'a>(&self, builder: &mut QueryBuilder<'a, Postgres>, rows: &'a [Order]) {
        builder.push_values(rows, |mut b, order| {
            b.push_bind(order.order_id)
                .push_bind(order.customer_id)
                .push_bind(order.order_date)
                .push_bind(order.order_status.as_str())
                .push_bind(order.total_amount)
                .push_bind(order.discount_percent)
                .push_bind(order.shipping_cost);
        });
    }

    fn push_items<'a>(&self, builder: &mut QueryBuilder<'a, Postgres>, rows: &'a [OrderItem]) {
        builder.push_values(rows, |mut b, item| {
            b.push_bind(item.order_item_id)
                .push_bind(item.order_id)
                .push_bind(item.product_id)
                .push_bind(item.product_name.as_str())
                .push_bind(item.product_category.as_str())
                .push_bind(item.quantity)
                .push_bind(item.unit_price)
                .push_bind(item.line_total);
        });
    }

    async fn scalar_count(&self, sql: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn bounded_delete(&self, sql: &str, limit: u64) -> Result<u64, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let result = sqlx::query(sql).bind(limit).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

/// True for errors that mean "the store is busy, try again later"
fn is_saturation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            // 53xxx: insufficient resources, 57P03: cannot connect now,
            // 40001/40P01: serialization failure, deadlock
            code.starts_with("53") || code == "57P03" || code == "40001" || code == "40P01"
        }),
        _ => false,
    }
}

fn classify(channel: &Channel, err: sqlx::Error) -> ChannelError {
    if is_saturation(&err) {
        ChannelError::Backpressure {
            channel: channel.name().to_string(),
            message: err.to_string(),
        }
    } else {
        ChannelError::Database {
            channel: channel.name().to_string(),
            source: err,
        }
    }
}

fn parse_offset(raw: Option<String>, expected: Target) -> Result<Option<OffsetToken>, ChannelError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let token: OffsetToken = raw.parse()?;
    if token.target() != expected {
        return Err(ChannelError::InvalidOffset(format!(
            "{} stored on a {} channel",
            raw, expected
        )));
    }
    Ok(Some(token))
}

#[async_trait]
impl ChannelClient for PgStore {
    async fn open(
        &self,
        target: Target,
        name: &str,
    ) -> Result<(Channel, Option<OffsetToken>), ChannelError> {
        let pending = Channel::new(target, name, None);
        let sql = format!(
            "INSERT INTO {} (channel_name, target) VALUES ($1, $2)
             ON CONFLICT (channel_name)
             DO UPDATE SET opened_at = NOW(), updated_at = NOW(), closed_at = NULL
             RETURNING target, last_committed_offset",
            self.channels_table()
        );

        let row = sqlx::query(&sql)
            .bind(name)
            .bind(target.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify(&pending, e))?;

        let stored_target: String = row.try_get("target").map_err(|e| classify(&pending, e))?;
        let stored_target: Target = stored_target.parse()?;
        if stored_target != target {
            return Err(ChannelError::TargetMismatch {
                channel: name.to_string(),
                expected: stored_target,
                actual: target,
            });
        }

        let raw: Option<String> = row
            .try_get("last_committed_offset")
            .map_err(|e| classify(&pending, e))?;
        let last = parse_offset(raw, target)?;

        debug!(
            channel = name,
            flush_latency_ms = self.flush_latency.as_millis() as u64,
            "Channel row opened"
        );
        Ok((Channel::new(target, name, last), last))
    }

    async fn insert(
        &self,
        channel: &Channel,
        rows: RowBatch<'_>,
        start: &OffsetToken,
        end: &OffsetToken,
    ) -> Result<(), ChannelError> {
        channel.check_insert(&rows, start, end)?;

        let mut tx = self.pool.begin().await.map_err(|e| classify(channel, e))?;

        match rows {
            RowBatch::Orders(orders) => {
                for chunk in orders.chunks(INSERT_CHUNK_ROWS) {
                    let mut builder = QueryBuilder::<Postgres>::new(format!(
                        "INSERT INTO {} (order_id, customer_id, order_date, order_status, \
                         total_amount, discount_percent, shipping_cost) ",
                        self.orders_table()
                    ));
                    self.push_orders(&mut builder, chunk);
                    builder
                        .build()
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| classify(channel, e))?;
                }
            },
            RowBatch::Items(items) => {
                for chunk in items.chunks(INSERT_CHUNK_ROWS) {
                    let mut builder = QueryBuilder::<Postgres>::new(format!(
                        "INSERT INTO {} (order_item_id, order_id, product_id, product_name, \
                         product_category, quantity, unit_price, line_total) ",
                        self.items_table()
                    ));
                    self.push_items(&mut builder, chunk);
                    builder
                        .build()
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| classify(channel, e))?;
                }
            },
        }

        let sql = format!(
            "UPDATE {} SET last_committed_offset = $1, updated_at = NOW() WHERE channel_name = $2",
            self.channels_table()
        );
        sqlx::query(&sql)
            .bind(end.to_string())
            .bind(channel.name())
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(channel, e))?;

        tx.commit().await.map_err(|e| classify(channel, e))?;
        Ok(())
    }

    async fn latest_committed_offset(
        &self,
        channel: &Channel,
    ) -> Result<Option<OffsetToken>, ChannelError> {
        let sql = format!(
            "SELECT last_committed_offset FROM {} WHERE channel_name = $1",
            self.channels_table()
        );
        let raw: Option<Option<String>> = sqlx::query_scalar(&sql)
            .bind(channel.name())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify(channel, e))?;
        parse_offset(raw.flatten(), channel.target())
    }

    async fn close(&self, channel: &mut Channel) -> Result<(), ChannelError> {
        if channel.is_closed() {
            return Ok(());
        }
        channel.mark_closed();

        let sql = format!(
            "UPDATE {} SET closed_at = NOW(), updated_at = NOW() WHERE channel_name = $1",
            self.channels_table()
        );
        sqlx::query(&sql)
            .bind(channel.name())
            .execute(&self.pool)
            .await
            .map_err(|e| classify(channel, e))?;
        Ok(())
    }
}

#[async_trait]
impl CustomerDirectory for PgStore {
    async fn max_customer_id(&self) -> Result<i64, StoreError> {
        let sql = format!("SELECT MAX(customer_id)::BIGINT FROM {}", self.customers_table());
        let max: Option<i64> = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(max.unwrap_or(0))
    }

    async fn segments_in_range(&self, range: CustomerRange) -> Result<Vec<Customer>, StoreError> {
        let sql = format!(
            "SELECT customer_id::BIGINT AS customer_id, customer_segment FROM {}
             WHERE customer_id BETWEEN $1 AND $2
             ORDER BY customer_id",
            self.customers_table()
        );
        let rows = sqlx::query(&sql)
            .bind(range.start())
            .bind(range.end())
            .fetch_all(&self.pool)
            .await?;

        let mut customers = Vec::with_capacity(rows.len());
        for row in rows {
            let customer_id: i64 = row.try_get("customer_id")?;
            let raw: Option<String> = row.try_get("customer_segment")?;
            let segment = match raw.as_deref().map(str::parse::<Segment>) {
                Some(Ok(segment)) => segment,
                Some(Err(_)) | None => {
                    warn!(customer_id, segment = ?raw, "Unknown customer segment, using Standard");
                    Segment::Standard
                },
            };
            customers.push(Customer {
                customer_id,
                segment,
            });
        }
        Ok(customers)
    }
}

#[async_trait]
impl ReconciliationStore for PgStore {
    async fn delete_orphaned_orders(&self, limit: u64) -> Result<u64, StoreError> {
        let sql = format!(
            "DELETE FROM {orders} WHERE order_id IN (
                SELECT DISTINCT o.order_id FROM {orders} o
                LEFT JOIN {items} i ON o.order_id = i.order_id
                WHERE i.order_id IS NULL
                LIMIT $1
            )",
            orders = self.orders_table(),
            items = self.items_table()
        );
        self.bounded_delete(&sql, limit).await
    }

    async fn delete_orphaned_items(&self, limit: u64) -> Result<u64, StoreError> {
        let sql = format!(
            "DELETE FROM {items} WHERE order_id IN (
                SELECT DISTINCT i.order_id FROM {items} i
                LEFT JOIN {orders} o ON i.order_id = o.order_id
                WHERE o.order_id IS NULL
                LIMIT $1
            )",
            orders = self.orders_table(),
            items = self.items_table()
        );
        self.bounded_delete(&sql, limit).await
    }

    async fn count_duplicate_orders(&self) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT (COUNT(*) - COUNT(DISTINCT order_id))::BIGINT FROM {}",
            self.orders_table()
        );
        self.scalar_count(&sql).await
    }

    async fn delete_duplicate_orders(&self, limit: u64) -> Result<u64, StoreError> {
        let sql = format!(
            "DELETE FROM {orders} WHERE row_id IN (
                SELECT row_id FROM (
                    SELECT row_id,
                           ROW_NUMBER() OVER (PARTITION BY order_id ORDER BY order_date, row_id) AS rn
                    FROM {orders}
                ) ranked
                WHERE rn > 1
                LIMIT $1
            )",
            orders = self.orders_table()
        );
        self.bounded_delete(&sql, limit).await
    }

    async fn count_orders(&self) -> Result<u64, StoreError> {
        self.scalar_count(&format!("SELECT COUNT(*) FROM {}", self.orders_table()))
            .await
    }

    async fn count_items(&self) -> Result<u64, StoreError> {
        self.scalar_count(&format!("SELECT COUNT(*) FROM {}", self.items_table()))
            .await
    }
}
