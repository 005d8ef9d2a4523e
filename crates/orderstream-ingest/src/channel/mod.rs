//! Append channels
//!
//! A channel is a named, resumable append path bound to one target entity.
//! Each channel remembers the offset token of the last batch it committed, so a
//! worker that reopens its channel after a crash knows where to resume.
//!
//! [`ChannelClient`] is the seam to the remote store; [`ChannelManager`] owns
//! the pair of channels a single worker writes through.

pub mod manager;

use async_trait::async_trait;
use orderstream_common::types::{Order, OrderItem};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use manager::{ChannelManager, ResumePoint};

/// Entity a channel appends to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Orders,
    OrderItems,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Orders => "orders",
            Target::OrderItems => "order_items",
        }
    }

    /// Prefix of the offset tokens this target's channels emit
    pub fn offset_prefix(&self) -> &'static str {
        match self {
            Target::Orders => "order",
            Target::OrderItems => "item",
        }
    }

    fn from_offset_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "order" => Some(Target::Orders),
            "item" => Some(Target::OrderItems),
            _ => None,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Target {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orders" => Ok(Target::Orders),
            "order_items" => Ok(Target::OrderItems),
            other => Err(ChannelError::InvalidOffset(format!("unknown target {:?}", other))),
        }
    }
}

/// Resume marker derived from a record's identity: `order_<id>` or `item_<id>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OffsetToken {
    target: Target,
    id: i64,
}

impl OffsetToken {
    pub fn new(target: Target, id: i64) -> Self {
        Self { target, id }
    }

    pub fn for_order(order: &Order) -> Self {
        Self::new(Target::Orders, order.order_id)
    }

    pub fn for_item(item: &OrderItem) -> Self {
        Self::new(Target::OrderItems, item.order_item_id)
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

impl std::fmt::Display for OffsetToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.target.offset_prefix(), self.id)
    }
}

impl std::str::FromStr for OffsetToken {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, id) = s
            .split_once('_')
            .ok_or_else(|| ChannelError::InvalidOffset(s.to_string()))?;
        let target = Target::from_offset_prefix(prefix)
            .ok_or_else(|| ChannelError::InvalidOffset(s.to_string()))?;
        let id = id
            .parse::<i64>()
            .map_err(|_| ChannelError::InvalidOffset(s.to_string()))?;
        Ok(Self { target, id })
    }
}

/// Rows handed to a single append call
#[derive(Debug, Clone, Copy)]
pub enum RowBatch<'a> {
    Orders(&'a [Order]),
    Items(&'a [OrderItem]),
}

impl<'a> RowBatch<'a> {
    pub fn target(&self) -> Target {
        match self {
            RowBatch::Orders(_) => Target::Orders,
            RowBatch::Items(_) => Target::OrderItems,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RowBatch::Orders(rows) => rows.len(),
            RowBatch::Items(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset tokens of the first and last row
    pub fn offset_range(&self) -> Option<(OffsetToken, OffsetToken)> {
        match self {
            RowBatch::Orders(rows) => Some((
                OffsetToken::for_order(rows.first()?),
                OffsetToken::for_order(rows.last()?),
            )),
            RowBatch::Items(rows) => Some((
                OffsetToken::for_item(rows.first()?),
                OffsetToken::for_item(rows.last()?),
            )),
        }
    }
}

/// Handle to an opened channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    target: Target,
    name: String,
    opened_at_offset: Option<OffsetToken>,
    closed: bool,
}

impl Channel {
    pub fn new(target: Target, name: impl Into<String>, opened_at_offset: Option<OffsetToken>) -> Self {
        Self {
            target,
            name: name.into(),
            opened_at_offset,
            closed: false,
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last committed offset as reported when the channel was opened
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Checks every client performs before appending `rows`
    pub fn check_insert(
        &self,
        rows: &RowBatch<'_>,
        start: &OffsetToken,
        end: &OffsetToken,
    ) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed(self.name.clone()));
        }
        if rows.target() != self.target {
            return Err(ChannelError::TargetMismatch {
                channel: self.name.clone(),
                expected: self.target,
                actual: rows.target(),
            });
        }
        match rows.offset_range() {
            Some((first, last)) if first == *start && last == *end => {},
            _ => {
                return Err(ChannelError::OffsetMismatch {
                    channel: self.name.clone(),
                    start: start.to_string(),
                    end: end.to_string(),
                })
            },
        }
        match self.opened_at_offset {
            Some(committed) if start.id() <= committed.id() => Err(ChannelError::BehindCommitted {
                channel: self.name.clone(),
                start: start.to_string(),
                committed: committed.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Channel-layer errors; only [`ChannelError::Backpressure`] is worth retrying
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Channel {channel} is saturated: {message}")]
    Backpressure { channel: String, message: String },

    #[error("Channel {0} is closed")]
    Closed(String),

    #[error("Channel {channel} appends {expected} rows, got {actual}")]
    TargetMismatch {
        channel: String,
        expected: Target,
        actual: Target,
    },

    #[error("Offset range {start}..{end} does not match the rows sent on channel {channel}")]
    OffsetMismatch {
        channel: String,
        start: String,
        end: String,
    },

    /// Batch starts at or before the offset the channel was opened at
    #[error("Channel {channel} was opened at {committed}, cannot append from {start}")]
    BehindCommitted {
        channel: String,
        start: String,
        committed: String,
    },

    #[error("Invalid offset token: {0}")]
    InvalidOffset(String),

    #[error("Channel {channel} rejected the request: {message}")]
    Rejected { channel: String, message: String },

    #[error("Database error on channel {channel}: {source}")]
    Database {
        channel: String,
        #[source]
        source: sqlx::Error,
    },
}

impl ChannelError {
    pub fn is_backpressure(&self) -> bool {
        matches!(self, ChannelError::Backpressure { .. })
    }
}

/// Append-channel API of the remote store
///
/// Implementations never retry internally: a saturated store answers with
/// [`ChannelError::Backpressure`] and the caller decides what to do.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Open (or reopen) `name`; returns the channel and its last committed offset
    async fn open(
        &self,
        target: Target,
        name: &str,
    ) -> Result<(Channel, Option<OffsetToken>), ChannelError>;

    /// Append `rows` as one batch covering `start..=end`
    async fn insert(
        &self,
        channel: &Channel,
        rows: RowBatch<'_>,
        start: &OffsetToken,
        end: &OffsetToken,
    ) -> Result<(), ChannelError>;

    async fn latest_committed_offset(
        &self,
        channel: &Channel,
    ) -> Result<Option<OffsetToken>, ChannelError>;

    /// Flush and release; idempotent and safe after earlier failures
    async fn close(&self, channel: &mut Channel) -> Result<(), ChannelError>;
}
