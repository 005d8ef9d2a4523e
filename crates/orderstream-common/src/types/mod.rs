//! Data model shared by the ingestion engine and its stores

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, Result};

// ============================================================================
// Customers
// ============================================================================

/// Customer classification that parameterizes generated order distributions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Segment {
    Premium,
    #[default]
    Standard,
    Basic,
}

impl Segment {
    pub const ALL: [Segment; 3] = [Segment::Premium, Segment::Standard, Segment::Basic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Premium => "Premium",
            Segment::Standard => "Standard",
            Segment::Basic => "Basic",
        }
    }
}

impl std::str::FromStr for Segment {
    type Err = CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "premium" => Ok(Segment::Premium),
            "standard" => Ok(Segment::Standard),
            "basic" => Ok(Segment::Basic),
            _ => Err(CommonError::UnknownSegment(s.to_string())),
        }
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only reference customer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: i64,
    pub segment: Segment,
}

/// Inclusive, non-empty range of customer ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerRange {
    start: i64,
    end: i64,
}

impl CustomerRange {
    /// Create a range `[start, end]`; ids start at 1 and the range may not be empty
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start <= 0 || end < start {
            return Err(CommonError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    /// Number of ids in the range
    pub fn len(&self) -> u64 {
        (self.end - self.start + 1) as u64
    }

    /// Always false; kept for clippy's `len_without_is_empty`
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, customer_id: i64) -> bool {
        customer_id >= self.start && customer_id <= self.end
    }
}

impl std::fmt::Display for CustomerRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// ============================================================================
// Orders
// ============================================================================

/// Lifecycle status of a generated order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Completed,
    Shipped,
    Processing,
    Pending,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Completed => "Completed",
            OrderStatus::Shipped => "Shipped",
            OrderStatus::Processing => "Processing",
            OrderStatus::Pending => "Pending",
            OrderStatus::Cancelled => "Cancelled",
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "completed" => Ok(OrderStatus::Completed),
            "shipped" => Ok(OrderStatus::Shipped),
            "processing" => Ok(OrderStatus::Processing),
            "pending" => Ok(OrderStatus::Pending),
            "cancelled" => Ok(OrderStatus::Cancelled),
            _ => Err(CommonError::UnknownStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parent record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: i64,
    pub customer_id: i64,
    pub order_date: NaiveDateTime,
    pub order_status: OrderStatus,
    pub total_amount: f64,
    pub discount_percent: f64,
    pub shipping_cost: f64,
}

/// Child record, always referencing an [`Order`] by `order_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_item_id: i64,
    pub order_id: i64,
    pub product_id: i32,
    pub product_name: String,
    pub product_category: String,
    pub quantity: i32,
    pub unit_price: f64,
    pub line_total: f64,
}

/// Round a currency amount half-up to cents
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_segment_from_str() {
        assert_eq!("Premium".parse::<Segment>().unwrap(), Segment::Premium);
        assert_eq!("STANDARD".parse::<Segment>().unwrap(), Segment::Standard);
        assert_eq!(" basic ".parse::<Segment>().unwrap(), Segment::Basic);
        assert!("gold".parse::<Segment>().is_err());
    }

    #[test]
    fn test_order_status_round_trips_through_display() {
        for status in [
            OrderStatus::Completed,
            OrderStatus::Shipped,
            OrderStatus::Processing,
            OrderStatus::Pending,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<OrderStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_customer_range_rejects_invalid_bounds() {
        assert!(CustomerRange::new(0, 10).is_err());
        assert!(CustomerRange::new(5, 4).is_err());
        assert!(CustomerRange::new(-3, 4).is_err());

        let single = CustomerRange::new(7, 7).unwrap();
        assert_eq!(single.len(), 1);
        assert!(single.contains(7));
        assert!(!single.contains(8));
    }

    #[test]
    fn test_round_cents() {
        assert_eq!(round_cents(10.005_1), 10.01);
        assert_eq!(round_cents(3.0), 3.0);
        assert_eq!(round_cents(129.994), 129.99);
    }

    proptest! {
        #[test]
        fn prop_range_len_matches_bounds(start in 1i64..1_000_000, width in 0i64..1_000_000) {
            let range = CustomerRange::new(start, start + width).unwrap();
            prop_assert_eq!(range.len(), (width + 1) as u64);
            prop_assert!(range.contains(start));
            prop_assert!(range.contains(start + width));
            prop_assert!(!range.contains(start - 1));
        }
    }
}
