//! Synthetic order generation
//!
//! Every batch draws from an RNG seeded with `(seed, worker_id, first order
//! sequence)`, so a run is reproducible from its seed and a resumed worker
//! produces the same batch it would have produced without the interruption.
//!
//! Identities are partitioned per worker: `id = worker_id * ID_STRIDE + seq`
//! with `seq` starting at 1. Orders and order items use separate sequences,
//! so no two workers (and no two runs of one worker) ever emit the same id.

use chrono::{Duration, NaiveDateTime, NaiveTime};
use orderstream_common::types::{
    round_cents, Customer, CustomerRange, Order, OrderItem, OrderStatus, Segment,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::channel::{OffsetToken, Target};

/// Width of each worker's id range
pub const ID_STRIDE: i64 = 1_000_000_000_000;

/// Orders never carry more than this many items
pub const MAX_ITEMS_PER_ORDER: usize = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("Offset {token} is outside the id range of worker {worker_id}")]
    ForeignOffset { token: String, worker_id: u32 },

    #[error("Worker id {0} exceeds the supported id space")]
    WorkerOutOfRange(u32),
}

// ============================================================================
// Distribution parameters
// ============================================================================

/// Per-segment distribution parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentProfile {
    pub min_items: usize,
    pub max_items: usize,
    pub min_unit_price: f64,
    pub max_unit_price: f64,
    pub max_quantity: i32,
    /// Location and scale of the log-normal order amount
    pub amount_mu: f64,
    pub amount_sigma: f64,
    pub discount_probability: f64,
    pub min_discount: u32,
    pub max_discount: u32,
}

const PREMIUM: SegmentProfile = SegmentProfile {
    min_items: 2,
    max_items: 10,
    min_unit_price: 50.0,
    max_unit_price: 500.0,
    max_quantity: 5,
    amount_mu: 5.5,
    amount_sigma: 1.0,
    discount_probability: 0.4,
    min_discount: 10,
    max_discount: 25,
};

const STANDARD: SegmentProfile = SegmentProfile {
    min_items: 1,
    max_items: 7,
    min_unit_price: 20.0,
    max_unit_price: 300.0,
    max_quantity: 5,
    amount_mu: 5.0,
    amount_sigma: 1.2,
    discount_probability: 0.2,
    min_discount: 5,
    max_discount: 20,
};

const BASIC: SegmentProfile = SegmentProfile {
    min_items: 1,
    max_items: 4,
    min_unit_price: 10.0,
    max_unit_price: 150.0,
    max_quantity: 5,
    amount_mu: 4.5,
    amount_sigma: 1.0,
    discount_probability: 0.1,
    min_discount: 5,
    max_discount: 10,
};

impl SegmentProfile {
    pub fn for_segment(segment: Segment) -> &'static SegmentProfile {
        match segment {
            Segment::Premium => &PREMIUM,
            Segment::Standard => &STANDARD,
            Segment::Basic => &BASIC,
        }
    }
}

struct Product {
    id: i32,
    name: &'static str,
    category: &'static str,
}

const CATALOG: [Product; 10] = [
    Product { id: 1001, name: "Powder Skis", category: "Skis" },
    Product { id: 1002, name: "All-Mountain Skis", category: "Skis" },
    Product { id: 1003, name: "Freestyle Snowboard", category: "Snowboards" },
    Product { id: 1004, name: "Freeride Snowboard", category: "Snowboards" },
    Product { id: 1005, name: "Ski Boots", category: "Boots" },
    Product { id: 1006, name: "Snowboard Boots", category: "Boots" },
    Product { id: 1007, name: "Ski Poles", category: "Accessories" },
    Product { id: 1008, name: "Ski Goggles", category: "Accessories" },
    Product { id: 1009, name: "Snowboard Bindings", category: "Accessories" },
    Product { id: 1010, name: "Ski Helmet", category: "Accessories" },
];

/// Cumulative status weights: 65% completed, 15% shipped, 10% processing, 7% pending
const STATUS_WEIGHTS: [(f64, OrderStatus); 5] = [
    (0.65, OrderStatus::Completed),
    (0.80, OrderStatus::Shipped),
    (0.90, OrderStatus::Processing),
    (0.97, OrderStatus::Pending),
    (1.00, OrderStatus::Cancelled),
];

// ============================================================================
// Customer lookup
// ============================================================================

/// Customers of one partition, prefetched once per worker
#[derive(Debug, Clone)]
pub struct SegmentTable {
    range: CustomerRange,
    customers: Vec<Customer>,
}

impl SegmentTable {
    /// Keeps only customers inside `range`, sorted by id with repeats dropped
    pub fn new(range: CustomerRange, customers: Vec<Customer>) -> Self {
        let mut customers: Vec<Customer> = customers
            .into_iter()
            .filter(|c| range.contains(c.customer_id))
            .collect();
        customers.sort_by_key(|c| c.customer_id);
        customers.dedup_by_key(|c| c.customer_id);
        Self { range, customers }
    }

    pub fn range(&self) -> CustomerRange {
        self.range
    }

    pub fn len(&self) -> usize {
        self.customers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.customers.is_empty()
    }

    pub fn segment_of(&self, customer_id: i64) -> Segment {
        self.customers
            .binary_search_by_key(&customer_id, |c| c.customer_id)
            .map(|idx| self.customers[idx].segment)
            .unwrap_or_default()
    }

    /// Uniform pick among known customers; falls back to any id in the range
    pub fn pick<R: Rng>(&self, rng: &mut R) -> Customer {
        if self.customers.is_empty() {
            return Customer {
                customer_id: rng.gen_range(self.range.start()..=self.range.end()),
                segment: Segment::Standard,
            };
        }
        self.customers[rng.gen_range(0..self.customers.len())]
    }
}

// ============================================================================
// Generator
// ============================================================================

/// One batch of parents and their children
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedBatch {
    pub orders: Vec<Order>,
    pub items: Vec<OrderItem>,
}

pub struct EntityGenerator {
    worker_id: u32,
    seed: u64,
    segments: SegmentTable,
    reference_time: NaiveDateTime,
    next_order_seq: i64,
    next_item_seq: i64,
}

impl EntityGenerator {
    pub fn new(
        worker_id: u32,
        seed: u64,
        segments: SegmentTable,
        reference_time: NaiveDateTime,
    ) -> Self {
        Self {
            worker_id,
            seed,
            segments,
            reference_time,
            next_order_seq: 1,
            next_item_seq: 1,
        }
    }

    fn id_base(&self) -> i64 {
        i64::from(self.worker_id) * ID_STRIDE
    }

    pub fn next_order_id(&self) -> i64 {
        self.id_base() + self.next_order_seq
    }

    pub fn next_item_id(&self) -> i64 {
        self.id_base() + self.next_item_seq
    }

    /// Continue numbering after the last committed offsets of a previous run
    pub fn resume_from(
        &mut self,
        last_order: Option<OffsetToken>,
        last_item: Option<OffsetToken>,
    ) -> Result<(), GeneratorError> {
        if i64::from(self.worker_id).checked_mul(ID_STRIDE).is_none() {
            return Err(GeneratorError::WorkerOutOfRange(self.worker_id));
        }
        if let Some(token) = last_order {
            self.next_order_seq = self.seq_after(token, Target::Orders)?;
        }
        if let Some(token) = last_item {
            self.next_item_seq = self.seq_after(token, Target::OrderItems)?;
        }
        Ok(())
    }

    fn seq_after(&self, token: OffsetToken, target: Target) -> Result<i64, GeneratorError> {
        let seq = token.id() - self.id_base();
        if token.target() != target || !(1..ID_STRIDE - 1).contains(&seq) {
            return Err(GeneratorError::ForeignOffset {
                token: token.to_string(),
                worker_id: self.worker_id,
            });
        }
        Ok(seq + 1)
    }

    /// Generate `count` orders with their items
    pub fn generate_batch(&mut self, count: usize) -> GeneratedBatch {
        let mut rng = StdRng::seed_from_u64(batch_seed(self.seed, self.worker_id, self.next_order_seq));
        let mut batch = GeneratedBatch {
            orders: Vec::with_capacity(count),
            items: Vec::with_capacity(count * 4),
        };

        for _ in 0..count {
            let customer = self.segments.pick(&mut rng);
            let item_count = item_count_for(&mut rng, customer.segment);
            let (order, items) = self.generate_order(&mut rng, customer, item_count);
            batch.orders.push(order);
            batch.items.extend(items);
        }

        batch
    }

    /// Build one order for `customer` with exactly `item_count` items (clamped to 1..=10)
    pub fn generate_order<R: Rng>(
        &mut self,
        rng: &mut R,
        customer: Customer,
        item_count: usize,
    ) -> (Order, Vec<OrderItem>) {
        let profile = SegmentProfile::for_segment(customer.segment);
        let order_id = self.next_order_id();
        self.next_order_seq += 1;

        let discount_percent = if rng.gen_bool(profile.discount_probability) {
            f64::from(rng.gen_range(profile.min_discount..=profile.max_discount))
        } else {
            0.0
        };

        let order = Order {
            order_id,
            customer_id: customer.customer_id,
            order_date: self.random_order_date(rng),
            order_status: random_status(rng),
            total_amount: random_amount(rng, profile),
            discount_percent,
            shipping_cost: round_cents(rng.gen_range(5.0..50.0)),
        };

        let item_count = item_count.clamp(1, MAX_ITEMS_PER_ORDER);
        let mut items = Vec::with_capacity(item_count);
        for _ in 0..item_count {
            let product = &CATALOG[rng.gen_range(0..CATALOG.len())];
            let quantity = rng.gen_range(1..=profile.max_quantity);
            let unit_price = round_cents(rng.gen_range(profile.min_unit_price..profile.max_unit_price));
            items.push(OrderItem {
                order_item_id: self.next_item_id(),
                order_id,
                product_id: product.id,
                product_name: product.name.to_string(),
                product_category: product.category.to_string(),
                quantity,
                unit_price,
                line_total: round_cents(unit_price * f64::from(quantity)),
            });
            self.next_item_seq += 1;
        }

        (order, items)
    }

    fn random_order_date<R: Rng>(&self, rng: &mut R) -> NaiveDateTime {
        let day = self.reference_time.date() - Duration::days(rng.gen_range(1..=365));
        day.and_time(NaiveTime::MIN) + Duration::seconds(rng.gen_range(0..86_400))
    }
}

fn batch_seed(seed: u64, worker_id: u32, first_seq: i64) -> u64 {
    seed ^ u64::from(worker_id).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (first_seq as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9)
}

fn item_count_for<R: Rng>(rng: &mut R, segment: Segment) -> usize {
    let profile = SegmentProfile::for_segment(segment);
    rng.gen_range(profile.min_items..=profile.max_items)
}

fn random_status<R: Rng>(rng: &mut R) -> OrderStatus {
    let roll: f64 = rng.gen();
    STATUS_WEIGHTS
        .iter()
        .find(|(threshold, _)| roll < *threshold)
        .map_or(OrderStatus::Cancelled, |(_, status)| *status)
}

/// Log-normal draw (Box-Muller), widened the way real basket totals spread
fn random_amount<R: Rng>(rng: &mut R, profile: &SegmentProfile) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    let base = (profile.amount_mu + profile.amount_sigma * z).exp();

    let low = base.max(10.0);
    let high = (base * 1.5).max(50.0).max(low + 0.01);
    round_cents(rng.gen_range(low..high))
}

/// Customers with ids `1..=count` and uniformly drawn segments
pub fn generate_customers(count: u64, seed: u64) -> Vec<Customer> {
    let mut rng = StdRng::seed_from_u64(seed);
    (1..=count as i64)
        .map(|customer_id| Customer {
            customer_id,
            segment: Segment::ALL[rng.gen_range(0..Segment::ALL.len())],
        })
        .collect()
}
