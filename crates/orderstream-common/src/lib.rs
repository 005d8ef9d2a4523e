//! Orderstream Common Library
//!
//! Shared types, utilities, and error handling for the orderstream workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Common error type and result alias
//! - **Logging**: Centralized `tracing` subscriber setup
//! - **Types**: The ingested data model (customers, orders, order items)
//!   and customer-id ranges used for partitioning
//!
//! # Example
//!
//! ```no_run
//! use orderstream_common::types::{CustomerRange, Segment};
//!
//! let range = CustomerRange::new(1, 4000).unwrap();
//! assert_eq!(range.len(), 4000);
//! assert_eq!("premium".parse::<Segment>().unwrap(), Segment::Premium);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
