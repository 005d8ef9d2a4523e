//! Ingestion error types

use orderstream_common::CommonError;
use thiserror::Error;

use crate::channel::{ChannelError, Target};
use crate::engine::AtomicityViolation;
use crate::generator::GeneratorError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Generator(#[from] GeneratorError),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("Failed to insert {rows} {target} rows after {attempts} attempts: {source}")]
    RetriesExhausted {
        target: Target,
        rows: usize,
        attempts: u32,
        #[source]
        source: ChannelError,
    },

    #[error("{violation}: {source}")]
    AtomicityViolation {
        violation: AtomicityViolation,
        #[source]
        source: Box<IngestError>,
    },

    #[error("Invalid partitioning: {0}")]
    Partition(String),

    #[error("Worker panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;
