//! Work partitioning across workers
//!
//! Customers `1..=M` and the entity quota are split into `N` contiguous
//! slices. Worker `i` gets customers `[i*floor(M/N) + 1, (i+1)*floor(M/N)]`,
//! the last worker extends to `M`, and the quota is split the same way with
//! the remainder going to the last worker.

use orderstream_common::types::CustomerRange;
use serde::Serialize;

use crate::error::IngestError;
use crate::generator::ID_STRIDE;

/// One worker's customers and quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub worker_id: u32,
    pub customers: CustomerRange,
    pub quota: u64,
}

/// Largest worker count whose id ranges still fit in an `i64`
pub fn max_workers() -> usize {
    (i64::MAX / ID_STRIDE) as usize
}

pub fn compute_partitions(
    total: u64,
    workers: usize,
    max_customer_id: i64,
) -> Result<Vec<Partition>, IngestError> {
    if workers == 0 {
        return Err(IngestError::Partition("worker count must be at least 1".to_string()));
    }
    if workers > max_workers() {
        return Err(IngestError::Partition(format!(
            "worker count {} exceeds the maximum of {}",
            workers,
            max_workers()
        )));
    }
    if max_customer_id < workers as i64 {
        return Err(IngestError::Partition(format!(
            "{} customers cannot be split across {} workers",
            max_customer_id.max(0),
            workers
        )));
    }

    let n = workers as i64;
    let per_worker_customers = max_customer_id / n;
    let per_worker_quota = total / workers as u64;

    let mut partitions = Vec::with_capacity(workers);
    for i in 0..workers {
        let is_last = i + 1 == workers;
        let idx = i as i64;

        let start = idx * per_worker_customers + 1;
        let end = if is_last {
            max_customer_id
        } else {
            (idx + 1) * per_worker_customers
        };
        let quota = if is_last {
            total - per_worker_quota * (workers as u64 - 1)
        } else {
            per_worker_quota
        };

        partitions.push(Partition {
            worker_id: i as u32,
            customers: CustomerRange::new(start, end)?,
            quota,
        });
    }

    Ok(partitions)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fifty_thousand_across_five_workers() {
        let partitions = compute_partitions(50_000, 5, 20_000).unwrap();
        assert_eq!(partitions.len(), 5);

        let ranges: Vec<(i64, i64)> = partitions
            .iter()
            .map(|p| (p.customers.start(), p.customers.end()))
            .collect();
        assert_eq!(
            ranges,
            vec![(1, 4_000), (4_001, 8_000), (8_001, 12_000), (12_001, 16_000), (16_001, 20_000)]
        );
        assert!(partitions.iter().all(|p| p.quota == 10_000));
    }

    #[test]
    fn test_remainders_go_to_last_worker() {
        let partitions = compute_partitions(10, 3, 100).unwrap();
        let quotas: Vec<u64> = partitions.iter().map(|p| p.quota).collect();
        assert_eq!(quotas, vec![3, 3, 4]);
        assert_eq!(partitions[2].customers.start(), 67);
        assert_eq!(partitions[2].customers.end(), 100);
    }

    #[test]
    fn test_single_worker_covers_everything() {
        let partitions = compute_partitions(7, 1, 3).unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].customers, CustomerRange::new(1, 3).unwrap());
        assert_eq!(partitions[0].quota, 7);
    }

    #[test]
    fn test_fewer_customers_than_workers_is_rejected() {
        assert!(compute_partitions(100, 5, 4).is_err());
        assert!(compute_partitions(100, 1, 0).is_err());
        assert!(compute_partitions(100, 0, 10).is_err());
    }

    #[test]
    fn test_quota_smaller_than_worker_count() {
        let partitions = compute_partitions(2, 4, 40).unwrap();
        let quotas: Vec<u64> = partitions.iter().map(|p| p.quota).collect();
        assert_eq!(quotas, vec![0, 0, 0, 2]);
    }

    proptest! {
        #[test]
        fn prop_partitions_cover_customers_and_quota(
            total in 0u64..1_000_000,
            workers in 1usize..64,
            extra in 0i64..100_000,
        ) {
            let max_customer_id = workers as i64 + extra;
            let partitions = compute_partitions(total, workers, max_customer_id).unwrap();

            prop_assert_eq!(partitions.len(), workers);
            prop_assert_eq!(partitions.iter().map(|p| p.quota).sum::<u64>(), total);
            prop_assert_eq!(partitions[0].customers.start(), 1);
            prop_assert_eq!(partitions[workers - 1].customers.end(), max_customer_id);

            for pair in partitions.windows(2) {
                prop_assert_eq!(pair[0].customers.end() + 1, pair[1].customers.start());
            }
            prop_assert_eq!(
                partitions.iter().map(|p| p.customers.len()).sum::<u64>(),
                max_customer_id as u64
            );
        }
    }
}
