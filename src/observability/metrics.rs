//! Metrics collection using metrics-rs.

use metrics::{Counter, Gauge, Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const ALLOCATIONS: &str = "rdma_pool_allocations_total";
const ALLOCATED_BLOCKS: &str = "rdma_pool_allocated_blocks_total";
const ALLOCATION_FAILURES: &str = "rdma_pool_allocation_failures_total";
const DEALLOCATIONS: &str = "rdma_pool_deallocations_total";
const INVALID_DEALLOCATIONS: &str = "rdma_pool_invalid_deallocations_total";
const DOUBLE_FREE_BLOCKS: &str = "rdma_pool_double_free_blocks_total";
const FREE_BLOCKS: &str = "rdma_pool_free_blocks";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(ALLOCATIONS, Unit::Count, "Successful block run allocations");
    metrics::describe_counter!(
        ALLOCATED_BLOCKS,
        Unit::Count,
        "Blocks handed out by successful allocations"
    );
    metrics::describe_counter!(
        ALLOCATION_FAILURES,
        Unit::Count,
        "Failed allocations, labelled by reason"
    );
    metrics::describe_counter!(DEALLOCATIONS, Unit::Count, "Accepted deallocations");
    metrics::describe_counter!(
        INVALID_DEALLOCATIONS,
        Unit::Count,
        "Deallocations rejected as misaligned or out of range"
    );
    metrics::describe_counter!(
        DOUBLE_FREE_BLOCKS,
        Unit::Count,
        "Blocks that were freed while already free"
    );
    metrics::describe_gauge!(FREE_BLOCKS, Unit::Count, "Free blocks in a pool");
}

/// Reason an allocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// No free run was long enough.
    Exhausted,
    /// The request exceeds the pool.
    TooLarge,
}

impl FailureReason {
    fn as_str(self) -> &'static str {
        match self {
            FailureReason::Exhausted => "exhausted",
            FailureReason::TooLarge => "too_large",
        }
    }
}

/// Metrics handles for one pool.
///
/// Handles are resolved once at pool construction so the data path only
/// touches atomics.
#[derive(Clone)]
pub struct PoolMetrics {
    pool: String,
    allocations: Counter,
    allocated_blocks: Counter,
    exhausted: Counter,
    too_large: Counter,
    deallocations: Counter,
    invalid_deallocations: Counter,
    double_free_blocks: Counter,
    free_blocks: Gauge,
}

impl PoolMetrics {
    /// Create the metrics handles for the pool labelled `pool`.
    pub fn new(pool: &str) -> Self {
        let failure = |reason: FailureReason| {
            counter!(
                ALLOCATION_FAILURES,
                "pool" => pool.to_string(),
                "reason" => reason.as_str()
            )
        };

        Self {
            pool: pool.to_string(),
            allocations: counter!(ALLOCATIONS, "pool" => pool.to_string()),
            allocated_blocks: counter!(ALLOCATED_BLOCKS, "pool" => pool.to_string()),
            exhausted: failure(FailureReason::Exhausted),
            too_large: failure(FailureReason::TooLarge),
            deallocations: counter!(DEALLOCATIONS, "pool" => pool.to_string()),
            invalid_deallocations: counter!(INVALID_DEALLOCATIONS, "pool" => pool.to_string()),
            double_free_blocks: counter!(DOUBLE_FREE_BLOCKS, "pool" => pool.to_string()),
            free_blocks: gauge!(FREE_BLOCKS, "pool" => pool.to_string()),
        }
    }

    /// Record a successful allocation of `blocks` blocks.
    #[inline]
    pub fn record_allocation(&self, blocks: usize, free_blocks: usize) {
        self.allocations.increment(1);
        self.allocated_blocks.increment(blocks as u64);
        self.free_blocks.set(free_blocks as f64);
    }

    /// Record a failed allocation.
    #[inline]
    pub fn record_failure(&self, reason: FailureReason) {
        match reason {
            FailureReason::Exhausted => self.exhausted.increment(1),
            FailureReason::TooLarge => self.too_large.increment(1),
        }
    }

    /// Record a processed deallocation.
    #[inline]
    pub fn record_deallocation(&self, double_freed: usize, free_blocks: usize) {
        self.deallocations.increment(1);
        if double_freed > 0 {
            self.double_free_blocks.increment(double_freed as u64);
        }
        self.free_blocks.set(free_blocks as f64);
    }

    /// Publish the current number of free blocks.
    #[inline]
    pub fn record_free_blocks(&self, free_blocks: usize) {
        self.free_blocks.set(free_blocks as f64);
    }

    /// Record a deallocation rejected before touching the bitmap.
    #[inline]
    pub fn record_invalid_deallocation(&self) {
        self.invalid_deallocations.increment(1);
    }

    /// Get the pool label.
    pub fn pool(&self) -> &str {
        &self.pool
    }
}

impl std::fmt::Debug for PoolMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMetrics").field("pool", &self.pool).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        // Should not panic
        init_metrics();
        // Should be idempotent
        init_metrics();
    }

    #[test]
    fn test_pool_metrics() {
        // These should not panic even without a recorder installed
        let metrics = PoolMetrics::new("0");
        metrics.record_allocation(4, 12);
        metrics.record_failure(FailureReason::Exhausted);
        metrics.record_failure(FailureReason::TooLarge);
        metrics.record_deallocation(1, 16);
        metrics.record_invalid_deallocation();
        metrics.record_free_blocks(16);

        assert_eq!(metrics.pool(), "0");
    }
}
