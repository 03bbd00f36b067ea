//! Observability: allocator metrics.
//!
//! Logging goes through `tracing` directly at the call sites; this module
//! only holds the `metrics-rs` instrumentation.
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `rdma_pool_allocations_total` | Counter | Successful allocations |
//! | `rdma_pool_allocated_blocks_total` | Counter | Blocks handed out |
//! | `rdma_pool_allocation_failures_total` | Counter | Failures, by `reason` |
//! | `rdma_pool_deallocations_total` | Counter | Accepted deallocations |
//! | `rdma_pool_invalid_deallocations_total` | Counter | Misaligned / out of range frees |
//! | `rdma_pool_double_free_blocks_total` | Counter | Blocks freed twice |
//! | `rdma_pool_free_blocks` | Gauge | Free blocks |
//!
//! Every metric carries a `pool` label with the pool index.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rdma_pool::observability::init_metrics;
//!
//! // Call once at startup, then install any metrics-rs exporter.
//! init_metrics();
//! ```

mod metrics;

pub use self::metrics::{FailureReason, PoolMetrics, init_metrics};
