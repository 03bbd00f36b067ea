//! Memory management for rdma-pool.
//!
//! This module provides the block allocator that backs an RDMA-registered
//! host region used for zero-copy GPU and network transfers.
//!
//! # Architecture
//!
//! - [`HostRegion`]: page-aligned mapping that a pool carves into blocks
//! - [`HostPinner`]: pins the region for direct device access
//! - [`BlockBitmap`]: occupancy bitmap with first-fit run search
//! - [`BlockPool`]: one pinned, registered region plus its bitmap
//! - [`MemoryManager`]: routes requests across pools by index
//!
//! # Example
//!
//! ```rust,ignore
//! use rdma_pool::memory::{MemoryManager, NoPinning};
//! use rdma_pool::rdma::LoopbackDomain;
//! use std::sync::Arc;
//!
//! let domain = LoopbackDomain::new();
//! let manager = MemoryManager::try_new(64 << 20, 64 << 10, &domain, Arc::new(NoPinning))?;
//!
//! let alloc = manager.allocate(256 << 10)?;
//! let key = manager.registration_key(alloc.pool_index);
//! // ... post work requests against alloc.ptr with key.lkey ...
//! manager.deallocate(alloc.ptr.as_ptr(), 256 << 10, alloc.pool_index)?;
//! ```

mod bitmap;
mod manager;
mod pinning;
mod pool;
mod region;

pub use bitmap::BlockBitmap;
pub use manager::{Allocation, MemoryManager};
pub use pinning::{CudaHostPinner, HostPinner, MlockPinner, NoPinning, PinningMode};
pub use pool::BlockPool;
pub use region::HostRegion;
