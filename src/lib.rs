//! # rdma-pool
//!
//! A block allocator over a pinned, RDMA-registered host region.
//!
//! A [`BlockPool`](memory::BlockPool) maps one large page-aligned region,
//! pins it for device access and registers it with a protection domain. The
//! region is carved into fixed-size blocks tracked by a bitmap; every request
//! is rounded up to whole blocks and served first-fit. The registration keys
//! are shared by every allocation in the pool, so callers can post transfers
//! against any returned pointer without a per-request registration.
//!
//! A [`MemoryManager`](memory::MemoryManager) owns one or more pools and
//! routes requests between them. Allocations carry the index of their pool;
//! deallocation and key lookup take that index back.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rdma_pool::prelude::*;
//! use rdma_pool::rdma::LoopbackDomain;
//!
//! let config = PoolConfig::from_file("pool.toml")?;
//! let domain = LoopbackDomain::new();
//! let manager = MemoryManager::try_from_config(&config, &domain)?;
//!
//! let alloc = manager.allocate(1 << 20)?;
//! let key = manager.registration_key(alloc.pool_index);
//! manager.deallocate(alloc.ptr.as_ptr(), 1 << 20, alloc.pool_index)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod memory;
pub mod observability;
pub mod rdma;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::PoolConfig;
    pub use crate::error::{Error, Result};
    pub use crate::memory::{Allocation, BlockPool, HostPinner, MemoryManager, PinningMode};
    pub use crate::rdma::{AccessFlags, ProtectionDomain, RegistrationKey};
}

pub use error::{Error, Result};
