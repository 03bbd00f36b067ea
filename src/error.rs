//! Error types for rdma-pool.

use thiserror::Error;

/// Result type alias using rdma-pool's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pool construction, allocation and deallocation.
#[derive(Error, Debug)]
pub enum Error {
    /// Pool geometry or configuration values are unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration text could not be read or parsed.
    #[error("failed to load configuration: {0}")]
    Config(String),

    /// The backing host memory could not be mapped.
    #[error("region allocation failed: {0}")]
    RegionAllocation(String),

    /// The region could not be pinned for accelerator access.
    #[error("failed to pin host memory: {0}")]
    Pin(String),

    /// The RDMA provider refused to register the region.
    #[error("memory registration failed: {0}")]
    Registration(String),

    /// A request of zero bytes.
    #[error("invalid request size: {0} bytes")]
    InvalidSize(usize),

    /// The request can never be satisfied, the pool is too small.
    #[error("request of {requested} bytes exceeds pool capacity of {capacity} bytes")]
    RequestTooLarge {
        /// Bytes requested.
        requested: usize,
        /// Largest pool capacity in bytes.
        capacity: usize,
    },

    /// No free run is currently large enough.
    #[error("memory pool exhausted: no free run for {requested} bytes")]
    PoolExhausted {
        /// Bytes requested.
        requested: usize,
    },

    /// Address is not on a block boundary.
    #[error("address offset {offset} is not aligned to block size {block_size}")]
    Misaligned {
        /// Byte offset from the pool base.
        offset: usize,
        /// Block size of the pool.
        block_size: usize,
    },

    /// Address does not point into the pool.
    #[error("address {addr:#x} is outside the pool")]
    AddressOutOfRange {
        /// The rejected address.
        addr: usize,
    },

    /// Run starts inside the pool but extends past its end.
    #[error("run of {blocks} blocks at block {start_block} exceeds the pool of {total_blocks} blocks")]
    RunOutOfRange {
        /// First block of the run.
        start_block: usize,
        /// Run length in blocks.
        blocks: usize,
        /// Blocks in the pool.
        total_blocks: usize,
    },

    /// Some blocks of the run were already free. The rest of the run was freed.
    #[error("double free detected at block indices {blocks:?}")]
    DoubleFree {
        /// Block indices that were already clear.
        blocks: Vec<usize>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Returns true when retrying the same request later may succeed.
    ///
    /// Only exhaustion is transient; every other allocation failure will
    /// fail again for the same input.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::PoolExhausted { .. })
    }
}
