//! Block pool over one pinned, RDMA-registered region.

use super::{BlockBitmap, HostPinner, HostRegion};
use crate::error::{Error, Result};
use crate::observability::{FailureReason, PoolMetrics};
use crate::rdma::{AccessFlags, MemoryRegistration, ProtectionDomain, RegistrationKey};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::Arc;

/// A pool that hands out contiguous runs of fixed-size blocks.
///
/// The pool owns one page-aligned region, pinned for device access and
/// registered with an RDMA protection domain for local write, remote write
/// and remote read. Allocation is first-fit over an occupancy bitmap; every
/// returned address sits on a block boundary.
///
/// # Design
///
/// - Fixed geometry: `region_size` and `block_size` never change
/// - No per-allocation bookkeeping: callers free with the size they allocated
/// - One mutex per pool guards the bitmap; the scan never blocks on I/O
/// - Teardown deregisters, then unpins, then unmaps
///
/// # Example
///
/// ```rust
/// use rdma_pool::memory::{BlockPool, NoPinning};
/// use rdma_pool::rdma::LoopbackDomain;
/// use std::sync::Arc;
///
/// let domain = LoopbackDomain::new();
/// let pool = BlockPool::new(16 * 4096, 4096, &domain, Arc::new(NoPinning)).unwrap();
///
/// // Three blocks, the last one partially used.
/// let ptr = pool.allocate(2 * 4096 + 1).unwrap();
/// assert_eq!(pool.available_blocks(), 13);
///
/// // Free with the same size.
/// pool.deallocate(ptr.as_ptr(), 2 * 4096 + 1).unwrap();
/// assert_eq!(pool.available_blocks(), 16);
/// ```
pub struct BlockPool {
    /// Dropped explicitly before the region goes away.
    registration: Option<Box<dyn MemoryRegistration>>,
    key: RegistrationKey,
    pinner: Arc<dyn HostPinner>,
    region: HostRegion,
    block_size: usize,
    total_blocks: usize,
    bitmap: Mutex<BlockBitmap>,
    metrics: PoolMetrics,
}

impl BlockPool {
    /// Create a pool of `region_size` bytes split into `block_size` blocks.
    ///
    /// Maps the region, pins it with `pinner` and registers it under
    /// `domain`. A step that fails undoes the steps before it.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if either size is zero or `region_size`
    ///   is not a multiple of `block_size`
    /// - [`Error::RegionAllocation`], [`Error::Pin`] or [`Error::Registration`]
    ///   if the corresponding step fails
    pub fn new(
        region_size: usize,
        block_size: usize,
        domain: &dyn ProtectionDomain,
        pinner: Arc<dyn HostPinner>,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::InvalidConfig("block size must be > 0".into()));
        }
        if region_size == 0 {
            return Err(Error::InvalidConfig("region size must be > 0".into()));
        }
        if region_size % block_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "region size {region_size} is not a multiple of block size {block_size}"
            )));
        }

        let total_blocks = region_size / block_size;
        tracing::info!(
            "memory pool size: {} bytes, block size: {} bytes, total blocks: {}, pinning: {}",
            region_size,
            block_size,
            total_blocks,
            pinner.name()
        );

        let region = HostRegion::new(region_size)?;
        let base = region.as_ptr().as_ptr();

        // SAFETY: the region is mapped and outlives the pin (unpinned in Drop).
        unsafe { pinner.pin(base, region_size) }?;

        // SAFETY: the registration is dropped before the region in Drop.
        let registration = match unsafe { domain.register(base, region_size, AccessFlags::POOL) } {
            Ok(registration) => registration,
            Err(e) => {
                if let Err(unpin_err) = unsafe { pinner.unpin(base, region_size) } {
                    tracing::warn!("unpin after failed registration: {}", unpin_err);
                }
                return Err(e);
            }
        };
        let key = registration.key();

        tracing::info!(
            "memory pool allocated at {:p} (lkey={:#x}, rkey={:#x})",
            base,
            key.lkey,
            key.rkey
        );

        let metrics = PoolMetrics::new("0");
        metrics.record_free_blocks(total_blocks);

        Ok(Self {
            registration: Some(registration),
            key,
            pinner,
            region,
            block_size,
            total_blocks,
            bitmap: Mutex::new(BlockBitmap::new(total_blocks)),
            metrics,
        })
    }

    /// Allocate a contiguous run large enough for `size` bytes.
    ///
    /// The size is rounded up to whole blocks. The first free run in block
    /// order wins.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`] for a zero-byte request
    /// - [`Error::RequestTooLarge`] if the request exceeds the whole pool
    /// - [`Error::PoolExhausted`] if no free run is currently long enough
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::InvalidSize(size));
        }

        let blocks = size.div_ceil(self.block_size);
        if blocks > self.total_blocks {
            self.metrics.record_failure(FailureReason::TooLarge);
            return Err(Error::RequestTooLarge {
                requested: size,
                capacity: self.region_size(),
            });
        }

        let (start, free) = {
            let mut bitmap = self.bitmap.lock();
            let Some(start) = bitmap.find_first_fit(blocks) else {
                drop(bitmap);
                tracing::debug!("pool {}: no free run of {} blocks", self.metrics.pool(), blocks);
                self.metrics.record_failure(FailureReason::Exhausted);
                return Err(Error::PoolExhausted { requested: size });
            };
            bitmap.set_run(start, blocks);
            (start, bitmap.count_free())
        };
        self.metrics.record_allocation(blocks, free);

        Ok(self.block_ptr(start))
    }

    /// Return a run previously obtained from [`allocate`](Self::allocate).
    ///
    /// `size` must be the size passed to `allocate`; it is rounded the same
    /// way to find the run length.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressOutOfRange`] if `ptr` is not inside the pool
    /// - [`Error::Misaligned`] if `ptr` is not on a block boundary
    /// - [`Error::RunOutOfRange`] if the run extends past the pool
    ///
    /// These leave the pool untouched.
    ///
    /// - [`Error::DoubleFree`] if some blocks of the run were already free.
    ///   The remaining blocks of the run are still freed.
    pub fn deallocate(&self, ptr: *const u8, size: usize) -> Result<()> {
        let blocks = size.div_ceil(self.block_size);
        let start = match self.validate_run(ptr, blocks) {
            Ok(start) => start,
            Err(e) => {
                tracing::error!("pool {}: invalid deallocation: {}", self.metrics.pool(), e);
                self.metrics.record_invalid_deallocation();
                return Err(e);
            }
        };

        let (double_freed, free) = {
            let mut bitmap = self.bitmap.lock();
            let double_freed = bitmap.clear_run(start, blocks);
            (double_freed, bitmap.count_free())
        };
        self.metrics.record_deallocation(double_freed.len(), free);

        if double_freed.is_empty() {
            return Ok(());
        }
        for block in &double_freed {
            tracing::error!("pool {}: double free detected at block index {}", self.metrics.pool(), block);
        }
        Err(Error::DoubleFree {
            blocks: double_freed,
        })
    }

    /// Map `ptr` to its block index and check the run fits.
    fn validate_run(&self, ptr: *const u8, blocks: usize) -> Result<usize> {
        let addr = ptr as usize;
        let offset = addr
            .checked_sub(self.base_address().as_ptr() as usize)
            .ok_or(Error::AddressOutOfRange { addr })?;
        if offset % self.block_size != 0 {
            return Err(Error::Misaligned {
                offset,
                block_size: self.block_size,
            });
        }

        let start = offset / self.block_size;
        if start >= self.total_blocks {
            return Err(Error::AddressOutOfRange { addr });
        }
        if blocks > self.total_blocks - start {
            return Err(Error::RunOutOfRange {
                start_block: start,
                blocks,
                total_blocks: self.total_blocks,
            });
        }
        Ok(start)
    }

    /// Keys of this pool's registration.
    pub fn registration_key(&self) -> RegistrationKey {
        self.key
    }

    /// Start of the region.
    pub fn base_address(&self) -> NonNull<u8> {
        self.region.as_ptr()
    }

    /// Size of the region in bytes.
    pub fn region_size(&self) -> usize {
        self.region.len()
    }

    /// Size of each block in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks in the pool.
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Number of currently free blocks.
    pub fn available_blocks(&self) -> usize {
        self.bitmap.lock().count_free()
    }

    /// Check if a block is currently allocated.
    ///
    /// Note: This is a snapshot and may change immediately after returning.
    pub fn is_block_allocated(&self, block: usize) -> bool {
        self.bitmap.lock().is_allocated(block)
    }

    /// Returns true if `ptr` points into the region.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.base_address().as_ptr() as usize;
        (ptr as usize)
            .checked_sub(base)
            .is_some_and(|offset| offset < self.region_size())
    }

    /// Label metrics and logs with the pool's position in its manager.
    pub(crate) fn set_index(&mut self, index: usize) {
        self.metrics = PoolMetrics::new(&index.to_string());
        self.metrics.record_free_blocks(self.available_blocks());
    }

    fn block_ptr(&self, block: usize) -> NonNull<u8> {
        debug_assert!(block < self.total_blocks);
        // SAFETY: block < total_blocks, so the offset stays inside the region.
        unsafe { self.base_address().add(block * self.block_size) }
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        // The HCA must stop referencing the memory before it is released.
        drop(self.registration.take());

        let base = self.region.as_ptr().as_ptr();
        // SAFETY: pinned in `new` and still mapped; the region field drops after this.
        if let Err(e) = unsafe { self.pinner.unpin(base, self.region.len()) } {
            tracing::error!("failed to unpin memory pool at {:p}: {}", base, e);
        }
        tracing::debug!("memory pool at {:p} released", base);
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("base", &self.region.as_ptr())
            .field("region_size", &self.region.len())
            .field("block_size", &self.block_size)
            .field("total_blocks", &self.total_blocks)
            .field("key", &self.key)
            .finish()
    }
}
