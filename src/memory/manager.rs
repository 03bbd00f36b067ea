//! Allocation routing across pools.

use super::{BlockPool, HostPinner};
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::rdma::{ProtectionDomain, RegistrationKey};
use std::ptr::NonNull;
use std::sync::Arc;

/// A successful allocation.
///
/// The caller keeps `pool_index` and passes it back verbatim to
/// [`MemoryManager::deallocate`] and [`MemoryManager::registration_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Start of the block run.
    pub ptr: NonNull<u8>,
    /// Position of the owning pool in the manager.
    pub pool_index: usize,
}

// SAFETY: an Allocation is an address plus an index; it grants no access by
// itself and the memory it names is owned by the manager.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

/// Owns the pools and routes allocations between them.
///
/// Pools are kept in insertion order. Allocation tries each pool in turn and
/// the first success wins. Deallocation trusts the caller's `pool_index`.
/// Pools are dropped in reverse order of creation.
pub struct MemoryManager {
    pools: Vec<BlockPool>,
    auto_increase: bool,
}

impl MemoryManager {
    /// Provision the manager at process startup.
    ///
    /// The pinned, registered region is required before anything can be
    /// served, so a failure here is logged and terminates the process.
    /// Use [`try_from_config`](Self::try_from_config) where pools are
    /// created after startup.
    pub fn new(config: &PoolConfig, domain: &dyn ProtectionDomain) -> Self {
        match Self::try_from_config(config, domain) {
            Ok(manager) => manager,
            Err(e) => {
                tracing::error!("failed to provision memory pool: {}", e);
                std::process::exit(1);
            }
        }
    }

    /// Build a manager with one pool described by `config`.
    pub fn try_from_config(config: &PoolConfig, domain: &dyn ProtectionDomain) -> Result<Self> {
        config.validate()?;
        let pinner = config.pinning.pinner()?;
        let manager = Self::try_new(config.region_size(), config.block_size(), domain, pinner)?;
        Ok(manager.with_auto_increase(config.auto_increase))
    }

    /// Build a manager with a single pool.
    pub fn try_new(
        region_size: usize,
        block_size: usize,
        domain: &dyn ProtectionDomain,
        pinner: Arc<dyn HostPinner>,
    ) -> Result<Self> {
        let pool = BlockPool::new(region_size, block_size, domain, pinner)?;
        Self::from_pools(vec![pool])
    }

    /// Build a manager over existing pools, in the given order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `pools` is empty.
    pub fn from_pools(pools: Vec<BlockPool>) -> Result<Self> {
        if pools.is_empty() {
            return Err(Error::InvalidConfig("a manager needs at least one pool".into()));
        }
        let mut manager = Self {
            pools: Vec::with_capacity(pools.len()),
            auto_increase: false,
        };
        for pool in pools {
            manager.push_pool(pool);
        }
        Ok(manager)
    }

    /// Record whether growth on exhaustion was requested.
    pub fn with_auto_increase(mut self, auto_increase: bool) -> Self {
        self.auto_increase = auto_increase;
        self
    }

    /// Append a pool and return its index.
    ///
    /// Existing indices are unaffected. Allocation never calls this on its
    /// own; growth is up to the owner of the manager.
    pub fn push_pool(&mut self, mut pool: BlockPool) -> usize {
        let index = self.pools.len();
        pool.set_index(index);
        self.pools.push(pool);
        index
    }

    /// Allocate `size` bytes from the first pool that has room.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`] for a zero-byte request
    /// - [`Error::PoolExhausted`] if the request fits some pool but none has
    ///   a free run long enough right now
    /// - [`Error::RequestTooLarge`] if the request exceeds every pool
    pub fn allocate(&self, size: usize) -> Result<Allocation> {
        let mut exhausted = false;
        let mut capacity = 0;

        for (pool_index, pool) in self.pools.iter().enumerate() {
            match pool.allocate(size) {
                Ok(ptr) => return Ok(Allocation { ptr, pool_index }),
                Err(Error::PoolExhausted { .. }) => exhausted = true,
                Err(Error::RequestTooLarge { capacity: c, .. }) => capacity = capacity.max(c),
                Err(e) => return Err(e),
            }
        }

        if self.auto_increase {
            tracing::debug!(
                "all {} pools failed a {} byte request; auto_increase is set but no growth policy is defined",
                self.pools.len(),
                size
            );
        }

        if exhausted {
            Err(Error::PoolExhausted { requested: size })
        } else {
            Err(Error::RequestTooLarge {
                requested: size,
                capacity,
            })
        }
    }

    /// Free a run in the pool at `pool_index`.
    ///
    /// `ptr` and `size` are not checked against other pools; the caller
    /// passes back exactly what [`allocate`](Self::allocate) returned.
    ///
    /// # Panics
    ///
    /// Panics if `pool_index` is out of range.
    pub fn deallocate(&self, ptr: *const u8, size: usize, pool_index: usize) -> Result<()> {
        self.pool_at(pool_index).deallocate(ptr, size)
    }

    /// Registration keys of the pool at `pool_index`.
    ///
    /// # Panics
    ///
    /// Panics if `pool_index` is out of range.
    pub fn registration_key(&self, pool_index: usize) -> RegistrationKey {
        self.pool_at(pool_index).registration_key()
    }

    /// The pool at `index`, if any.
    pub fn pool(&self, index: usize) -> Option<&BlockPool> {
        self.pools.get(index)
    }

    /// All pools, in index order.
    pub fn pools(&self) -> &[BlockPool] {
        &self.pools
    }

    /// Number of pools.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Always false; a manager holds at least one pool.
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Whether growth on exhaustion was requested.
    pub fn auto_increase(&self) -> bool {
        self.auto_increase
    }

    /// Sum of all region sizes in bytes.
    pub fn total_capacity(&self) -> usize {
        self.pools.iter().map(BlockPool::region_size).sum()
    }

    /// Sum of free bytes across pools.
    pub fn available_bytes(&self) -> usize {
        self.pools
            .iter()
            .map(|p| p.available_blocks() * p.block_size())
            .sum()
    }

    fn pool_at(&self, pool_index: usize) -> &BlockPool {
        assert!(
            pool_index < self.pools.len(),
            "pool index {} out of range ({} pools)",
            pool_index,
            self.pools.len()
        );
        &self.pools[pool_index]
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        // Newest first.
        while let Some(pool) = self.pools.pop() {
            drop(pool);
        }
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("pools", &self.pools)
            .field("auto_increase", &self.auto_increase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::NoPinning;
    use crate::rdma::LoopbackDomain;
    use parking_lot::Mutex;

    const BLOCK: usize = 4096;

    fn pool(domain: &LoopbackDomain, blocks: usize) -> BlockPool {
        BlockPool::new(blocks * BLOCK, BLOCK, domain, Arc::new(NoPinning)).unwrap()
    }

    fn offset_in(manager: &MemoryManager, alloc: Allocation) -> usize {
        let base = manager.pool(alloc.pool_index).unwrap().base_address();
        alloc.ptr.as_ptr() as usize - base.as_ptr() as usize
    }

    #[test]
    fn test_single_pool_manager() {
        let domain = LoopbackDomain::new();
        let manager = MemoryManager::try_new(8 * BLOCK, BLOCK, &domain, Arc::new(NoPinning)).unwrap();

        assert_eq!(manager.len(), 1);
        assert!(!manager.is_empty());
        assert_eq!(manager.total_capacity(), 8 * BLOCK);

        let alloc = manager.allocate(3 * BLOCK).unwrap();
        assert_eq!(alloc.pool_index, 0);
        assert_eq!(manager.available_bytes(), 5 * BLOCK);

        manager.deallocate(alloc.ptr.as_ptr(), 3 * BLOCK, alloc.pool_index).unwrap();
        assert_eq!(manager.available_bytes(), 8 * BLOCK);
    }

    #[test]
    fn test_routing_to_second_pool() {
        let domain = LoopbackDomain::new();
        let manager = MemoryManager::from_pools(vec![pool(&domain, 2), pool(&domain, 4)]).unwrap();

        // Fill pool 0.
        let first = manager.allocate(2 * BLOCK).unwrap();
        assert_eq!(first.pool_index, 0);

        let second = manager.allocate(BLOCK).unwrap();
        assert_eq!(second.pool_index, 1);
        assert_eq!(manager.pool(1).unwrap().available_blocks(), 3);

        manager.deallocate(second.ptr.as_ptr(), BLOCK, second.pool_index).unwrap();
        assert_eq!(manager.pool(1).unwrap().available_blocks(), 4);
        // Pool 0 untouched.
        assert_eq!(manager.pool(0).unwrap().available_blocks(), 0);
    }

    #[test]
    fn test_first_pool_preferred_after_free() {
        let domain = LoopbackDomain::new();
        let manager = MemoryManager::from_pools(vec![pool(&domain, 1), pool(&domain, 1)]).unwrap();

        let a = manager.allocate(BLOCK).unwrap();
        let b = manager.allocate(BLOCK).unwrap();
        assert_eq!((a.pool_index, b.pool_index), (0, 1));

        manager.deallocate(a.ptr.as_ptr(), BLOCK, 0).unwrap();
        let c = manager.allocate(BLOCK).unwrap();
        assert_eq!(c.pool_index, 0);
        assert_eq!(offset_in(&manager, c), 0);
    }

    #[test]
    fn test_large_request_skips_small_pool() {
        let domain = LoopbackDomain::new();
        let manager = MemoryManager::from_pools(vec![pool(&domain, 2), pool(&domain, 8)]).unwrap();

        let alloc = manager.allocate(5 * BLOCK).unwrap();
        assert_eq!(alloc.pool_index, 1);
        assert_eq!(manager.pool(0).unwrap().available_blocks(), 2);
    }

    #[test]
    fn test_exhausted_vs_too_large() {
        let domain = LoopbackDomain::new();
        let manager = MemoryManager::from_pools(vec![pool(&domain, 2), pool(&domain, 4)]).unwrap();

        let err = manager.allocate(5 * BLOCK).unwrap_err();
        assert!(matches!(
            err,
            Error::RequestTooLarge { capacity, .. } if capacity == 4 * BLOCK
        ));

        let _a = manager.allocate(2 * BLOCK).unwrap();
        let _b = manager.allocate(4 * BLOCK).unwrap();
        let err = manager.allocate(BLOCK).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_zero_size_is_invalid() {
        let domain = LoopbackDomain::new();
        let manager = MemoryManager::from_pools(vec![pool(&domain, 2)]).unwrap();
        assert!(matches!(manager.allocate(0), Err(Error::InvalidSize(0))));
    }

    #[test]
    fn test_auto_increase_does_not_grow() {
        let domain = LoopbackDomain::new();
        let manager = MemoryManager::from_pools(vec![pool(&domain, 1)])
            .unwrap()
            .with_auto_increase(true);

        assert!(manager.auto_increase());
        let _a = manager.allocate(BLOCK).unwrap();
        assert!(matches!(manager.allocate(BLOCK), Err(Error::PoolExhausted { .. })));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_push_pool_keeps_indices() {
        let domain = LoopbackDomain::new();
        let mut manager = MemoryManager::from_pools(vec![pool(&domain, 1)]).unwrap();
        let a = manager.allocate(BLOCK).unwrap();

        let index = manager.push_pool(pool(&domain, 2));
        assert_eq!(index, 1);

        let b = manager.allocate(BLOCK).unwrap();
        assert_eq!(b.pool_index, 1);
        manager.deallocate(a.ptr.as_ptr(), BLOCK, a.pool_index).unwrap();
    }

    #[test]
    fn test_registration_keys_per_pool() {
        let domain = LoopbackDomain::new();
        let manager = MemoryManager::from_pools(vec![pool(&domain, 1), pool(&domain, 1)]).unwrap();

        let k0 = manager.registration_key(0);
        let k1 = manager.registration_key(1);
        assert_ne!(k0, k1);
        assert_eq!(k0, manager.pool(0).unwrap().registration_key());
    }

    #[test]
    #[should_panic(expected = "pool index 2 out of range")]
    fn test_registration_key_out_of_range() {
        let domain = LoopbackDomain::new();
        let manager = MemoryManager::from_pools(vec![pool(&domain, 1), pool(&domain, 1)]).unwrap();
        manager.registration_key(2);
    }

    #[test]
    fn test_empty_manager_rejected() {
        assert!(matches!(
            MemoryManager::from_pools(Vec::new()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_try_from_config() {
        let domain = LoopbackDomain::new();
        let config = PoolConfig {
            prealloc_size: 1,
            minimal_allocate_size: 1024,
            auto_increase: true,
            pinning: crate::memory::PinningMode::None,
            ..PoolConfig::default()
        };

        let manager = MemoryManager::try_from_config(&config, &domain).unwrap();
        assert_eq!(manager.total_capacity(), 1 << 30);
        assert_eq!(manager.pool(0).unwrap().total_blocks(), 1024);
        assert!(manager.auto_increase());
    }

    /// Records the order in which regions are unpinned.
    struct OrderPinner {
        unpinned: Arc<Mutex<Vec<usize>>>,
    }

    impl HostPinner for OrderPinner {
        unsafe fn pin(&self, _ptr: *mut u8, _len: usize) -> Result<()> {
            Ok(())
        }

        unsafe fn unpin(&self, ptr: *mut u8, _len: usize) -> Result<()> {
            self.unpinned.lock().push(ptr as usize);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "order"
        }
    }

    #[test]
    fn test_pools_dropped_in_reverse_order() {
        let domain = LoopbackDomain::new();
        let unpinned = Arc::new(Mutex::new(Vec::new()));
        let pinner: Arc<dyn HostPinner> = Arc::new(OrderPinner {
            unpinned: Arc::clone(&unpinned),
        });

        let pools: Vec<_> = (0..3)
            .map(|_| BlockPool::new(BLOCK, BLOCK, &domain, Arc::clone(&pinner)).unwrap())
            .collect();
        let bases: Vec<usize> = pools.iter().map(|p| p.base_address().as_ptr() as usize).collect();

        let manager = MemoryManager::from_pools(pools).unwrap();
        drop(manager);

        let expected: Vec<usize> = bases.into_iter().rev().collect();
        assert_eq!(*unpinned.lock(), expected);
        assert_eq!(domain.live_registrations(), 0);
    }
}
