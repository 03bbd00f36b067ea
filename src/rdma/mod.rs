//! RDMA memory registration.
//!
//! A pool registers its whole region once, at construction, with the
//! protection domain handed over by the transport layer. The registration
//! yields the keys that work requests targeting the region must carry.
//!
//! # Backends
//!
//! - [`IbvProtectionDomain`]: libibverbs, behind the `ibverbs` feature
//! - [`LoopbackDomain`]: in-process domain for local-only transfers and tests

mod loopback;

#[cfg(feature = "ibverbs")]
mod ibverbs;

#[cfg(feature = "ibverbs")]
pub use ibverbs::IbvProtectionDomain;
pub use loopback::LoopbackDomain;

use crate::error::Result;
use std::ops::BitOr;

/// Access rights requested for a memory registration.
///
/// Bit values match `ibv_access_flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessFlags(u32);

impl AccessFlags {
    /// The local HCA may write into the region.
    pub const LOCAL_WRITE: Self = Self(1);
    /// Remote peers may RDMA-write into the region.
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    /// Remote peers may RDMA-read from the region.
    pub const REMOTE_READ: Self = Self(1 << 2);

    /// The access every pool region is registered with.
    pub const POOL: Self = Self(Self::LOCAL_WRITE.0 | Self::REMOTE_WRITE.0 | Self::REMOTE_READ.0);

    /// Raw bit representation.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every flag in `other` is also set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Keys derived from a memory registration.
///
/// `lkey` goes into scatter/gather entries of locally posted work requests;
/// `rkey` is what a peer must present to read or write the region remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationKey {
    /// Local key.
    pub lkey: u32,
    /// Remote key.
    pub rkey: u32,
}

/// A live registration of a memory region with an RDMA provider.
///
/// Dropping the value deregisters the region. The registered memory must
/// stay mapped until then.
pub trait MemoryRegistration: Send + Sync {
    /// Local key of the registration.
    fn lkey(&self) -> u32;

    /// Remote key of the registration.
    fn rkey(&self) -> u32;

    /// Both keys.
    fn key(&self) -> RegistrationKey {
        RegistrationKey {
            lkey: self.lkey(),
            rkey: self.rkey(),
        }
    }
}

/// A protection domain that memory regions can be registered under.
///
/// The domain is owned by the transport layer; the allocator only borrows
/// it to create registrations.
pub trait ProtectionDomain: Send + Sync {
    /// Register `len` bytes at `addr` with the requested access.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must be mapped memory that outlives the returned
    /// registration.
    unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<Box<dyn MemoryRegistration>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_access_flags() {
        let pool = AccessFlags::POOL;
        assert_eq!(pool.bits(), 0b111);
        assert!(pool.contains(AccessFlags::LOCAL_WRITE));
        assert!(pool.contains(AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ));
        assert!(!AccessFlags::LOCAL_WRITE.contains(AccessFlags::REMOTE_READ));
    }
}
