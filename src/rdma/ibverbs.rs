//! libibverbs protection domain.

use super::{AccessFlags, MemoryRegistration, ProtectionDomain};
use crate::error::{Error, Result};
use std::os::raw::c_int;

/// A protection domain allocated by the transport layer through libibverbs.
///
/// The `ibv_pd` is borrowed: the transport that allocated it also
/// deallocates it, after every pool registered under it has been dropped.
pub struct IbvProtectionDomain {
    pd: *mut ibverbs_sys::ibv_pd,
}

// SAFETY: ibv_pd handles may be used from any thread; libibverbs serializes
// registration internally.
unsafe impl Send for IbvProtectionDomain {}
unsafe impl Sync for IbvProtectionDomain {}

impl IbvProtectionDomain {
    /// Wrap a raw protection domain.
    ///
    /// # Safety
    ///
    /// `pd` must be a valid `ibv_pd` that outlives this value and every
    /// registration created through it.
    pub unsafe fn from_raw(pd: *mut ibverbs_sys::ibv_pd) -> Result<Self> {
        if pd.is_null() {
            return Err(Error::Registration("null protection domain".into()));
        }
        Ok(Self { pd })
    }

    /// The raw protection domain.
    pub fn as_raw(&self) -> *mut ibverbs_sys::ibv_pd {
        self.pd
    }
}

impl ProtectionDomain for IbvProtectionDomain {
    unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<Box<dyn MemoryRegistration>> {
        let mr = unsafe { ibverbs_sys::ibv_reg_mr(self.pd, addr.cast(), len, access.bits() as c_int) };
        if mr.is_null() {
            return Err(Error::Registration(format!(
                "ibv_reg_mr failed for {len} bytes at {addr:p}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Box::new(IbvRegistration { mr }))
    }
}

/// An `ibv_mr` deregistered on drop.
struct IbvRegistration {
    mr: *mut ibverbs_sys::ibv_mr,
}

unsafe impl Send for IbvRegistration {}
unsafe impl Sync for IbvRegistration {}

impl MemoryRegistration for IbvRegistration {
    fn lkey(&self) -> u32 {
        unsafe { (*self.mr).lkey }
    }

    fn rkey(&self) -> u32 {
        unsafe { (*self.mr).rkey }
    }
}

impl Drop for IbvRegistration {
    fn drop(&mut self) {
        let rc = unsafe { ibverbs_sys::ibv_dereg_mr(self.mr) };
        if rc != 0 {
            tracing::error!("ibv_dereg_mr failed (rc={})", rc);
        }
    }
}
