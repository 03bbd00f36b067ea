//! In-process protection domain.

use super::{AccessFlags, MemoryRegistration, ProtectionDomain};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// A protection domain that lives entirely inside this process.
///
/// Registrations get unique, non-zero keys and are tracked until dropped,
/// so callers can resolve a key back to the registered range. This is the
/// domain used when transfers never leave the host (local GPU copies) and
/// in tests, where no RDMA device is present.
#[derive(Default)]
pub struct LoopbackDomain {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    next_key: AtomicU32,
    live: Mutex<HashMap<u32, LoopbackEntry>>,
}

#[derive(Debug, Clone, Copy)]
struct LoopbackEntry {
    addr: usize,
    len: usize,
    access: AccessFlags,
}

impl LoopbackDomain {
    /// Create an empty domain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registrations that have not been dropped yet.
    pub fn live_registrations(&self) -> usize {
        self.inner.live.lock().len()
    }

    /// Look up the range and access registered under `rkey`.
    pub fn resolve(&self, rkey: u32) -> Option<(*const u8, usize, AccessFlags)> {
        self.inner
            .live
            .lock()
            .get(&rkey)
            .map(|e| (e.addr as *const u8, e.len, e.access))
    }
}

impl ProtectionDomain for LoopbackDomain {
    unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<Box<dyn MemoryRegistration>> {
        if addr.is_null() || len == 0 {
            return Err(Error::Registration(format!(
                "cannot register {len} bytes at {addr:p}"
            )));
        }

        // Keys start at 1; zero is never handed out.
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.live.lock().insert(
            key,
            LoopbackEntry {
                addr: addr as usize,
                len,
                access,
            },
        );

        tracing::debug!("loopback registration {} covers {} bytes at {:p}", key, len, addr);

        Ok(Box::new(LoopbackRegistration {
            key,
            domain: Arc::clone(&self.inner),
        }))
    }
}

struct LoopbackRegistration {
    key: u32,
    domain: Arc<Shared>,
}

impl MemoryRegistration for LoopbackRegistration {
    fn lkey(&self) -> u32 {
        self.key
    }

    fn rkey(&self) -> u32 {
        self.key
    }
}

impl Drop for LoopbackRegistration {
    fn drop(&mut self) {
        self.domain.live.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_drop() {
        let domain = LoopbackDomain::new();
        let mut buf = vec![0u8; 64];

        let reg = unsafe { domain.register(buf.as_mut_ptr(), buf.len(), AccessFlags::POOL) }.unwrap();
        assert_eq!(domain.live_registrations(), 1);
        assert_ne!(reg.lkey(), 0);

        let (addr, len, access) = domain.resolve(reg.rkey()).unwrap();
        assert_eq!(addr, buf.as_ptr());
        assert_eq!(len, 64);
        assert_eq!(access, AccessFlags::POOL);

        drop(reg);
        assert_eq!(domain.live_registrations(), 0);
    }

    #[test]
    fn test_keys_are_unique() {
        let domain = LoopbackDomain::new();
        let mut a = vec![0u8; 8];
        let mut b = vec![0u8; 8];

        let ra = unsafe { domain.register(a.as_mut_ptr(), 8, AccessFlags::POOL) }.unwrap();
        let rb = unsafe { domain.register(b.as_mut_ptr(), 8, AccessFlags::POOL) }.unwrap();
        assert_ne!(ra.key(), rb.key());
    }

    #[test]
    fn test_register_empty_range_fails() {
        let domain = LoopbackDomain::new();
        let mut buf = vec![0u8; 8];
        let result = unsafe { domain.register(buf.as_mut_ptr(), 0, AccessFlags::POOL) };
        assert!(matches!(result, Err(Error::Registration(_))));
    }
}
