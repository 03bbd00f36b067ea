//! Page-aligned host memory backing a pool.

use crate::error::{Error, Result};
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;

/// A contiguous, page-aligned, zero-filled host memory region.
///
/// Backed by a private anonymous mapping, so the start address is always
/// aligned to the system page size. The mapping is released on drop.
pub struct HostRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl HostRegion {
    /// Map a new region of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is zero or `mmap` fails.
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::RegionAllocation(
                "size must be greater than 0".into(),
            ));
        }

        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        }
        .map_err(|e| Error::RegionAllocation(format!("mmap of {len} bytes failed: {e}")))?;

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::RegionAllocation("mmap returned null".into()))?;

        Ok(Self { ptr, len })
    }

    /// Start of the region.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Size of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero-length regions cannot be created.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) {
                tracing::error!("munmap of host region at {:p} failed: {}", self.ptr, e);
            }
        }
    }
}

impl std::fmt::Debug for HostRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

// SAFETY: the mapping is private to this process and exclusively owned by
// the region; access to its contents is coordinated by the owning pool.
unsafe impl Send for HostRegion {}
unsafe impl Sync for HostRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_creation() {
        let region = HostRegion::new(3 * 4096).unwrap();
        assert_eq!(region.len(), 3 * 4096);
        assert!(!region.is_empty());
    }

    #[test]
    fn test_region_is_page_aligned() {
        let page = rustix::param::page_size();
        let region = HostRegion::new(1000).unwrap();
        assert_eq!(region.as_ptr().as_ptr() as usize % page, 0);
    }

    #[test]
    fn test_region_zero_size_fails() {
        assert!(matches!(HostRegion::new(0), Err(Error::RegionAllocation(_))));
    }

    #[test]
    fn test_region_is_zeroed_and_writable() {
        let region = HostRegion::new(8192).unwrap();
        let slice = unsafe { std::slice::from_raw_parts_mut(region.as_ptr().as_ptr(), region.len()) };
        assert!(slice.iter().all(|&b| b == 0));
        slice[0] = 42;
        slice[8191] = 43;
        assert_eq!(slice[0], 42);
        assert_eq!(slice[8191], 43);
    }
}
