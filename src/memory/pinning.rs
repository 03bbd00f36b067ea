//! Pinning host memory for direct device access.
//!
//! A pinned region is locked against paging and relocation, so an
//! accelerator can DMA into it without staging. Three strategies exist:
//!
//! - [`CudaHostPinner`]: page-locks and maps the region for the CUDA driver
//!   (`cudaHostRegister`). The runtime library is loaded at startup, so the
//!   crate builds on hosts without CUDA.
//! - [`MlockPinner`]: `mlock(2)`, for hosts without an accelerator.
//! - [`NoPinning`]: leaves the memory pageable.

use crate::error::{Error, Result};
use libloading::{Library, Symbol};
use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::os::raw::{c_int, c_uint};
use std::sync::Arc;

/// Which pinning strategy a pool uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PinningMode {
    /// Register with the CUDA runtime.
    #[default]
    Cuda,
    /// Lock with `mlock(2)`.
    Mlock,
    /// Do not pin.
    None,
}

impl PinningMode {
    /// Build the pinner for this mode.
    ///
    /// # Errors
    ///
    /// Fails for [`PinningMode::Cuda`] when the CUDA runtime cannot be loaded.
    pub fn pinner(self) -> Result<Arc<dyn HostPinner>> {
        Ok(match self {
            PinningMode::Cuda => Arc::new(CudaHostPinner::load()?),
            PinningMode::Mlock => Arc::new(MlockPinner),
            PinningMode::None => Arc::new(NoPinning),
        })
    }
}

/// Strategy for pinning a host memory range.
pub trait HostPinner: Send + Sync {
    /// Pin `len` bytes at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + len` must be mapped and stay mapped until [`unpin`](Self::unpin).
    unsafe fn pin(&self, ptr: *mut u8, len: usize) -> Result<()>;

    /// Undo a previous [`pin`](Self::pin) of the same range.
    ///
    /// # Safety
    ///
    /// The range must have been pinned by this pinner and still be mapped.
    unsafe fn unpin(&self, ptr: *mut u8, len: usize) -> Result<()>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Leaves memory pageable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPinning;

impl HostPinner for NoPinning {
    unsafe fn pin(&self, _ptr: *mut u8, _len: usize) -> Result<()> {
        Ok(())
    }

    unsafe fn unpin(&self, _ptr: *mut u8, _len: usize) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Locks pages in RAM with `mlock(2)`.
///
/// Subject to `RLIMIT_MEMLOCK`; large regions usually need `CAP_IPC_LOCK`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MlockPinner;

impl HostPinner for MlockPinner {
    unsafe fn pin(&self, ptr: *mut u8, len: usize) -> Result<()> {
        unsafe { rustix::mm::mlock(ptr.cast(), len) }
            .map_err(|e| Error::Pin(format!("mlock of {len} bytes at {ptr:p} failed: {e}")))
    }

    unsafe fn unpin(&self, ptr: *mut u8, len: usize) -> Result<()> {
        unsafe { rustix::mm::munlock(ptr.cast(), len) }?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mlock"
    }
}

/// `cudaHostRegisterDefault`.
const CUDA_HOST_REGISTER_DEFAULT: c_uint = 0;

/// `cudaSuccess`.
const CUDA_SUCCESS: c_int = 0;

/// Shared library names tried in order.
const CUDART_CANDIDATES: &[&str] = &["libcudart.so", "libcudart.so.12", "libcudart.so.11.0"];

type HostRegisterFn = unsafe extern "C" fn(*mut c_void, usize, c_uint) -> c_int;
type HostUnregisterFn = unsafe extern "C" fn(*mut c_void) -> c_int;

/// Page-locks host memory through the CUDA runtime.
pub struct CudaHostPinner {
    host_register: HostRegisterFn,
    host_unregister: HostUnregisterFn,
    /// Keeps the function pointers above valid.
    _library: Library,
}

impl CudaHostPinner {
    /// Load the CUDA runtime and resolve the host registration entry points.
    pub fn load() -> Result<Self> {
        let mut last_error = None;
        for name in CUDART_CANDIDATES {
            // SAFETY: libcudart has no initialization side effects that
            // depend on the calling context.
            match unsafe { Library::new(name) } {
                Ok(library) => return Self::from_library(library),
                Err(e) => last_error = Some(e),
            }
        }
        Err(Error::Pin(format!(
            "failed to load CUDA runtime: {}",
            last_error.map_or_else(|| "no candidates".to_string(), |e| e.to_string())
        )))
    }

    fn from_library(library: Library) -> Result<Self> {
        let symbol_error = |e: libloading::Error| Error::Pin(format!("CUDA runtime symbol: {e}"));

        // SAFETY: the signatures match cuda_runtime_api.h.
        let (host_register, host_unregister) = unsafe {
            let register: Symbol<HostRegisterFn> =
                library.get(b"cudaHostRegister\0").map_err(symbol_error)?;
            let unregister: Symbol<HostUnregisterFn> =
                library.get(b"cudaHostUnregister\0").map_err(symbol_error)?;
            (*register, *unregister)
        };

        Ok(Self {
            host_register,
            host_unregister,
            _library: library,
        })
    }
}

impl HostPinner for CudaHostPinner {
    unsafe fn pin(&self, ptr: *mut u8, len: usize) -> Result<()> {
        let rc = unsafe { (self.host_register)(ptr.cast(), len, CUDA_HOST_REGISTER_DEFAULT) };
        if rc != CUDA_SUCCESS {
            return Err(Error::Pin(format!(
                "cudaHostRegister of {len} bytes at {ptr:p} failed (error {rc})"
            )));
        }
        Ok(())
    }

    unsafe fn unpin(&self, ptr: *mut u8, _len: usize) -> Result<()> {
        let rc = unsafe { (self.host_unregister)(ptr.cast()) };
        if rc != CUDA_SUCCESS {
            return Err(Error::Pin(format!(
                "cudaHostUnregister at {ptr:p} failed (error {rc})"
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "cuda"
    }
}

impl std::fmt::Debug for CudaHostPinner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaHostPinner").finish_non_exhaustive()
    }
}
