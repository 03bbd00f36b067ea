//! Pool configuration.
//!
//! Sizes are expressed the way operators configure the server: the region
//! in GiB and the block ("minimal allocate size") in KiB. Use
//! [`PoolConfig::region_size`] and [`PoolConfig::block_size`] for bytes.
//!
//! ```toml
//! prealloc_size = 16          # GiB
//! minimal_allocate_size = 64  # KiB
//! auto_increase = false
//! num_stream = 1
//! pinning = "cuda"            # cuda | mlock | none
//! ```

use crate::error::{Error, Result};
use crate::memory::PinningMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default region size in GiB.
pub const DEFAULT_PREALLOC_SIZE_GB: usize = 16;

/// Default block size in KiB.
pub const DEFAULT_MINIMAL_ALLOCATE_SIZE_KB: usize = 64;

/// Allowed numbers of concurrent streams per client.
pub const SUPPORTED_STREAM_COUNTS: [usize; 3] = [1, 2, 4];

const GIB: usize = 1 << 30;
const KIB: usize = 1 << 10;

/// Configuration for the memory manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Size of the preallocated region, in GiB.
    pub prealloc_size: usize,
    /// Block size, in KiB. Every allocation is rounded up to this.
    pub minimal_allocate_size: usize,
    /// Grow by adding pools when exhausted. Recorded only: no growth
    /// policy exists, exhaustion is reported to the caller.
    pub auto_increase: bool,
    /// Concurrent streams per client (1, 2 or 4).
    pub num_stream: usize,
    /// How the region is pinned.
    pub pinning: PinningMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            prealloc_size: DEFAULT_PREALLOC_SIZE_GB,
            minimal_allocate_size: DEFAULT_MINIMAL_ALLOCATE_SIZE_KB,
            auto_increase: false,
            num_stream: 1,
            pinning: PinningMode::default(),
        }
    }
}

impl PoolConfig {
    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Check sizes and stream count.
    pub fn validate(&self) -> Result<()> {
        if self.prealloc_size == 0 {
            return Err(Error::InvalidConfig("prealloc_size must be > 0".into()));
        }
        if self.minimal_allocate_size == 0 {
            return Err(Error::InvalidConfig(
                "minimal_allocate_size must be > 0".into(),
            ));
        }
        let region = self.checked_region_size()?;
        let block = self.checked_block_size()?;
        if region % block != 0 {
            return Err(Error::InvalidConfig(format!(
                "prealloc_size ({} GiB) is not a multiple of minimal_allocate_size ({} KiB)",
                self.prealloc_size, self.minimal_allocate_size
            )));
        }
        if !SUPPORTED_STREAM_COUNTS.contains(&self.num_stream) {
            return Err(Error::InvalidConfig(format!(
                "num_stream must be one of {:?}, got {}",
                SUPPORTED_STREAM_COUNTS, self.num_stream
            )));
        }
        Ok(())
    }

    /// Region size in bytes.
    ///
    /// # Panics
    ///
    /// Panics if the size overflows `usize`; [`validate`](Self::validate) rejects such configs.
    pub fn region_size(&self) -> usize {
        self.prealloc_size
            .checked_mul(GIB)
            .unwrap_or_else(|| panic!("prealloc_size of {} GiB overflows", self.prealloc_size))
    }

    /// Block size in bytes.
    ///
    /// # Panics
    ///
    /// Panics if the size overflows `usize`; [`validate`](Self::validate) rejects such configs.
    pub fn block_size(&self) -> usize {
        self.minimal_allocate_size
            .checked_mul(KIB)
            .unwrap_or_else(|| panic!("minimal_allocate_size of {} KiB overflows", self.minimal_allocate_size))
    }

    fn checked_region_size(&self) -> Result<usize> {
        self.prealloc_size
            .checked_mul(GIB)
            .ok_or_else(|| Error::InvalidConfig("prealloc_size overflows".into()))
    }

    fn checked_block_size(&self) -> Result<usize> {
        self.minimal_allocate_size
            .checked_mul(KIB)
            .ok_or_else(|| Error::InvalidConfig("minimal_allocate_size overflows".into()))
    }
}
