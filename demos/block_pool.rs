//! Provision a pool from a config file and serve a few allocations.
//!
//! ```text
//! cargo run --example block_pool -- pool.toml
//! RUST_LOG=debug cargo run --example block_pool
//! ```

use rdma_pool::prelude::*;
use rdma_pool::rdma::LoopbackDomain;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    rdma_pool::observability::init_metrics();

    let config = match std::env::args().nth(1) {
        Some(path) => PoolConfig::from_file(path)?,
        None => PoolConfig {
            prealloc_size: 1,
            pinning: PinningMode::None,
            ..PoolConfig::default()
        },
    };

    let domain = LoopbackDomain::new();
    let manager = MemoryManager::new(&config, &domain);
    let block = config.block_size();

    let mut held = Vec::new();
    for blocks in [1, 3, 8, 2] {
        let alloc = manager.allocate(blocks * block)?;
        let key = manager.registration_key(alloc.pool_index);
        tracing::info!(
            "allocated {} blocks at {:p} (pool {}, lkey {:#x}, rkey {:#x})",
            blocks,
            alloc.ptr,
            alloc.pool_index,
            key.lkey,
            key.rkey
        );
        held.push((alloc, blocks * block));
    }

    tracing::info!(
        "{} of {} bytes free",
        manager.available_bytes(),
        manager.total_capacity()
    );

    for (alloc, size) in held {
        manager.deallocate(alloc.ptr.as_ptr(), size, alloc.pool_index)?;
    }

    tracing::info!("all blocks returned");
    Ok(())
}
