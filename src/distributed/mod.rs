//! Multi-process data parallelism
//!
//! One training process per GPU. Processes find each other through the
//! launcher environment (`env`), rendezvous into a TCP `ProcessGroup`, and
//! average gradients after every backward pass through a pluggable
//! `GradientSynchronizer`:
//!
//! - `CpuStagingSynchronizer` - host-side all-reduce over the process group
//! - `NcclSynchronizer` - NCCL all-reduce (feature-gated)
//!
//! # Usage
//!
//! ```ignore
//! let env = DistEnv::from_env()?;
//! let group = Arc::new(ProcessGroup::init(&env, DEFAULT_RENDEZVOUS_TIMEOUT)?);
//! let sync = create_synchronizer(&config, group.clone(), 0)?;
//!
//! // In training loop, after backward pass:
//! let synced_grads = sync.synchronize_gradients(&grads, &varmap)?;
//! optimizer.step(&synced_grads)?;
//! ```

pub mod env;
pub mod group;
pub mod sync;
pub mod cpu_staging;
pub mod optimizer;

#[cfg(feature = "nccl")]
pub mod nccl;

use std::sync::Arc;

pub use env::DistEnv;
pub use group::{ProcessGroup, DEFAULT_RENDEZVOUS_TIMEOUT};
pub use sync::{
    broadcast_parameters, DistributedConfig, GradientSynchronizer, SyncBackend, SyncedGradient,
};
pub use cpu_staging::CpuStagingSynchronizer;
pub use optimizer::{build_optimizer, compute_grad_norm, AdamWConfig, DistributedAdamW, DistributedSgd, SgdConfig, TrainOptimizer};

#[cfg(feature = "nccl")]
pub use nccl::NcclSynchronizer;

/// Create a synchronizer based on configuration
///
/// `cuda_ordinal` is the device the NCCL communicator binds to; it is ignored
/// by the other backends.
#[allow(unused_variables)]
pub fn create_synchronizer(
    config: &DistributedConfig,
    group: Arc<ProcessGroup>,
    cuda_ordinal: usize,
) -> candle_core::Result<Box<dyn GradientSynchronizer>> {
    if group.world_size() <= 1 {
        return Ok(Box::new(CpuStagingSynchronizer::single()));
    }

    match config.backend {
        SyncBackend::Single => Err(candle_core::Error::Msg(format!(
            "sync backend 'single' cannot be used with {} processes",
            group.world_size()
        ))),
        SyncBackend::CpuStaging => Ok(Box::new(CpuStagingSynchronizer::new(group))),
        #[cfg(feature = "nccl")]
        SyncBackend::Nccl => Ok(Box::new(NcclSynchronizer::new(group, cuda_ordinal)?)),
        #[cfg(not(feature = "nccl"))]
        SyncBackend::Nccl => Err(candle_core::Error::Msg(
            "NCCL backend requested but 'nccl' feature is not enabled. \
             Compile with --features nccl to enable NCCL support."
                .to_string(),
        )),
    }
}
