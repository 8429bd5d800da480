//! NCCL-based gradient synchronization backend
//!
//! One process per GPU. Rank 0 creates the NCCL unique id and hands it to the
//! other ranks through the TCP process group, then every rank builds its own
//! communicator with `Comm::from_rank`. Barriers still go through the TCP group.
//!
//! # Requirements
//!
//! - CUDA 12.x
//! - NCCL library installed on the system
//! - Compile with `--features nccl`

use candle_core::Result;
use candle_nn::VarMap;
use cudarc::driver::{CudaContext, CudaStream};
use cudarc::nccl::{Comm, Id, ReduceOp};
use std::sync::{Arc, Mutex};

use super::group::ProcessGroup;
use super::sync::{
    collect_gradients, flatten_gradients, unflatten_gradients, GradientSynchronizer,
    SyncedGradient,
};

const NCCL_ID_BYTES: usize = 128;

pub struct NcclSynchronizer {
    group: Arc<ProcessGroup>,
    stream: Arc<CudaStream>,
    comm: Mutex<Comm>,
}

// SAFETY: the communicator is only used behind the Mutex
unsafe impl Send for NcclSynchronizer {}
unsafe impl Sync for NcclSynchronizer {}

impl NcclSynchronizer {
    /// Build the communicator for this rank on CUDA ordinal `ordinal`.
    ///
    /// Collective: every rank in `group` must call this at the same point.
    pub fn new(group: Arc<ProcessGroup>, ordinal: usize) -> Result<Self> {
        let stream = CudaContext::new(ordinal)
            .map(|ctx| ctx.default_stream())
            .map_err(|e| candle_core::Error::Msg(format!("Failed to create CUDA context: {:?}", e)))?;

        let mut id_bytes = if group.is_primary() {
            let id = Id::new()
                .map_err(|e| candle_core::Error::Msg(format!("Failed to create NCCL id: {:?}", e)))?;
            id.internal().iter().map(|&c| c as u8).collect::<Vec<u8>>()
        } else {
            Vec::new()
        };
        group
            .broadcast_bytes(&mut id_bytes)
            .map_err(candle_core::Error::wrap)?;
        if id_bytes.len() != NCCL_ID_BYTES {
            return Err(candle_core::Error::Msg(format!(
                "NCCL id has {} bytes, expected {}",
                id_bytes.len(),
                NCCL_ID_BYTES
            )));
        }

        let mut internal = [0 as std::ffi::c_char; NCCL_ID_BYTES];
        for (dst, src) in internal.iter_mut().zip(id_bytes.iter()) {
            *dst = *src as std::ffi::c_char;
        }
        let id = Id::uninit(internal);

        let comm = Comm::from_rank(stream.clone(), group.rank(), group.world_size(), id)
            .map_err(|e| candle_core::Error::Msg(format!("Failed to create NCCL comm: {:?}", e)))?;

        log::info!(
            "NCCL synchronizer initialized: rank {}/{} on cuda:{}",
            group.rank(),
            group.world_size(),
            ordinal
        );

        Ok(Self {
            group,
            stream,
            comm: Mutex::new(comm),
        })
    }

    fn all_reduce_mean(&self, data: &[f32]) -> Result<Vec<f32>> {
        let comm = self
            .comm
            .lock()
            .map_err(|_| candle_core::Error::Msg("NCCL comm lock poisoned".to_string()))?;

        let gpu_data = self
            .stream
            .clone_htod(data)
            .map_err(|e| candle_core::Error::Msg(format!("Failed to copy to GPU: {:?}", e)))?;
        let mut output = self
            .stream
            .alloc_zeros::<f32>(data.len())
            .map_err(|e| candle_core::Error::Msg(format!("Failed to allocate output: {:?}", e)))?;

        comm.all_reduce(&gpu_data, &mut output, &ReduceOp::Sum)
            .map_err(|e| candle_core::Error::Msg(format!("NCCL all_reduce failed: {:?}", e)))?;

        let mut result: Vec<f32> = self
            .stream
            .clone_dtoh(&output)
            .map_err(|e| candle_core::Error::Msg(format!("Failed to copy from GPU: {:?}", e)))?;

        let scale = 1.0 / self.group.world_size() as f32;
        for v in &mut result {
            *v *= scale;
        }
        Ok(result)
    }
}

impl GradientSynchronizer for NcclSynchronizer {
    fn synchronize_gradients(
        &self,
        grads: &candle_core::backprop::GradStore,
        varmap: &VarMap,
    ) -> Result<Vec<SyncedGradient>> {
        let local = collect_gradients(grads, varmap)?;
        let flat = flatten_gradients(&local)?;
        let reduced = self.all_reduce_mean(&flat)?;
        unflatten_gradients(&reduced, local)
    }

    fn local_rank(&self) -> usize {
        self.group.rank()
    }

    fn world_size(&self) -> usize {
        self.group.world_size()
    }
}
