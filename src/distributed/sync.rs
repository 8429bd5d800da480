//! Core trait and types for gradient synchronization
//!
//! This module defines the `GradientSynchronizer` trait that all backends must implement,
//! the configuration types for distributed training, and the helpers that turn a
//! `GradStore` into a flat, rank-independent bucket and back.

use candle_core::{DType, Result, Tensor, Var};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use super::group::ProcessGroup;

/// Synchronization backend selection
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SyncBackend {
    /// No synchronization (single process)
    #[serde(alias = "none")]
    Single,
    /// Gradients staged on CPU and all-reduced over the TCP process group
    #[default]
    #[serde(alias = "cpu", alias = "cpu_staging", alias = "tcp", alias = "gloo")]
    CpuStaging,
    /// NCCL-based all-reduce (requires 'nccl' feature)
    Nccl,
}

fn default_rendezvous_timeout_secs() -> u64 {
    300
}

/// Configuration for distributed training
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DistributedConfig {
    /// Synchronization backend used when more than one process is launched
    #[serde(default)]
    pub backend: SyncBackend,

    /// How long rank 0 waits for the other ranks to join
    #[serde(default = "default_rendezvous_timeout_secs")]
    pub rendezvous_timeout_secs: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            backend: SyncBackend::default(),
            rendezvous_timeout_secs: default_rendezvous_timeout_secs(),
        }
    }
}

/// Synchronized gradient: parameter name and its averaged gradient tensor
pub type SyncedGradient = (String, Var, Tensor);

/// Trait for gradient synchronization across training processes
///
/// Implementations average the gradients every rank computed for its own
/// shard of the batch, so that all replicas apply the same update.
pub trait GradientSynchronizer: Send + Sync {
    /// Synchronize gradients across all ranks
    ///
    /// Returns `(param_name, var, averaged_gradient)` for every variable that
    /// received a gradient, ordered by parameter name.
    fn synchronize_gradients(
        &self,
        grads: &candle_core::backprop::GradStore,
        varmap: &VarMap,
    ) -> Result<Vec<SyncedGradient>>;

    /// Rank of this process
    fn local_rank(&self) -> usize;

    /// Total number of processes participating
    fn world_size(&self) -> usize;

    /// Check if this is the primary process (rank 0)
    fn is_primary(&self) -> bool {
        self.local_rank() == 0
    }

}

/// Gradients from the backward pass, sorted by parameter name.
///
/// `VarMap` is a `HashMap`, so iteration order differs between processes;
/// sorting gives every rank the same bucket layout.
pub fn collect_gradients(
    grads: &candle_core::backprop::GradStore,
    varmap: &VarMap,
) -> Result<Vec<SyncedGradient>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("VarMap lock poisoned".to_string()))?;
    let mut result: Vec<SyncedGradient> = data
        .iter()
        .filter_map(|(name, var)| grads.get(var).map(|g| (name.clone(), var.clone(), g.clone())))
        .collect();
    result.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(result)
}

/// Concatenate every gradient into one f32 host buffer.
pub fn flatten_gradients(grads: &[SyncedGradient]) -> Result<Vec<f32>> {
    let total: usize = grads.iter().map(|(_, _, g)| g.elem_count()).sum();
    let mut flat = Vec::with_capacity(total);
    for (_, _, grad) in grads {
        let values: Vec<f32> = grad.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        flat.extend_from_slice(&values);
    }
    Ok(flat)
}

/// Split a flat buffer back into gradients shaped, typed and placed like `like`.
pub fn unflatten_gradients(flat: &[f32], like: Vec<SyncedGradient>) -> Result<Vec<SyncedGradient>> {
    let mut offset = 0;
    let mut result = Vec::with_capacity(like.len());
    for (name, var, grad) in like {
        let n = grad.elem_count();
        if offset + n > flat.len() {
            return Err(candle_core::Error::Msg(format!(
                "gradient bucket too short for {}: need {} values at offset {}, have {}",
                name,
                n,
                offset,
                flat.len()
            )));
        }
        let synced = Tensor::from_slice(&flat[offset..offset + n], grad.shape(), grad.device())?
            .to_dtype(grad.dtype())?;
        offset += n;
        result.push((name, var, synced));
    }
    Ok(result)
}

/// Copy rank 0's parameter values to every other rank.
///
/// Run once after model construction (and after any initial checkpoint load)
/// so every replica starts from the same weights.
pub fn broadcast_parameters(group: &ProcessGroup, varmap: &VarMap) -> Result<()> {
    if group.world_size() <= 1 {
        return Ok(());
    }

    let vars: Vec<(String, Var)> = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("VarMap lock poisoned".to_string()))?;
        let mut vars: Vec<(String, Var)> =
            data.iter().map(|(n, v)| (n.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    };

    let mut flat = Vec::new();
    for (_, var) in &vars {
        let values: Vec<f32> = var.as_tensor().flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        flat.extend_from_slice(&values);
    }

    group.broadcast(&mut flat).map_err(candle_core::Error::wrap)?;

    let mut offset = 0;
    for (_, var) in &vars {
        let t = var.as_tensor();
        let n = t.elem_count();
        let value = Tensor::from_slice(&flat[offset..offset + n], t.shape(), t.device())?
            .to_dtype(t.dtype())?;
        var.set(&value)?;
        offset += n;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_backend_yaml_aliases() {
        for name in ["tcp", "cpu", "cpu_staging", "cpustaging", "gloo"] {
            let b: SyncBackend = serde_yaml::from_str(name).unwrap();
            assert_eq!(b, SyncBackend::CpuStaging);
        }
        let b: SyncBackend = serde_yaml::from_str("none").unwrap();
        assert_eq!(b, SyncBackend::Single);
        let b: SyncBackend = serde_yaml::from_str("nccl").unwrap();
        assert_eq!(b, SyncBackend::Nccl);
        assert!(serde_yaml::from_str::<SyncBackend>("mpi").is_err());
    }

    #[test]
    fn test_flatten_unflatten_preserves_shapes() {
        let dev = Device::Cpu;
        let a = Var::from_tensor(&Tensor::zeros((2, 2), DType::F32, &dev).unwrap()).unwrap();
        let b = Var::from_tensor(&Tensor::zeros(3, DType::F32, &dev).unwrap()).unwrap();
        let grads = vec![
            ("a".to_string(), a, Tensor::new(&[[1f32, 2.], [3., 4.]], &dev).unwrap()),
            ("b".to_string(), b, Tensor::new(&[5f32, 6., 7.], &dev).unwrap()),
        ];

        let flat = flatten_gradients(&grads).unwrap();
        assert_eq!(flat, vec![1., 2., 3., 4., 5., 6., 7.]);

        let doubled: Vec<f32> = flat.iter().map(|v| v * 2.0).collect();
        let back = unflatten_gradients(&doubled, grads).unwrap();
        assert_eq!(back[0].2.dims(), &[2, 2]);
        assert_eq!(back[1].2.to_vec1::<f32>().unwrap(), vec![10., 12., 14.]);
    }

    #[test]
    fn test_unflatten_rejects_short_bucket() {
        let dev = Device::Cpu;
        let a = Var::from_tensor(&Tensor::zeros(4, DType::F32, &dev).unwrap()).unwrap();
        let grads = vec![("a".to_string(), a, Tensor::zeros(4, DType::F32, &dev).unwrap())];
        assert!(unflatten_gradients(&[1.0, 2.0], grads).is_err());
    }
}
