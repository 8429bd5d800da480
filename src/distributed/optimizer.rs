//! Optimizers over synchronized gradients
//!
//! Candle's built-in optimizers take a `GradStore`, which is opaque and
//! cannot be replaced by averaged gradients. The optimizers here take the
//! explicit `(name, var, grad)` list produced by a `GradientSynchronizer`
//! and expose a settable learning rate for the schedulers.

use candle_core::{DType, Result, Tensor};
use candle_nn::VarMap;
use std::collections::HashMap;

use super::sync::SyncedGradient;
use crate::config::OptimizerArgs;

/// Common surface of the training optimizers.
pub trait TrainOptimizer {
    /// Apply one update with already-synchronized gradients
    fn step(&mut self, synced_grads: &[SyncedGradient]) -> Result<()>;

    fn learning_rate(&self) -> f64;

    /// Called by the learning-rate scheduler before every step
    fn set_learning_rate(&mut self, lr: f64);
}

/// Build an optimizer by its config name (`SGD`, `AdamW`, `Adam`).
pub fn build_optimizer(
    name: &str,
    args: &OptimizerArgs,
    varmap: &VarMap,
) -> Result<Box<dyn TrainOptimizer>> {
    match name.to_lowercase().as_str() {
        "sgd" => Ok(Box::new(DistributedSgd::new(SgdConfig {
            lr: args.lr,
            momentum: args.momentum,
            dampening: args.dampening,
            nesterov: args.nesterov,
            weight_decay: args.weight_decay,
        })?)),
        "adamw" | "adam" => Ok(Box::new(DistributedAdamW::new(
            varmap,
            AdamWConfig {
                lr: args.lr,
                beta1: args.beta1,
                beta2: args.beta2,
                eps: args.eps,
                weight_decay: args.weight_decay,
            },
        )?)),
        other => Err(candle_core::Error::Msg(format!(
            "Unknown optimizer: {}. Valid options: SGD, AdamW",
            other
        ))),
    }
}

/// SGD configuration (torch semantics)
#[derive(Debug, Clone)]
pub struct SgdConfig {
    pub lr: f64,
    pub momentum: f64,
    pub dampening: f64,
    pub nesterov: bool,
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.0,
            dampening: 0.0,
            nesterov: false,
            weight_decay: 0.0,
        }
    }
}

/// SGD with momentum, dampening, Nesterov and L2 weight decay.
///
/// ```text
/// d = g + λ * θ
/// b = d                              (first step)
/// b = μ * b + (1 - τ) * d            (later steps)
/// d = d + μ * b  if nesterov else b
/// θ = θ - lr * d
/// ```
pub struct DistributedSgd {
    momentum_buffers: HashMap<String, Tensor>,
    config: SgdConfig,
}

impl DistributedSgd {
    pub fn new(config: SgdConfig) -> Result<Self> {
        if config.nesterov && (config.momentum <= 0.0 || config.dampening != 0.0) {
            return Err(candle_core::Error::Msg(
                "Nesterov momentum requires a momentum and zero dampening".to_string(),
            ));
        }
        Ok(Self {
            momentum_buffers: HashMap::new(),
            config,
        })
    }
}

impl TrainOptimizer for DistributedSgd {
    fn step(&mut self, synced_grads: &[SyncedGradient]) -> Result<()> {
        let cfg = &self.config;

        for (name, var, grad) in synced_grads {
            let param = var.as_tensor();
            let grad = grad.to_device(param.device())?.to_dtype(param.dtype())?;

            let mut d_p = if cfg.weight_decay != 0.0 {
                (grad + (param * cfg.weight_decay)?)?
            } else {
                grad
            };

            if cfg.momentum != 0.0 {
                let buf = match self.momentum_buffers.get(name) {
                    None => d_p.clone(),
                    Some(prev) => ((prev * cfg.momentum)? + (&d_p * (1.0 - cfg.dampening))?)?,
                };
                d_p = if cfg.nesterov {
                    (d_p + (&buf * cfg.momentum)?)?
                } else {
                    buf.clone()
                };
                self.momentum_buffers.insert(name.clone(), buf);
            }

            let new_param = param.sub(&(d_p * cfg.lr)?)?;
            var.set(&new_param)?;
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

/// AdamW optimizer configuration
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    /// Learning rate
    pub lr: f64,
    /// Beta1 (first moment decay)
    pub beta1: f64,
    /// Beta2 (second moment decay)
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// Distributed AdamW optimizer
///
/// ```text
/// m = β₁ * m + (1 - β₁) * g
/// v = β₂ * v + (1 - β₂) * g²
/// m̂ = m / (1 - β₁ᵗ)
/// v̂ = v / (1 - β₂ᵗ)
/// θ = θ - lr * (m̂ / (√v̂ + ε) + λ * θ)
/// ```
pub struct DistributedAdamW {
    /// First moment estimates (m)
    m: HashMap<String, Tensor>,
    /// Second moment estimates (v)
    v: HashMap<String, Tensor>,
    config: AdamWConfig,
    /// Current step (for bias correction)
    step_count: usize,
}

impl DistributedAdamW {
    pub fn new(varmap: &VarMap, config: AdamWConfig) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("VarMap lock poisoned".to_string()))?;
        let mut m = HashMap::with_capacity(data.len());
        let mut v = HashMap::with_capacity(data.len());

        for (name, var) in data.iter() {
            let tensor = var.as_tensor();
            let zeros = Tensor::zeros(tensor.shape(), tensor.dtype(), tensor.device())?;
            m.insert(name.clone(), zeros.clone());
            v.insert(name.clone(), zeros);
        }

        Ok(Self {
            m,
            v,
            config,
            step_count: 0,
        })
    }
}

impl TrainOptimizer for DistributedAdamW {
    fn step(&mut self, synced_grads: &[SyncedGradient]) -> Result<()> {
        self.step_count += 1;
        let t = self.step_count as f64;

        let bias_correction1 = 1.0 - self.config.beta1.powf(t);
        let bias_correction2 = 1.0 - self.config.beta2.powf(t);

        for (name, var, grad) in synced_grads {
            let m_t = self.m.get_mut(name).ok_or_else(|| {
                candle_core::Error::Msg(format!("Unknown parameter: {}", name))
            })?;
            let v_t = self.v.get_mut(name).ok_or_else(|| {
                candle_core::Error::Msg(format!("Unknown parameter: {}", name))
            })?;

            let param = var.as_tensor();
            let grad = grad.to_device(param.device())?.to_dtype(param.dtype())?;

            let new_m = ((&*m_t * self.config.beta1)? + (&grad * (1.0 - self.config.beta1))?)?;
            let new_v = ((&*v_t * self.config.beta2)? + (grad.sqr()? * (1.0 - self.config.beta2))?)?;

            let m_hat = (&new_m / bias_correction1)?;
            let v_hat = (&new_v / bias_correction2)?;
            *m_t = new_m;
            *v_t = new_v;

            let adam_update = (m_hat.div(&(v_hat.sqrt()? + self.config.eps)?)? * self.config.lr)?;
            let decay = (param * (self.config.lr * self.config.weight_decay))?;

            let new_param = param.sub(&adam_update)?.sub(&decay)?;
            var.set(&new_param)?;
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}

/// Compute gradient norm from synchronized gradients
pub fn compute_grad_norm(synced_grads: &[SyncedGradient]) -> Result<f64> {
    let mut total_norm_sq = 0.0f64;

    for (_, _, grad) in synced_grads {
        let grad_norm_sq = grad
            .sqr()?
            .sum_all()?
            .to_dtype(DType::F64)?
            .to_vec0::<f64>()?;
        total_norm_sq += grad_norm_sq;
    }

    Ok(total_norm_sq.sqrt())
}
