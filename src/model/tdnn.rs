//! TDNN x-vector encoder
//!
//! Five dilated 1-d convolution layers over time, statistics pooling and a
//! linear embedding layer:
//!
//! ```text
//! (B, T, F) → frame1..frame5 → stats pool (B, 2 * stats_dim) → embedding (B, embed_dim)
//! ```

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv1d, Conv1dConfig, Linear, VarBuilder};

use super::pooling::statistics_pooling;

/// Conv1d → ReLU → BatchNorm
struct TdnnLayer {
    conv: Conv1d,
    bn: BatchNorm,
}

impl TdnnLayer {
    fn new(in_dim: usize, out_dim: usize, kernel: usize, dilation: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig {
            dilation,
            ..Default::default()
        };
        Ok(Self {
            conv: candle_nn::conv1d(in_dim, out_dim, kernel, cfg, vb.pp("conv"))?,
            bn: candle_nn::batch_norm(out_dim, 1e-5, vb.pp("bn"))?,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv.forward(x)?.relu()?;
        self.bn.forward_t(&x, train)
    }
}

pub struct XVector {
    layers: Vec<TdnnLayer>,
    embedding: Linear,
}

impl XVector {
    pub fn new(
        feat_dim: usize,
        hidden_dim: usize,
        stats_dim: usize,
        embed_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        // (in, out, kernel, dilation)
        let layout = [
            (feat_dim, hidden_dim, 5, 1),
            (hidden_dim, hidden_dim, 3, 2),
            (hidden_dim, hidden_dim, 3, 3),
            (hidden_dim, hidden_dim, 1, 1),
            (hidden_dim, stats_dim, 1, 1),
        ];
        let layers = layout
            .iter()
            .enumerate()
            .map(|(i, &(i_dim, o_dim, k, d))| {
                TdnnLayer::new(i_dim, o_dim, k, d, vb.pp(format!("frame{}", i + 1)))
            })
            .collect::<Result<Vec<_>>>()?;
        let embedding = candle_nn::linear(stats_dim * 2, embed_dim, vb.pp("seg_1"))?;
        Ok(Self { layers, embedding })
    }

    /// Frames consumed by the convolution stack (the output is this much shorter)
    pub fn receptive_field() -> usize {
        // kernel 5, then two dilated kernel-3 layers
        4 + 2 * 2 + 2 * 3
    }

    pub fn forward_t(&self, feats: &Tensor, train: bool) -> Result<Tensor> {
        // (B, T, F) → (B, F, T)
        let mut x = feats.transpose(1, 2)?.contiguous()?;
        for layer in &self.layers {
            x = layer.forward_t(&x, train)?;
        }
        let stats = statistics_pooling(&x)?;
        self.embedding.forward(&stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_output_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = XVector::new(8, 16, 24, 6, vb).unwrap();

        let x = Tensor::randn(0f32, 1., (3, 30, 8), &Device::Cpu).unwrap();
        let emb = model.forward_t(&x, true).unwrap();
        assert_eq!(emb.dims(), &[3, 6]);
        assert!(varmap.data().lock().unwrap().contains_key("frame1.conv.weight"));
        assert_eq!(XVector::receptive_field(), 14);
    }
}
