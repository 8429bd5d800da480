//! ResNet speaker encoder (BasicBlock variants)
//!
//! The feature matrix is treated as a one-channel image with frequency as
//! height and time as width. Four residual stages (strides 1, 2, 2, 2) widen
//! the channels from `m_channels` to `8 * m_channels`; frequency is then
//! folded into the channels and pooled over time.
//!
//! # Architecture
//!
//! ```text
//! (B, T, F) → (B, 1, F, T) → conv3x3 → layer1..layer4 → (B, 8m * F/8, T/8)
//!           → stats pool → seg_1 [→ relu → bn → seg_2]
//! ```

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Linear, VarBuilder};

use super::pooling::statistics_pooling;

const STAGE_STRIDES: [usize; 4] = [1, 2, 2, 2];

/// Output length of a kernel-3, padding-1 convolution with the given stride
fn conv_out(len: usize, stride: usize) -> usize {
    (len - 1) / stride + 1
}

/// Length of a frequency or time axis after the four stages (0 stays 0).
pub fn downsampled(len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    STAGE_STRIDES.iter().fold(len, |l, &s| conv_out(l, s))
}

fn conv3x3(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    candle_nn::conv2d_no_bias(in_c, out_c, 3, cfg, vb)
}

struct Shortcut {
    conv: Conv2d,
    bn: BatchNorm,
}

struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    shortcut: Option<Shortcut>,
}

impl BasicBlock {
    fn new(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let shortcut = if stride != 1 || in_c != out_c {
            let cfg = Conv2dConfig {
                stride,
                ..Default::default()
            };
            Some(Shortcut {
                conv: candle_nn::conv2d_no_bias(in_c, out_c, 1, cfg, vb.pp("shortcut.0"))?,
                bn: candle_nn::batch_norm(out_c, 1e-5, vb.pp("shortcut.1"))?,
            })
        } else {
            None
        };
        Ok(Self {
            conv1: conv3x3(in_c, out_c, stride, vb.pp("conv1"))?,
            bn1: candle_nn::batch_norm(out_c, 1e-5, vb.pp("bn1"))?,
            conv2: conv3x3(out_c, out_c, 1, vb.pp("conv2"))?,
            bn2: candle_nn::batch_norm(out_c, 1e-5, vb.pp("bn2"))?,
            shortcut,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.bn1.forward_t(&self.conv1.forward(x)?, train)?.relu()?;
        let out = self.bn2.forward_t(&self.conv2.forward(&out)?, train)?;
        let residual = match &self.shortcut {
            Some(s) => s.bn.forward_t(&s.conv.forward(x)?, train)?,
            None => x.clone(),
        };
        (out + residual)?.relu()
    }
}

/// Blocks per stage for the named depth
pub fn stage_blocks(name: &str) -> Option<[usize; 4]> {
    match name {
        "ResNet18" => Some([2, 2, 2, 2]),
        "ResNet34" => Some([3, 4, 6, 3]),
        _ => None,
    }
}

pub struct ResNet {
    conv1: Conv2d,
    bn1: BatchNorm,
    stages: Vec<Vec<BasicBlock>>,
    seg_1: Linear,
    second_emb: Option<(BatchNorm, Linear)>,
}

impl ResNet {
    /// # Arguments
    /// * `blocks` - residual blocks in each of the four stages
    /// * `m_channels` - channels of the first stage
    /// * `feat_dim` - input frequency bins
    /// * `embed_dim` - embedding size
    /// * `two_emb_layer` - add a ReLU/BN/Linear after the first embedding layer
    pub fn new(
        blocks: [usize; 4],
        m_channels: usize,
        feat_dim: usize,
        embed_dim: usize,
        two_emb_layer: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv1 = conv3x3(1, m_channels, 1, vb.pp("conv1"))?;
        let bn1 = candle_nn::batch_norm(m_channels, 1e-5, vb.pp("bn1"))?;

        let mut stages = Vec::with_capacity(4);
        let mut in_c = m_channels;
        for (i, &n) in blocks.iter().enumerate() {
            let out_c = m_channels << i;
            let stride = STAGE_STRIDES[i];
            let vb_stage = vb.pp(format!("layer{}", i + 1));
            let mut stage = Vec::with_capacity(n);
            for b in 0..n {
                let s = if b == 0 { stride } else { 1 };
                stage.push(BasicBlock::new(in_c, out_c, s, vb_stage.pp(b.to_string()))?);
                in_c = out_c;
            }
            stages.push(stage);
        }

        let stats_dim = in_c * downsampled(feat_dim) * 2;
        let seg_1 = candle_nn::linear(stats_dim, embed_dim, vb.pp("seg_1"))?;
        let second_emb = if two_emb_layer {
            let bn_cfg = BatchNormConfig {
                affine: false,
                ..Default::default()
            };
            Some((
                candle_nn::batch_norm(embed_dim, bn_cfg, vb.pp("seg_bn_1"))?,
                candle_nn::linear(embed_dim, embed_dim, vb.pp("seg_2"))?,
            ))
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1,
            stages,
            seg_1,
            second_emb,
        })
    }

    pub fn forward_t(&self, feats: &Tensor, train: bool) -> Result<Tensor> {
        // (B, T, F) → (B, 1, F, T)
        let x = feats.transpose(1, 2)?.unsqueeze(1)?.contiguous()?;
        let mut x = self.bn1.forward_t(&self.conv1.forward(&x)?, train)?.relu()?;
        for stage in &self.stages {
            for block in stage {
                x = block.forward_t(&x, train)?;
            }
        }

        let (b, c, f, t) = x.dims4()?;
        let x = x.reshape((b, c * f, t))?;
        let embed_a = self.seg_1.forward(&statistics_pooling(&x)?)?;
        match &self.second_emb {
            Some((bn, seg_2)) => {
                let out = bn.forward_t(&embed_a.relu()?, train)?;
                seg_2.forward(&out)
            }
            None => Ok(embed_a),
        }
    }
}
