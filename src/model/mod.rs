//! Speaker embedding network: encoder + projection head
//!
//! # Architecture
//!
//! ```text
//! feats (B, T, F) → encoder → embedding (B, embed_dim) → projection(labels) → logits (B, num_class)
//! ```
//!
//! Variable names are prefixed `encoder.` and `projection.` so checkpoints of
//! the encoder can be reused with a different head.

pub mod pooling;
pub mod projection;
pub mod resnet;
pub mod tdnn;

use candle_core::{DType, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::config::{ModelArgs, ProjectionArgs};

pub use projection::{AddMarginProduct, ArcMarginProduct, MarginUpdate, Projection};
pub use resnet::ResNet;
pub use tdnn::XVector;

/// Encoder architecture, selected by the config `model` name
pub enum Encoder {
    XVector(XVector),
    ResNet(ResNet),
}

impl Encoder {
    pub fn new(name: &str, args: &ModelArgs, vb: VarBuilder) -> Result<Self> {
        match name {
            "TDNN" | "XVEC" => Ok(Encoder::XVector(XVector::new(
                args.feat_dim,
                args.hidden_dim.unwrap_or(512),
                args.stats_dim.unwrap_or(1500),
                args.embed_dim,
                vb,
            )?)),
            _ => match resnet::stage_blocks(name) {
                Some(blocks) => Ok(Encoder::ResNet(ResNet::new(
                    blocks,
                    args.m_channels.unwrap_or(32),
                    args.feat_dim,
                    args.embed_dim,
                    args.two_emb_layer,
                    vb,
                )?)),
                None => Err(candle_core::Error::Msg(format!(
                    "Unknown model: {}. Valid options: TDNN, XVEC, ResNet18, ResNet34",
                    name
                ))),
            },
        }
    }

    pub fn forward_t(&self, feats: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Encoder::XVector(m) => m.forward_t(feats, train),
            Encoder::ResNet(m) => m.forward_t(feats, train),
        }
    }
}

pub struct SpeakerNet {
    name: String,
    encoder: Encoder,
    projection: Projection,
}

impl SpeakerNet {
    pub fn new(
        name: &str,
        model_args: &ModelArgs,
        projection_args: &ProjectionArgs,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            encoder: Encoder::new(name, model_args, vb.pp("encoder"))?,
            projection: Projection::new(projection_args, vb.pp("projection"))?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    /// Speaker embedding
    pub fn embed(&self, feats: &Tensor, train: bool) -> Result<Tensor> {
        self.encoder.forward_t(feats, train)
    }

    /// Training forward pass: logits from features and target labels
    pub fn forward_t(&self, feats: &Tensor, labels: &Tensor, train: bool) -> Result<Tensor> {
        let embedding = self.embed(feats, train)?;
        self.projection.forward(&embedding, labels)
    }
}

impl MarginUpdate for SpeakerNet {
    fn margin(&self) -> Option<f64> {
        self.projection.margin()
    }

    fn update_margin(&mut self, margin: f64) {
        self.projection.update_margin(margin)
    }
}

/// Mean cross entropy with optional label smoothing.
///
/// With smoothing `ε` the target distribution puts `1 - ε` on the label and
/// spreads `ε` uniformly over all classes.
pub fn cross_entropy(logits: &Tensor, labels: &Tensor, label_smoothing: f64) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let nll = candle_nn::loss::nll(&log_probs, &labels.to_dtype(DType::U32)?)?;
    if label_smoothing <= 0.0 {
        return Ok(nll);
    }
    let smooth = log_probs.mean(D::Minus1)?.mean_all()?.neg()?;
    (nll * (1.0 - label_smoothing))? + (smooth * label_smoothing)?
}

/// Number of rows whose arg-max logit equals the label
pub fn correct_count(logits: &Tensor, labels: &Tensor) -> Result<usize> {
    let predicted = logits.argmax(D::Minus1)?;
    let hits = predicted
        .eq(&labels.to_dtype(DType::U32)?)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(hits as usize)
}

/// Total number of scalar parameters
pub fn parameter_count(varmap: &candle_nn::VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn model_args() -> ModelArgs {
        ModelArgs {
            feat_dim: 8,
            embed_dim: 4,
            m_channels: Some(2),
            two_emb_layer: false,
            hidden_dim: Some(8),
            stats_dim: Some(8),
        }
    }

    fn proj_args() -> ProjectionArgs {
        ProjectionArgs {
            project_type: "arc_margin".to_string(),
            scale: Some(32.0),
            easy_margin: false,
            embed_dim: 4,
            num_class: 3,
        }
    }

    #[test]
    fn test_speaker_net_forward_and_names() {
        let dev = Device::Cpu;
        for name in ["TDNN", "ResNet18"] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
            let net = SpeakerNet::new(name, &model_args(), &proj_args(), vb).unwrap();

            let feats = Tensor::randn(0f32, 1., (2, 20, 8), &dev).unwrap();
            let labels = Tensor::new(&[0u32, 2], &dev).unwrap();
            let logits = net.forward_t(&feats, &labels, true).unwrap();
            assert_eq!(logits.dims(), &[2, 3]);

            let data = varmap.data().lock().unwrap();
            assert!(data.contains_key("projection.weight"));
            assert!(data.keys().any(|k| k.starts_with("encoder.")));
        }
    }

    #[test]
    fn test_unknown_model() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(SpeakerNet::new("ECAPA", &model_args(), &proj_args(), vb).is_err());
    }

    #[test]
    fn test_cross_entropy_and_smoothing() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[0f32, 0.], [0., 0.]], &dev).unwrap();
        let labels = Tensor::new(&[0u32, 1], &dev).unwrap();
        let loss = cross_entropy(&logits, &labels, 0.0).unwrap().to_scalar::<f32>().unwrap();
        assert!((loss - 2f32.ln()).abs() < 1e-6);

        // uniform logits: smoothing does not change the loss
        let smoothed = cross_entropy(&logits, &labels, 0.1).unwrap().to_scalar::<f32>().unwrap();
        assert!((smoothed - 2f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_correct_count() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[2f32, 1.], [0., 3.], [5., 1.]], &dev).unwrap();
        let labels = Tensor::new(&[0u32, 1, 1], &dev).unwrap();
        assert_eq!(correct_count(&logits, &labels).unwrap(), 2);
    }
}
