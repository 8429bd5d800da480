//! Classification heads mapping embeddings to speaker logits
//!
//! The margin heads compare the L2-normalised embedding with L2-normalised
//! class weights and penalise the target class:
//!
//! - `add_margin` (CosFace): `s * (cos θ - m)` for the target class
//! - `arc_margin` (ArcFace): `s * cos(θ + m)` for the target class
//!
//! Non-target logits are `s * cos θ` in both cases.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{Init, Linear, VarBuilder};

use crate::config::ProjectionArgs;

const DEFAULT_SCALE: f64 = 32.0;

/// A projection whose margin can be scheduled during training.
pub trait MarginUpdate {
    /// Current margin; `None` when there is no margin to schedule
    fn margin(&self) -> Option<f64>;

    fn update_margin(&mut self, margin: f64);
}

fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12f64)?;
    x.broadcast_div(&norm)
}

/// Cosine similarity between every embedding and every class weight
fn cosine(x: &Tensor, weight: &Tensor) -> Result<Tensor> {
    l2_normalize(x)?.matmul(&l2_normalize(weight)?.t()?)
}

/// `(B, C)` mask that is 1 at each row's label
fn target_mask(labels: &Tensor, num_class: usize) -> Result<Tensor> {
    let classes = Tensor::arange(0u32, num_class as u32, labels.device())?.unsqueeze(0)?;
    labels
        .to_dtype(DType::U32)?
        .unsqueeze(1)?
        .broadcast_eq(&classes)
}

fn class_weight(num_class: usize, embed_dim: usize, vb: &VarBuilder) -> Result<Tensor> {
    // xavier uniform
    let bound = (6.0 / (num_class + embed_dim) as f64).sqrt();
    vb.get_with_hints(
        (num_class, embed_dim),
        "weight",
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )
}

/// CosFace head
pub struct AddMarginProduct {
    weight: Tensor,
    num_class: usize,
    scale: f64,
    margin: f64,
}

impl AddMarginProduct {
    pub fn new(embed_dim: usize, num_class: usize, scale: f64, margin: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: class_weight(num_class, embed_dim, &vb)?,
            num_class,
            scale,
            margin,
        })
    }

    pub fn forward(&self, x: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let cos = cosine(x, &self.weight)?;
        let phi = (&cos - self.margin)?;
        let mask = target_mask(labels, self.num_class)?;
        mask.where_cond(&phi, &cos)? * self.scale
    }
}

/// ArcFace head
pub struct ArcMarginProduct {
    weight: Tensor,
    num_class: usize,
    scale: f64,
    easy_margin: bool,
    margin: f64,
    cos_m: f64,
    sin_m: f64,
    th: f64,
    mm: f64,
}

impl ArcMarginProduct {
    pub fn new(
        embed_dim: usize,
        num_class: usize,
        scale: f64,
        margin: f64,
        easy_margin: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut head = Self {
            weight: class_weight(num_class, embed_dim, &vb)?,
            num_class,
            scale,
            easy_margin,
            margin: 0.0,
            cos_m: 1.0,
            sin_m: 0.0,
            th: -1.0,
            mm: 0.0,
        };
        head.set_margin(margin);
        Ok(head)
    }

    fn set_margin(&mut self, margin: f64) {
        use std::f64::consts::PI;
        self.margin = margin;
        self.cos_m = margin.cos();
        self.sin_m = margin.sin();
        self.th = (PI - margin).cos();
        self.mm = (PI - margin).sin() * margin;
    }

    pub fn forward(&self, x: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let cos = cosine(x, &self.weight)?;
        let sin = (1.0 - cos.sqr()?)?.clamp(0f32, 1f32)?.sqrt()?;
        // cos(θ + m)
        let phi = ((&cos * self.cos_m)? - (&sin * self.sin_m)?)?;
        let phi = if self.easy_margin {
            cos.gt(0.0)?.where_cond(&phi, &cos)?
        } else {
            // past π - m, θ + m would wrap around; fall back to a linear penalty
            cos.gt(self.th)?.where_cond(&phi, &(&cos - self.mm)?)?
        };
        let mask = target_mask(labels, self.num_class)?;
        mask.where_cond(&phi, &cos)? * self.scale
    }
}

pub enum Projection {
    Linear(Linear),
    AddMargin(AddMarginProduct),
    ArcMargin(ArcMarginProduct),
}

impl Projection {
    /// Build the head named by `args.project_type`.
    ///
    /// Margin heads start at margin 0; the margin scheduler sets the initial
    /// margin when it is constructed.
    pub fn new(args: &ProjectionArgs, vb: VarBuilder) -> Result<Self> {
        let scale = args.scale.unwrap_or(DEFAULT_SCALE);
        match args.project_type.as_str() {
            "linear" | "softmax" => Ok(Projection::Linear(candle_nn::linear(
                args.embed_dim,
                args.num_class,
                vb,
            )?)),
            "add_margin" => Ok(Projection::AddMargin(AddMarginProduct::new(
                args.embed_dim,
                args.num_class,
                scale,
                0.0,
                vb,
            )?)),
            "arc_margin" => Ok(Projection::ArcMargin(ArcMarginProduct::new(
                args.embed_dim,
                args.num_class,
                scale,
                0.0,
                args.easy_margin,
                vb,
            )?)),
            other => Err(candle_core::Error::Msg(format!(
                "Unknown projection type: {}. Valid options: linear, add_margin, arc_margin",
                other
            ))),
        }
    }

    /// Logits for `embedding`; margin heads also need the target `labels`.
    pub fn forward(&self, embedding: &Tensor, labels: &Tensor) -> Result<Tensor> {
        match self {
            Projection::Linear(l) => l.forward(embedding),
            Projection::AddMargin(p) => p.forward(embedding, labels),
            Projection::ArcMargin(p) => p.forward(embedding, labels),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Projection::Linear(_) => "linear",
            Projection::AddMargin(_) => "add_margin",
            Projection::ArcMargin(_) => "arc_margin",
        }
    }
}

impl MarginUpdate for Projection {
    fn margin(&self) -> Option<f64> {
        match self {
            Projection::Linear(_) => None,
            Projection::AddMargin(p) => Some(p.margin),
            Projection::ArcMargin(p) => Some(p.margin),
        }
    }

    fn update_margin(&mut self, margin: f64) {
        match self {
            Projection::Linear(_) => {}
            Projection::AddMargin(p) => p.margin = margin,
            Projection::ArcMargin(p) => p.set_margin(margin),
        }
    }
}
