//! Mesh-TensorFlow style parameter initialization.
//!
//! Every learned tensor is requested through one of the helpers below with a
//! [`ParamRole`] describing its place in the architecture. When the
//! `VarBuilder` is backed by a `VarMap` the role decides the random
//! initialization; when it is backed by a checkpoint the hint is ignored and
//! the stored values win.

use candle::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

use super::config::Config;
use crate::models::with_tracing::{Embedding, Linear};

/// The role a parameter plays in the module tree. The attention projections
/// use the Mesh-TensorFlow standard deviations that make the customary
/// 1/sqrt(d) score scaling unnecessary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    LayerNorm,
    SharedEmbedding,
    LmHead,
    RelativeAttentionBias,
    FeedForwardWi,
    FeedForwardWo,
    AttentionQuery,
    AttentionKey,
    AttentionValue,
    AttentionOutput,
    VisualProjection { in_dim: usize },
}

impl ParamRole {
    pub fn init(self, cfg: &Config) -> Init {
        let factor = cfg.initializer_factor;
        let randn = |stdev: f64| Init::Randn { mean: 0., stdev };
        match self {
            Self::LayerNorm => Init::Const(factor),
            Self::SharedEmbedding | Self::LmHead => randn(factor),
            Self::RelativeAttentionBias => randn(factor * (cfg.d_model as f64).powf(-0.5)),
            Self::FeedForwardWi => randn(factor * (cfg.d_model as f64).powf(-0.5)),
            Self::FeedForwardWo => randn(factor * (cfg.d_ff as f64).powf(-0.5)),
            Self::AttentionQuery => randn(factor * ((cfg.d_model * cfg.d_kv) as f64).powf(-0.5)),
            Self::AttentionKey | Self::AttentionValue => {
                randn(factor * (cfg.d_model as f64).powf(-0.5))
            }
            Self::AttentionOutput => {
                randn(factor * ((cfg.num_heads * cfg.d_kv) as f64).powf(-0.5))
            }
            Self::VisualProjection { in_dim } => randn(factor * (in_dim as f64).powf(-0.5)),
        }
    }
}

pub(crate) fn linear(
    in_dim: usize,
    out_dim: usize,
    role: ParamRole,
    cfg: &Config,
    vb: VarBuilder,
) -> Result<Linear> {
    let ws = vb.get_with_hints((out_dim, in_dim), "weight", role.init(cfg))?;
    Ok(Linear::from_weights(ws, None))
}

pub(crate) fn embedding(
    in_size: usize,
    out_size: usize,
    role: ParamRole,
    cfg: &Config,
    vb: VarBuilder,
) -> Result<Embedding> {
    let ws = vb.get_with_hints((in_size, out_size), "weight", role.init(cfg))?;
    Embedding::from_weights(ws)
}

pub(crate) fn norm_weight(size: usize, cfg: &Config, vb: VarBuilder) -> Result<Tensor> {
    vb.get_with_hints(size, "weight", ParamRole::LayerNorm.init(cfg))
}
