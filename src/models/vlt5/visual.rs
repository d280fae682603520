use std::sync::Arc;

use candle::{DType, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use super::config::Config;
use super::init::{self, ParamRole};
use super::layers::VlT5LayerNorm;
use super::stack::{invert_attention_mask, StackOutput, VlT5Stack};
use crate::models::with_tracing::{Embedding, Linear};

/// Visual region input of one batch: appearance features `(batch, n, feat_dim)`
/// and box geometry `(batch, n, 4)` as `(x1, x2, y1, y2)`. The optional mask
/// covers the `2 * n` visual tokens the embedding produces.
#[derive(Debug, Clone, Copy)]
pub struct VisualFeatures<'a> {
    pub features: &'a Tensor,
    pub boxes: &'a Tensor,
    pub attention_mask: Option<&'a Tensor>,
}

impl<'a> VisualFeatures<'a> {
    pub fn new(features: &'a Tensor, boxes: &'a Tensor) -> Self {
        Self {
            features,
            boxes,
            attention_mask: None,
        }
    }
}

/// Projects region features and box geometry into model width. Appearance and
/// position embeddings become separate tokens, concatenated along the
/// sequence axis.
#[derive(Debug, Clone)]
pub struct VlT5VisualEmbedding {
    feat_proj: Linear,
    feat_layer_norm: Option<VlT5LayerNorm>,
    pos_proj: Linear,
    pos_layer_norm: Option<VlT5LayerNorm>,
    shared_layer_norm: Option<VlT5LayerNorm>,
    feat_dim: usize,
    pos_dim: usize,
    span: tracing::Span,
}

impl VlT5VisualEmbedding {
    pub(crate) fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let vb_feat = vb.pp("feat_embedding");
        let feat_proj = init::linear(
            cfg.feat_dim,
            cfg.d_model,
            ParamRole::VisualProjection { in_dim: cfg.feat_dim },
            cfg,
            vb_feat.pp("linear"),
        )?;
        let vb_pos = vb.pp("absolute_vis_pos_embedding");
        let pos_proj = init::linear(
            cfg.pos_dim + 1,
            cfg.d_model,
            ParamRole::VisualProjection { in_dim: cfg.pos_dim + 1 },
            cfg,
            vb_pos.pp("linear"),
        )?;
        let (feat_layer_norm, pos_layer_norm, shared_layer_norm) = if cfg.individual_vis_layer_norm
        {
            let feat_norm = if cfg.use_vis_layer_norm {
                Some(VlT5LayerNorm::load(cfg.d_model, vb_feat.pp("layer_norm"), cfg)?)
            } else {
                None
            };
            let pos_norm = if cfg.use_vis_layer_norm {
                Some(VlT5LayerNorm::load(cfg.d_model, vb_pos.pp("layer_norm"), cfg)?)
            } else {
                None
            };
            (feat_norm, pos_norm, None)
        } else {
            let shared_norm = if cfg.use_vis_layer_norm {
                Some(VlT5LayerNorm::load(cfg.d_model, vb.pp("layer_norm"), cfg)?)
            } else {
                None
            };
            (None, None, shared_norm)
        };
        Ok(Self {
            feat_proj,
            feat_layer_norm,
            pos_layer_norm,
            pos_proj,
            shared_layer_norm,
            feat_dim: cfg.feat_dim,
            pos_dim: cfg.pos_dim,
            span: tracing::span!(tracing::Level::TRACE, "visual-embedding"),
        })
    }

    /// Box area from `(x1, x2, y1, y2)` coordinates, `(batch, n, 1)`.
    fn box_area(boxes: &Tensor) -> Result<Tensor> {
        let x1 = boxes.narrow(2, 0, 1)?;
        let x2 = boxes.narrow(2, 1, 1)?;
        let y1 = boxes.narrow(2, 2, 1)?;
        let y2 = boxes.narrow(2, 3, 1)?;
        let width = (x2 - x1)?;
        let height = (y2 - y1)?;
        height * width
    }

    /// Embeds the regions, returning `(batch, 2 * n, d_model)`.
    pub fn forward(&self, features: &Tensor, boxes: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_b_sz, n_regions, feat_dim) = features.dims3()?;
        if feat_dim != self.feat_dim {
            candle::bail!(
                "expected visual features of width {}, got {feat_dim}",
                self.feat_dim
            )
        }
        let (_, n_boxes, pos_dim) = boxes.dims3()?;
        if n_boxes != n_regions || pos_dim != self.pos_dim {
            candle::bail!(
                "expected box coordinates of shape ({n_regions}, {}), got ({n_boxes}, {pos_dim})",
                self.pos_dim
            )
        }
        let mut feat_embedding = self.feat_proj.forward(features)?;
        if let Some(norm) = &self.feat_layer_norm {
            feat_embedding = norm.forward(&feat_embedding)?;
        }
        let pos = Tensor::cat(&[boxes, &Self::box_area(boxes)?], 2)?;
        let mut pos_embedding = self.pos_proj.forward(&pos)?;
        if let Some(norm) = &self.pos_layer_norm {
            pos_embedding = norm.forward(&pos_embedding)?;
        }
        let vis_embedding = Tensor::cat(&[&feat_embedding, &pos_embedding], 1)?;
        match &self.shared_layer_norm {
            Some(norm) => norm.forward(&vis_embedding),
            None => Ok(vis_embedding),
        }
    }
}

/// Encoder stack over the concatenation of text embeddings and visual tokens.
/// The relative position bias only covers the text block; visual tokens
/// attend with a zero bias, position information being carried by the box
/// embeddings instead.
#[derive(Debug, Clone)]
pub struct VlT5JointEncoder {
    stack: VlT5Stack,
    visual_embedding: VlT5VisualEmbedding,
}

impl VlT5JointEncoder {
    pub(crate) fn load(vb: VarBuilder, shared: &Arc<Embedding>, cfg: &Config) -> Result<Self> {
        if cfg.is_decoder {
            candle::bail!("the joint encoder cannot be configured as a decoder")
        }
        let stack = VlT5Stack::load(false, vb.clone(), shared, cfg)?;
        let visual_embedding = VlT5VisualEmbedding::load(vb.pp("visual_embedding"), cfg)?;
        Ok(Self {
            stack,
            visual_embedding,
        })
    }

    pub fn prune_heads(&mut self, layer: usize, heads: &[usize]) -> Result<()> {
        self.stack.prune_heads(layer, heads)
    }

    pub fn forward(
        &self,
        input_ids: Option<&Tensor>,
        inputs_embeds: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        visual: Option<&VisualFeatures>,
        output_attentions: bool,
    ) -> Result<StackOutput> {
        let visual = match visual {
            // Without visual inputs this is a plain text encoder stack.
            None => {
                return self.stack.forward(
                    input_ids,
                    inputs_embeds,
                    attention_mask,
                    None,
                    None,
                    None,
                    output_attentions,
                )
            }
            Some(visual) => visual,
        };
        let text_embeds = self.stack.embed_input(input_ids, inputs_embeds)?;
        let (b_sz, text_len, _) = text_embeds.dims3()?;
        let device = text_embeds.device().clone();
        let dtype = text_embeds.dtype();

        let vis_embeds = self
            .visual_embedding
            .forward(visual.features, visual.boxes)?;
        let vis_len = vis_embeds.dim(1)?;
        let hidden_states = Tensor::cat(&[&text_embeds, &vis_embeds], 1)?;

        let text_mask = match attention_mask {
            Some(mask) => mask.to_dtype(DType::F32)?,
            None => Tensor::ones((b_sz, text_len), DType::F32, &device)?,
        };
        let vis_mask = match visual.attention_mask {
            Some(mask) => mask.to_dtype(DType::F32)?,
            None => Tensor::ones((b_sz, vis_len), DType::F32, &device)?,
        };
        if vis_mask.dims() != [b_sz, vis_len] {
            candle::bail!(
                "visual attention mask shape {:?} does not match ({b_sz}, {vis_len})",
                vis_mask.dims()
            )
        }
        let joint_mask = Tensor::cat(&[&text_mask, &vis_mask], 1)?;
        let extended_mask = invert_attention_mask(&joint_mask, dtype)?;

        // The bucketed bias is sized for the text block and zero-extended over
        // the visual positions before the mask is folded in.
        let text_bias = self.stack.position_bias(text_len, text_len, &device)?;
        let position_bias = text_bias
            .pad_with_zeros(D::Minus1, 0, vis_len)?
            .pad_with_zeros(D::Minus2, 0, vis_len)?;
        let position_bias = position_bias.broadcast_add(&extended_mask)?;

        self.stack
            .run_blocks(hidden_states, &position_bias, None, None, None, output_attentions)
    }
}
