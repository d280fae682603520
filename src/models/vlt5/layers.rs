use candle::{DType, Module, Result, Tensor, D};
use candle_nn::{Activation, VarBuilder};

use super::attention::{AttentionOutput, VlT5Attention};
use super::config::Config;
use super::init::{self, ParamRole};
use super::stack::LayerKvCache;
use crate::models::with_tracing::Linear;

/// T5-style layer norm: no bias, no mean subtraction, variance in f32.
#[derive(Debug, Clone)]
pub struct VlT5LayerNorm {
    weight: Tensor,
    variance_epsilon: f64,
    span: tracing::Span,
}

impl VlT5LayerNorm {
    pub(crate) fn load(size: usize, vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let weight = init::norm_weight(size, cfg, vb)?;
        Ok(Self {
            weight,
            variance_epsilon: cfg.layer_norm_epsilon,
            span: tracing::span!(tracing::Level::TRACE, "layer-norm"),
        })
    }
}

impl Module for VlT5LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let dtype = xs.dtype();
        let xs_f32 = xs.to_dtype(DType::F32)?;
        let variance = xs_f32.sqr()?.mean_keepdim(D::Minus1)?;
        let xs = xs.broadcast_div(&(variance + self.variance_epsilon)?.sqrt()?)?;
        let xs = xs.to_dtype(dtype)?;
        xs.broadcast_mul(&self.weight)
    }
}

/// Placeholder for the dropout slots of the architecture; inference never
/// drops activations so this is the identity.
#[derive(Debug, Clone)]
pub struct Dropout {
    #[allow(dead_code)]
    pr: f64,
}

impl Dropout {
    pub(crate) fn new(pr: f64) -> Self {
        Self { pr }
    }
}

impl Module for Dropout {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(xs.clone())
    }
}

#[derive(Debug, Clone)]
struct VlT5DenseActDense {
    wi: Linear,
    wo: Linear,
    dropout: Dropout,
    act: Activation,
}

impl VlT5DenseActDense {
    fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let wi = init::linear(cfg.d_model, cfg.d_ff, ParamRole::FeedForwardWi, cfg, vb.pp("wi"))?;
        let wo = init::linear(cfg.d_ff, cfg.d_model, ParamRole::FeedForwardWo, cfg, vb.pp("wo"))?;
        Ok(Self {
            wi,
            wo,
            dropout: Dropout::new(cfg.dropout_rate),
            act: cfg.feed_forward_proj,
        })
    }
}

impl Module for VlT5DenseActDense {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.wi.forward(xs)?;
        let xs = self.act.forward(&xs)?;
        let xs = self.dropout.forward(&xs)?;
        self.wo.forward(&xs)
    }
}

#[derive(Debug, Clone)]
struct VlT5DenseGatedActDense {
    wi_0: Linear,
    wi_1: Linear,
    wo: Linear,
    dropout: Dropout,
    act: Activation,
}

impl VlT5DenseGatedActDense {
    fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let wi_0 =
            init::linear(cfg.d_model, cfg.d_ff, ParamRole::FeedForwardWi, cfg, vb.pp("wi_0"))?;
        let wi_1 =
            init::linear(cfg.d_model, cfg.d_ff, ParamRole::FeedForwardWi, cfg, vb.pp("wi_1"))?;
        let wo = init::linear(cfg.d_ff, cfg.d_model, ParamRole::FeedForwardWo, cfg, vb.pp("wo"))?;
        Ok(Self {
            wi_0,
            wi_1,
            wo,
            dropout: Dropout::new(cfg.dropout_rate),
            act: Activation::NewGelu,
        })
    }
}

impl Module for VlT5DenseGatedActDense {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden_gelu = self.act.forward(&self.wi_0.forward(xs)?)?;
        let hidden_linear = self.wi_1.forward(xs)?;
        let xs = hidden_gelu.broadcast_mul(&hidden_linear)?;
        let xs = self.dropout.forward(&xs)?;
        self.wo.forward(&xs)
    }
}

#[derive(Debug, Clone)]
pub struct VlT5LayerFF {
    dense_act: Option<VlT5DenseActDense>,
    gated_dense_act: Option<VlT5DenseGatedActDense>,
    layer_norm: VlT5LayerNorm,
    dropout: Dropout,
}

impl VlT5LayerFF {
    pub(crate) fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let layer_norm = VlT5LayerNorm::load(cfg.d_model, vb.pp("layer_norm"), cfg)?;
        let (dense_act, gated_dense_act) = if cfg.is_gated_act() {
            (None, Some(VlT5DenseGatedActDense::load(vb.pp("DenseReluDense"), cfg)?))
        } else {
            (Some(VlT5DenseActDense::load(vb.pp("DenseReluDense"), cfg)?), None)
        };
        Ok(Self {
            dense_act,
            gated_dense_act,
            layer_norm,
            dropout: Dropout::new(cfg.dropout_rate),
        })
    }
}

impl Module for VlT5LayerFF {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self.layer_norm.forward(xs)?;
        let ys = match &self.dense_act {
            Some(dense_act) => dense_act.forward(&ys)?,
            None => self.gated_dense_act.as_ref().unwrap().forward(&ys)?,
        };
        xs + self.dropout.forward(&ys)?
    }
}

#[derive(Debug, Clone)]
pub struct VlT5LayerSelfAttention {
    self_attention: VlT5Attention,
    layer_norm: VlT5LayerNorm,
    dropout: Dropout,
}

impl VlT5LayerSelfAttention {
    fn load(
        has_relative_attention_bias: bool,
        decoder: bool,
        vb: VarBuilder,
        cfg: &Config,
    ) -> Result<Self> {
        let self_attention =
            VlT5Attention::load(has_relative_attention_bias, decoder, vb.pp("SelfAttention"), cfg)?;
        let layer_norm = VlT5LayerNorm::load(cfg.d_model, vb.pp("layer_norm"), cfg)?;
        Ok(Self {
            self_attention,
            layer_norm,
            dropout: Dropout::new(cfg.dropout_rate),
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        position_bias: Option<&Tensor>,
        past_key_value: Option<&(Tensor, Tensor)>,
        use_cache: bool,
        output_attentions: bool,
    ) -> Result<AttentionOutput> {
        let normed_xs = self.layer_norm.forward(xs)?;
        let mut out = self.self_attention.forward(
            &normed_xs,
            None,
            None,
            position_bias,
            past_key_value,
            None,
            None,
            use_cache,
            output_attentions,
        )?;
        out.hidden_states = (xs + self.dropout.forward(&out.hidden_states)?)?;
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct VlT5LayerCrossAttention {
    cross_attention: VlT5Attention,
    layer_norm: VlT5LayerNorm,
    dropout: Dropout,
}

impl VlT5LayerCrossAttention {
    fn load(
        has_relative_attention_bias: bool,
        decoder: bool,
        vb: VarBuilder,
        cfg: &Config,
    ) -> Result<Self> {
        let cross_attention = VlT5Attention::load(
            has_relative_attention_bias,
            decoder,
            vb.pp("EncDecAttention"),
            cfg,
        )?;
        let layer_norm = VlT5LayerNorm::load(cfg.d_model, vb.pp("layer_norm"), cfg)?;
        Ok(Self {
            cross_attention,
            layer_norm,
            dropout: Dropout::new(cfg.dropout_rate),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        xs: &Tensor,
        key_value_states: &Tensor,
        position_bias: Option<&Tensor>,
        past_key_value: Option<&(Tensor, Tensor)>,
        query_length: Option<usize>,
        use_cache: bool,
    ) -> Result<AttentionOutput> {
        let normed_xs = self.layer_norm.forward(xs)?;
        let mut out = self.cross_attention.forward(
            &normed_xs,
            None,
            Some(key_value_states),
            position_bias,
            past_key_value,
            None,
            query_length,
            use_cache,
            false,
        )?;
        out.hidden_states = (xs + self.dropout.forward(&out.hidden_states)?)?;
        Ok(out)
    }
}

pub struct BlockOutput {
    pub hidden_states: Tensor,
    pub self_attn_weights: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct VlT5Block {
    self_attn: VlT5LayerSelfAttention,
    cross_attn: Option<VlT5LayerCrossAttention>,
    ff: VlT5LayerFF,
}

impl VlT5Block {
    pub(crate) fn load(
        has_relative_attention_bias: bool,
        decoder: bool,
        vb: VarBuilder,
        cfg: &Config,
    ) -> Result<Self> {
        let vb = vb.pp("layer");
        let self_attn =
            VlT5LayerSelfAttention::load(has_relative_attention_bias, decoder, vb.pp("0"), cfg)?;
        let cross_attn = if cfg.is_decoder {
            Some(VlT5LayerCrossAttention::load(
                has_relative_attention_bias,
                decoder,
                vb.pp("1"),
                cfg,
            )?)
        } else {
            None
        };
        let ff_i = if cross_attn.is_some() { 2 } else { 1 };
        let ff = VlT5LayerFF::load(vb.pp(ff_i.to_string()), cfg)?;
        Ok(Self {
            self_attn,
            cross_attn,
            ff,
        })
    }

    pub(crate) fn self_attention(&self) -> &VlT5Attention {
        &self.self_attn.self_attention
    }

    pub(crate) fn self_attention_mut(&mut self) -> &mut VlT5Attention {
        &mut self.self_attn.self_attention
    }

    pub(crate) fn cross_attention(&self) -> Option<&VlT5Attention> {
        self.cross_attn.as_ref().map(|c| &c.cross_attention)
    }

    pub(crate) fn forward(
        &self,
        xs: &Tensor,
        position_bias: Option<&Tensor>,
        encoder_hidden_states: Option<&Tensor>,
        encoder_decoder_position_bias: Option<&Tensor>,
        layer_cache: Option<&mut LayerKvCache>,
        output_attentions: bool,
    ) -> Result<BlockOutput> {
        let use_cache = layer_cache.is_some();
        let expects_cross = self.cross_attn.is_some() && encoder_hidden_states.is_some();
        let (past_self, past_cross) = match &layer_cache {
            Some(c) => {
                if c.self_attn.is_some() {
                    if expects_cross && c.cross_attn.is_none() {
                        candle::bail!(
                            "got 2 cached states, expected 4 (self- and cross-attention key/values)"
                        )
                    }
                    if !expects_cross && c.cross_attn.is_some() {
                        candle::bail!(
                            "got 4 cached states, expected 2 (self-attention key/values only)"
                        )
                    }
                } else if c.cross_attn.is_some() {
                    candle::bail!("cross-attention cache populated without a self-attention cache")
                }
                (c.self_attn.clone(), c.cross_attn.clone())
            }
            None => (None, None),
        };

        let self_out = self.self_attn.forward(
            xs,
            position_bias,
            past_self.as_ref(),
            use_cache,
            output_attentions,
        )?;
        let mut hidden_states = self_out.hidden_states;

        // The query length is unknown to the cross attention when only the
        // newest token is fed in; recover it from the self-attention cache.
        let query_length = match &self_out.present_key_value {
            Some((k, _)) => Some(k.dim(2)?),
            None => None,
        };

        let mut present_cross = None;
        if let Some(cross_attn) = &self.cross_attn {
            if let Some(encoder_hidden_states) = encoder_hidden_states {
                let cross_out = cross_attn.forward(
                    &hidden_states,
                    encoder_hidden_states,
                    encoder_decoder_position_bias,
                    past_cross.as_ref(),
                    query_length,
                    use_cache,
                )?;
                hidden_states = cross_out.hidden_states;
                present_cross = cross_out.present_key_value;
            }
        }

        if let Some(c) = layer_cache {
            c.self_attn = self_out.present_key_value;
            c.cross_attn = present_cross;
        }

        let hidden_states = self.ff.forward(&hidden_states)?;
        Ok(BlockOutput {
            hidden_states,
            self_attn_weights: self_out.weights,
        })
    }
}
